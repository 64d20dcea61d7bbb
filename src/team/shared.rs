//! State shared by the team manager, its coordinator handlers, and its
//! heartbeat task.
//!
//! Lock order: `ledger` before `state`. `session` is never held across
//! either of the other two.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::analytics::TeamAnalytics;
use super::events::{EventBus, TeamEvent};
use super::models::{default_mode, LedgerEntry, TeamNode, TeamSnapshot, TeamState};
use super::store::TeamStore;
use crate::config::TeamConfig;
use crate::rpc::{Connection, Listener, ProtocolEngine};
use crate::Result;

/// Team id used for analytics while the node acts alone.
pub const LOCAL_TEAM: &str = "local";

/// Lifecycle of a [`TeamManager`](super::TeamManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamPhase {
    /// Never joined.
    Unjoined,
    /// `join` in progress.
    Joining,
    /// `register` succeeded.
    Joined,
    /// `leave` completed.
    Left,
}

/// Replicated team view, mutated by domain calls.
#[derive(Debug)]
pub(crate) struct LocalState {
    pub(crate) team_id: Option<String>,
    pub(crate) broker_address: Option<String>,
    pub(crate) mode: String,
    pub(crate) nodes: BTreeMap<String, TeamNode>,
    pub(crate) attachments: BTreeMap<String, String>,
}

impl LocalState {
    fn new() -> Self {
        Self {
            team_id: None,
            broker_address: None,
            mode: default_mode(),
            nodes: BTreeMap::new(),
            attachments: BTreeMap::new(),
        }
    }

    /// Record `repo -> node_id`, moving the repo between node lists.
    pub(crate) fn attach(&mut self, repo: &str, node_id: &str) {
        if let Some(previous) = self.attachments.insert(repo.to_owned(), node_id.to_owned()) {
            if let Some(node) = self.nodes.get_mut(&previous) {
                node.repositories.retain(|owned| owned != repo);
            }
        }
        if let Some(node) = self.nodes.get_mut(node_id) {
            if !node.repositories.iter().any(|owned| owned == repo) {
                node.repositories.push(repo.to_owned());
            }
        }
    }

    /// Move `last_seen` forward; never backwards, even if the clock does.
    pub(crate) fn touch(&mut self, node_id: &str, now: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_seen = node.last_seen.max(now);
                true
            }
            None => false,
        }
    }
}

/// Connection-level bookkeeping.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) phase: TeamPhase,
    pub(crate) connection: Option<Connection>,
    pub(crate) listener: Option<Listener>,
    pub(crate) heartbeat: Option<(JoinHandle<()>, CancellationToken)>,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: TeamPhase::Unjoined,
            connection: None,
            listener: None,
            heartbeat: None,
        }
    }
}

pub(crate) struct TeamCore {
    pub(crate) config: TeamConfig,
    pub(crate) node_id: String,
    pub(crate) host: String,
    pub(crate) engine: ProtocolEngine,
    pub(crate) store: TeamStore,
    pub(crate) analytics: Arc<dyn TeamAnalytics>,
    pub(crate) bus: EventBus,
    pub(crate) state: Mutex<LocalState>,
    pub(crate) ledger: Mutex<Vec<LedgerEntry>>,
    pub(crate) session: Mutex<Session>,
}

impl TeamCore {
    pub(crate) fn new(
        config: TeamConfig,
        node_id: String,
        host: String,
        engine: ProtocolEngine,
        store: TeamStore,
        analytics: Arc<dyn TeamAnalytics>,
    ) -> Self {
        Self {
            config,
            node_id,
            host,
            engine,
            store,
            analytics,
            bus: EventBus::new(),
            state: Mutex::new(LocalState::new()),
            ledger: Mutex::new(Vec::new()),
            session: Mutex::new(Session::new()),
        }
    }

    pub(crate) fn publish(&self, event: &TeamEvent) {
        self.bus.publish(event);
    }

    pub(crate) async fn is_coordinator(&self) -> bool {
        self.session.lock().await.listener.is_some()
    }

    pub(crate) async fn connection(&self) -> Option<Connection> {
        self.session.lock().await.connection.clone()
    }

    /// Send a team request, bounded by `request_timeout_seconds` when set.
    pub(crate) async fn call(&self, connection: &Connection, method: &str, params: Value) -> Result<Value> {
        match self.config.request_timeout() {
            Some(limit) => connection.request_with_timeout(method, params, limit).await,
            None => connection.request(method, params).await,
        }
    }

    /// Append under the ledger lock, persist, then forward and publish.
    pub(crate) async fn append_ledger(&self, entry: LedgerEntry) -> Result<()> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.push(entry.clone());
            self.persist_locked(&ledger).await?;
        }

        let team_id = self.team_id_or_local().await;
        if let Err(err) = self.analytics.record_entry(team_id, entry.clone()).await {
            warn!(error = %err, "analytics rejected ledger entry");
        }
        self.publish(&TeamEvent::Ledger { entry });
        Ok(())
    }

    /// Persist both documents; takes the ledger lock.
    pub(crate) async fn persist(&self) -> Result<()> {
        let ledger = self.ledger.lock().await;
        self.persist_locked(&ledger).await
    }

    /// Persist both documents while the caller holds the ledger lock.
    async fn persist_locked(&self, ledger: &[LedgerEntry]) -> Result<()> {
        let (team_id, attachments) = {
            let state = self.state.lock().await;
            (state.team_id.clone(), state.attachments.clone())
        };
        let Some(team_id) = team_id else {
            debug!("no team id yet, skipping persistence");
            return Ok(());
        };
        self.store.persist(&team_id, ledger, &attachments).await
    }

    pub(crate) async fn team_id_or_local(&self) -> String {
        self.state
            .lock()
            .await
            .team_id
            .clone()
            .unwrap_or_else(|| LOCAL_TEAM.to_owned())
    }

    /// Full snapshot as returned by `register`.
    pub(crate) async fn snapshot(&self) -> TeamSnapshot {
        let ledger = self.ledger.lock().await.clone();
        let state = self.state.lock().await;
        TeamSnapshot {
            team_id: state.team_id.clone().unwrap_or_default(),
            mode: state.mode.clone(),
            nodes: state.nodes.values().cloned().collect(),
            ledger,
            attachments: state.attachments.clone(),
        }
    }

    /// Local view, `None` until a team id is known.
    pub(crate) async fn team_state(&self) -> Option<TeamState> {
        let ledger = self.ledger.lock().await.clone();
        let state = self.state.lock().await;
        let team_id = state.team_id.clone()?;
        Some(TeamState {
            team_id,
            broker_address: state.broker_address.clone().unwrap_or_default(),
            mode: state.mode.clone(),
            nodes: state.nodes.clone(),
            ledger,
            attachments: state.attachments.clone(),
        })
    }

    /// Replace the local view with a coordinator snapshot.
    pub(crate) async fn adopt_snapshot(&self, snapshot: &TeamSnapshot) {
        let mut ledger = self.ledger.lock().await;
        let mut state = self.state.lock().await;
        ledger.clone_from(&snapshot.ledger);
        state.team_id = Some(snapshot.team_id.clone());
        state.mode.clone_from(&snapshot.mode);
        state.nodes = snapshot
            .nodes
            .iter()
            .map(|node| (node.node_id.clone(), node.clone()))
            .collect();
        state.attachments.clone_from(&snapshot.attachments);
    }

    /// Drop the in-memory team view; persisted documents stay on disk.
    pub(crate) async fn clear(&self) {
        let mut ledger = self.ledger.lock().await;
        let mut state = self.state.lock().await;
        ledger.clear();
        *state = LocalState::new();
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval()
    }
}
