//! Team node: join/leave lifecycle, domain operations, and heartbeats.
//!
//! A node either hosts the listener (and becomes the coordinator) or dials
//! an existing coordinator. In both cases every domain operation travels as
//! a team request over the node's own connection, so the coordinator applies
//! its own calls exactly like a follower's. A node that never joined applies
//! its calls locally and acts alone.
//!
//! The coordinator is never replaced: if it leaves, followers keep their
//! last replica and their connections end.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::analytics::{MemoryAnalytics, TeamAnalytics};
use super::calls::{
    AttachParams, BroadcastParams, HandoffParams, HeartbeatParams, LedgerParams, LeaveParams,
    ModeParams, RegisterParams, TeamCall,
};
use super::coordinator::TeamHandler;
use super::events::{EventStream, TeamEvent};
use super::models::{
    default_role, LedgerEntry, LedgerSummary, TeamMetrics, TeamNode, TeamSnapshot, TeamState,
};
use super::shared::{TeamCore, TeamPhase};
use super::store::{CapabilityRecord, TeamStore};
use crate::config::TeamConfig;
use crate::crypto::{keys, Cipher};
use crate::rpc::{Connection, ProtocolEngine, RpcHandler};
use crate::{AppError, Result};

/// Arguments of [`TeamManager::join`].
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOptions {
    /// Coordinator to dial; `None` falls back to the configured broker and,
    /// failing that, hosts a new team.
    pub address: Option<String>,
    /// Capabilities advertised at registration.
    pub capabilities: Map<String, Value>,
    /// Advertised role.
    pub role: String,
    /// Read-only flag.
    pub read_only: bool,
    /// Team id to create (when hosting) or request.
    pub team_id: Option<String>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            address: None,
            capabilities: Map::new(),
            role: default_role(),
            read_only: false,
            team_id: None,
        }
    }
}

impl JoinOptions {
    /// Host a new team (unless a broker is configured).
    #[must_use]
    pub fn host() -> Self {
        Self::default()
    }

    /// Dial the coordinator at `address`.
    #[must_use]
    pub fn connect(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Set the team id.
    #[must_use]
    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Set the advertised role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Set the read-only flag.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the advertised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Map<String, Value>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// One agent process's membership in a team.
pub struct TeamManager {
    core: Arc<TeamCore>,
    handler: Arc<TeamHandler>,
}

impl TeamManager {
    /// Open a node rooted at `config.root`, resolving the network key and
    /// using in-memory analytics.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] or [`AppError::Io`] if the key cannot be
    /// resolved, and [`AppError::Persistence`] if the root cannot be created.
    pub fn open(config: TeamConfig) -> Result<Self> {
        let cipher = keys::load_cipher(&config)?;
        Self::with_parts(config, Arc::new(cipher), Arc::new(MemoryAnalytics::new()))
    }

    /// Open a node with an explicit cipher and analytics collaborator.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the root cannot be created.
    pub fn with_parts(
        config: TeamConfig,
        cipher: Arc<dyn Cipher>,
        analytics: Arc<dyn TeamAnalytics>,
    ) -> Result<Self> {
        let store = TeamStore::open(&config.root)?;
        let host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".into());
        let node_id = Uuid::new_v4().simple().to_string();
        let engine = ProtocolEngine::new(cipher);

        let core = Arc::new(TeamCore::new(config, node_id, host, engine, store, analytics));
        let handler = Arc::new(TeamHandler::new(Arc::downgrade(&core)));
        Ok(Self { core, handler })
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.core.node_id
    }

    /// Host name advertised at registration.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.core.host
    }

    /// Configuration the node was opened with.
    #[must_use]
    pub fn config(&self) -> &TeamConfig {
        &self.core.config
    }

    /// Underlying protocol engine.
    #[must_use]
    pub fn engine(&self) -> &ProtocolEngine {
        &self.core.engine
    }

    /// Team id, once known.
    pub async fn team_id(&self) -> Option<String> {
        self.core.state.lock().await.team_id.clone()
    }

    /// Address of the coordinator, once joined.
    pub async fn broker_address(&self) -> Option<String> {
        self.core.state.lock().await.broker_address.clone()
    }

    /// Whether this node hosts the team listener.
    pub async fn is_coordinator(&self) -> bool {
        self.core.is_coordinator().await
    }

    /// Lifecycle phase.
    pub async fn phase(&self) -> TeamPhase {
        self.core.session.lock().await.phase
    }

    /// Connection to the coordinator, while joined.
    pub async fn connection(&self) -> Option<Connection> {
        self.core.connection().await
    }

    /// Local view of the team; `None` before a team id is known.
    pub async fn state(&self) -> Option<TeamState> {
        self.core.team_state().await
    }

    /// Known nodes, ordered by node id.
    pub async fn list_nodes(&self) -> Vec<TeamNode> {
        self.core.state.lock().await.nodes.values().cloned().collect()
    }

    /// Subscribe to local team events.
    pub fn subscribe(&self) -> EventStream {
        self.core.bus.subscribe()
    }

    /// Join a team, or host one when no coordinator address is known.
    ///
    /// Calling `join` while already joined returns the current state.
    ///
    /// # Errors
    ///
    /// - [`AppError::Io`] if the listener cannot be bound.
    /// - [`AppError::TransportClosed`] if the coordinator cannot be reached.
    /// - [`AppError::Remote`] or [`AppError::Timeout`] if `register` fails.
    /// - [`AppError::Persistence`] if persisted documents cannot be read or
    ///   the capability record cannot be written.
    pub async fn join(&self, options: JoinOptions) -> Result<TeamState> {
        let stale = {
            let mut session = self.core.session.lock().await;
            let phase = session.phase;
            let live = session
                .connection
                .as_ref()
                .is_some_and(|connection| !connection.is_closed());
            match phase {
                TeamPhase::Joining => {
                    return Err(AppError::Handler("join already in progress".into()));
                }
                TeamPhase::Joined if live => {
                    drop(session);
                    return self.joined_state().await;
                }
                _ => {}
            }
            session.phase = TeamPhase::Joining;
            if live {
                None
            } else {
                session.connection.take()
            }
        };
        // A dead link means the old coordinator is gone; its replica goes too.
        if let Some(connection) = stale {
            debug!(peer_id = connection.peer_id(), "dropping closed coordinator connection");
            connection.close();
            self.core.clear().await;
        }

        let span = info_span!("team_join", node_id = %self.core.node_id);
        match self.join_inner(options).instrument(span).await {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(error = %err, "join failed");
                let (connection, listener) = {
                    let mut session = self.core.session.lock().await;
                    session.phase = TeamPhase::Unjoined;
                    (session.connection.take(), session.listener.take())
                };
                if let Some(connection) = connection {
                    connection.close();
                }
                if let Some(listener) = listener {
                    listener.close().await;
                }
                self.core.clear().await;
                Err(err)
            }
        }
    }

    /// Leave the team. Safe to call repeatedly and before `join`.
    ///
    /// Sends a best-effort `leave` notification, closes the connection and,
    /// on the coordinator, the listener. Persisted documents are kept.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for collaborators
    /// whose shutdown can fail.
    pub async fn leave(&self) -> Result<()> {
        let (connection, listener, heartbeat) = {
            let mut session = self.core.session.lock().await;
            if session.connection.is_none() && session.listener.is_none() {
                return Ok(());
            }
            // Without explicit cancellation the task stays registered and
            // stops on its next tick, when it finds no connection.
            let heartbeat = if self.core.config.cancel_heartbeat_on_leave {
                session.heartbeat.take()
            } else {
                None
            };
            (session.connection.take(), session.listener.take(), heartbeat)
        };

        if let Some(connection) = connection {
            let params = LeaveParams {
                node_id: Some(self.core.node_id.clone()),
            };
            let sent = serde_json::to_value(params)
                .map_err(AppError::from)
                .and_then(|params| connection.notify("leave", &params));
            if let Err(err) = sent {
                debug!(error = %err, "leave notification not delivered");
            }
            connection.close();
        }

        if let Some((handle, cancel)) = heartbeat {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(%err, "heartbeat task ended abnormally");
            }
        }

        self.core.clear().await;
        self.core.publish(&TeamEvent::Leave {
            node: self.core.node_id.clone(),
        });

        if let Some(listener) = listener {
            listener.close().await;
        }

        self.core.session.lock().await.phase = TeamPhase::Left;
        info!(node_id = %self.core.node_id, "left team");
        Ok(())
    }

    /// Send a message to every node of the team.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying `broadcast` request.
    pub async fn broadcast(&self, message: impl Into<String>, payload: Value) -> Result<()> {
        let params = BroadcastParams {
            node_id: Some(self.core.node_id.clone()),
            message: message.into(),
            payload,
        };
        let event = TeamEvent::Broadcast {
            message: params.message.clone(),
            payload: params.payload.clone(),
            node: params.node_id.clone(),
        };
        self.submit(TeamCall::Broadcast(params), Some(event)).await
    }

    /// Change the shared mode, last write wins.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying `mode` request.
    pub async fn set_mode(&self, mode: impl Into<String>) -> Result<()> {
        let mode = mode.into();
        self.submit(
            TeamCall::Mode(ModeParams { mode: mode.clone() }),
            Some(TeamEvent::Mode { mode }),
        )
        .await
    }

    /// Claim `repo` for this node, last write wins.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying `attach` request.
    pub async fn attach_repo(&self, repo: impl Into<String>, path: impl Into<String>) -> Result<()> {
        let params = AttachParams {
            node_id: self.core.node_id.clone(),
            repo: repo.into(),
            path: path.into(),
        };
        let event = TeamEvent::Attach {
            repo: params.repo.clone(),
            path: params.path.clone(),
            node: params.node_id.clone(),
        };
        self.submit(TeamCall::Attach(params), Some(event)).await
    }

    /// Hand `task` on `repo` to `target` (or whoever picks it up).
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying `handoff` request.
    pub async fn handoff(
        &self,
        repo: impl Into<String>,
        task: impl Into<String>,
        target: Option<String>,
    ) -> Result<()> {
        let params = HandoffParams {
            repo: repo.into(),
            task: task.into(),
            source: self.core.node_id.clone(),
            target,
        };
        let event = TeamEvent::Handoff {
            repo: params.repo.clone(),
            task: params.task.clone(),
            source: params.source.clone(),
            target: params.target.clone(),
        };
        self.submit(TeamCall::Handoff(params), Some(event)).await
    }

    /// Record budget usage, attributed to `actor` or this node.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying `ledger` request, or
    /// [`AppError::Persistence`] when acting alone and the ledger cannot be
    /// written.
    pub async fn record_budget(
        &self,
        tokens: f64,
        minutes: f64,
        reason: impl Into<String>,
        actor: Option<String>,
    ) -> Result<()> {
        let entry = LedgerEntry::now(
            actor.unwrap_or_else(|| self.core.node_id.clone()),
            tokens,
            minutes,
            reason,
        );
        let event = TeamEvent::Ledger {
            entry: entry.clone(),
        };
        self.submit(
            TeamCall::Ledger(LedgerParams { entry: Some(entry) }),
            Some(event),
        )
        .await
    }

    /// Totals over the local ledger.
    pub async fn ledger_summary(&self) -> LedgerSummary {
        LedgerSummary::from_entries(self.core.ledger.lock().await.clone())
    }

    /// Team metrics from the analytics collaborator.
    ///
    /// # Errors
    ///
    /// Returns whatever the analytics collaborator returns.
    pub async fn team_metrics(&self) -> Result<TeamMetrics> {
        let team_id = self.core.team_id_or_local().await;
        self.core.analytics.snapshot(team_id).await
    }

    async fn join_inner(&self, options: JoinOptions) -> Result<TeamState> {
        let configured = options
            .address
            .clone()
            .or_else(|| self.core.config.broker.clone());
        let address = match configured {
            Some(address) => address,
            None => self.host_team(options.team_id.clone()).await?,
        };

        let existing = self
            .core
            .connection()
            .await
            .filter(|connection| !connection.is_closed());
        let connection = match existing {
            Some(connection) => connection,
            None => {
                let handler: Arc<dyn RpcHandler> = self.handler.clone();
                let connection = self.core.engine.connect(&address, handler).await?;
                self.core.session.lock().await.connection = Some(connection.clone());
                connection
            }
        };

        let register = TeamCall::Register(RegisterParams {
            node_id: self.core.node_id.clone(),
            name: self.core.config.node_name.clone(),
            host: self.core.host.clone(),
            role: options.role,
            read_only: options.read_only,
            capabilities: options.capabilities.clone(),
            team_id: options.team_id,
        });
        let reply = self
            .core
            .call(&connection, register.method(), register.params()?)
            .await?;
        let snapshot: TeamSnapshot = serde_json::from_value(reply)
            .map_err(|err| AppError::MalformedFrame(format!("invalid register reply: {err}")))?;

        if !self.core.is_coordinator().await {
            self.core.adopt_snapshot(&snapshot).await;
        }
        self.core.state.lock().await.broker_address = Some(address.clone());

        let record = CapabilityRecord {
            node_id: self.core.node_id.clone(),
            name: self.core.config.node_name.clone(),
            host: self.core.host.clone(),
            capabilities: options.capabilities,
            timestamp: Utc::now(),
        };
        self.core
            .store
            .write_capabilities(&snapshot.team_id, &record)
            .await?;

        info!(team_id = %snapshot.team_id, broker = %address, nodes = snapshot.nodes.len(), "joined team");
        self.core.publish(&TeamEvent::TeamJoined { team: snapshot });

        {
            let mut session = self.core.session.lock().await;
            let running = session
                .heartbeat
                .as_ref()
                .is_some_and(|(handle, _)| !handle.is_finished());
            if !running {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(
                    run_heartbeat(Arc::downgrade(&self.core), cancel.clone())
                        .instrument(info_span!("team_heartbeat", node_id = %self.core.node_id)),
                );
                session.heartbeat = Some((handle, cancel));
            }
            session.phase = TeamPhase::Joined;
        }

        self.joined_state().await
    }

    /// Bind the listener, pick the team id, and restore its documents.
    async fn host_team(&self, requested: Option<String>) -> Result<String> {
        let handler: Arc<dyn RpcHandler> = self.handler.clone();
        let listener = self
            .core
            .engine
            .serve(&self.core.config.listen_address(), handler)
            .await?;
        let address = listener.local_addr().to_string();
        self.core.session.lock().await.listener = Some(listener);

        let team_id = {
            let state = self.core.state.lock().await;
            requested
                .or_else(|| state.team_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
        };
        let ledger = self.core.store.load_ledger(&team_id).await?;
        let attachments = self.core.store.load_attachments(&team_id).await?;
        debug!(%team_id, entries = ledger.len(), attachments = attachments.len(), "restored team documents");

        let mut restored = self.core.ledger.lock().await;
        let mut state = self.core.state.lock().await;
        if restored.is_empty() {
            *restored = ledger;
        }
        if state.attachments.is_empty() {
            state.attachments = attachments;
        }
        state.team_id = Some(team_id.clone());
        state.broker_address = Some(address.clone());

        info!(%team_id, broker = %address, "hosting team");
        Ok(address)
    }

    async fn joined_state(&self) -> Result<TeamState> {
        self.core
            .team_state()
            .await
            .ok_or_else(|| AppError::NotJoined("register did not yield a team id".into()))
    }

    /// Send `call` to the coordinator, or apply it locally when acting alone.
    ///
    /// A follower mirrors its own successful call into its replica and
    /// publishes `event`; the coordinator already did both while handling it.
    async fn submit(&self, call: TeamCall, event: Option<TeamEvent>) -> Result<()> {
        let Some(connection) = self.core.connection().await else {
            self.handler.dispatch(call, None).await?;
            return Ok(());
        };

        let method = call.method();
        self.core.call(&connection, method, call.params()?).await?;
        if self.core.is_coordinator().await {
            return Ok(());
        }

        match &call {
            TeamCall::Ledger(LedgerParams { entry: Some(entry) }) => {
                self.core.ledger.lock().await.push(entry.clone());
            }
            TeamCall::Attach(params) => {
                self.core
                    .state
                    .lock()
                    .await
                    .attach(&params.repo, &params.node_id);
            }
            TeamCall::Mode(params) => {
                self.core.state.lock().await.mode.clone_from(&params.mode);
            }
            _ => {}
        }
        if let Some(event) = event {
            self.core.publish(&event);
        }
        debug!(method, "team call applied");
        Ok(())
    }
}

impl std::fmt::Debug for TeamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamManager")
            .field("node_id", &self.core.node_id)
            .field("host", &self.core.host)
            .finish_non_exhaustive()
    }
}

/// Heartbeat loop: one `heartbeat` notification per interval until the
/// connection is gone, the first send fails, or `cancel` fires.
async fn run_heartbeat(core: Weak<TeamCore>, cancel: CancellationToken) {
    loop {
        let interval = match core.upgrade() {
            Some(core) => core.heartbeat_interval(),
            None => break,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("heartbeat cancelled");
                break;
            }
            () = tokio::time::sleep(interval) => {}
        }

        let Some(core) = core.upgrade() else {
            break;
        };
        let Some(connection) = core.connection().await else {
            debug!("no connection, heartbeat stopped");
            break;
        };
        let sent = serde_json::to_value(HeartbeatParams {
            node_id: core.node_id.clone(),
        })
        .map_err(AppError::from)
        .and_then(|params| connection.notify("heartbeat", &params));
        if let Err(err) = sent {
            debug!(error = %err, "heartbeat send failed, stopping");
            break;
        }
    }
}
