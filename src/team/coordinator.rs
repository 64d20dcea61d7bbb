//! Coordinator-side handlers for team calls.
//!
//! Every node installs a [`TeamHandler`] on its connections, but only the
//! node hosting the listener receives domain requests. Followers see
//! `team.event` notifications relayed by the coordinator.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::calls::{
    AttachParams, BroadcastParams, HandoffParams, LedgerParams, LeaveParams, ModeParams,
    RegisterParams, StatusReply, TeamCall,
};
use super::events::TeamEvent;
use super::models::{TeamNode, TeamSnapshot};
use super::shared::TeamCore;
use crate::rpc::connection::NODE_ID_KEY;
use crate::rpc::{Connection, Direction, HandlerFuture, RpcHandler};
use crate::{AppError, Result};

/// Method name of relayed events.
pub const EVENT_METHOD: &str = "team.event";

/// [`RpcHandler`] applying team calls to a node's shared state.
pub struct TeamHandler {
    core: Weak<TeamCore>,
}

impl TeamHandler {
    pub(crate) fn new(core: Weak<TeamCore>) -> Self {
        Self { core }
    }

    fn core(&self) -> Result<Arc<TeamCore>> {
        self.core
            .upgrade()
            .ok_or_else(|| AppError::Handler("team manager has been dropped".into()))
    }

    /// Apply `call`. `origin` is the connection it arrived on, `None` when
    /// the node applies its own call while standalone.
    pub(crate) async fn dispatch(
        &self,
        call: TeamCall,
        origin: Option<&Connection>,
    ) -> Result<Value> {
        let core = self.core()?;
        match call {
            TeamCall::Register(params) => {
                let snapshot = register(&core, params, origin).await;
                serde_json::to_value(snapshot).map_err(|err| AppError::Handler(err.to_string()))
            }
            TeamCall::Ledger(params) => ledger(&core, params).await,
            TeamCall::Broadcast(params) => broadcast(&core, params, origin).await,
            TeamCall::Attach(params) => attach(&core, params).await,
            TeamCall::Handoff(params) => handoff(&core, params, origin).await,
            TeamCall::Mode(params) => mode(&core, params, origin).await,
            TeamCall::Heartbeat(params) => {
                if !core.state.lock().await.touch(&params.node_id, Utc::now()) {
                    debug!(node_id = %params.node_id, "heartbeat from unregistered node ignored");
                }
                reply(&StatusReply::ok())
            }
            TeamCall::Leave(params) => {
                leave(&core, params, origin).await;
                reply(&StatusReply::ok())
            }
            TeamCall::Event(event) => {
                // Relays only flow down from the coordinator we dialed.
                if let Some(conn) = origin.filter(|c| c.direction() != Direction::Outbound) {
                    warn!(peer = %conn.peer_id(), "team.event from an inbound peer rejected");
                    return Err(AppError::InvalidParams(
                        "team.event is only accepted from the coordinator".into(),
                    ));
                }
                apply_relayed(&core, event).await;
                reply(&StatusReply::ok())
            }
        }
    }
}

impl RpcHandler for TeamHandler {
    fn handle_request(
        &self,
        method: String,
        params: Value,
        connection: Connection,
    ) -> HandlerFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call = TeamCall::from_wire(&method, params)?;
            self.dispatch(call, Some(&connection)).await
        })
    }

    fn handle_notification(
        &self,
        method: String,
        params: Value,
        connection: Connection,
    ) -> HandlerFuture<'_, ()> {
        Box::pin(async move {
            let outcome = match TeamCall::from_wire(&method, params) {
                Ok(call) => self.dispatch(call, Some(&connection)).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                warn!(%method, peer_id = connection.peer_id(), error = %err, "team notification failed");
            }
        })
    }
}

fn reply<T: Serialize>(body: &T) -> Result<Value> {
    serde_json::to_value(body).map_err(|err| AppError::Handler(err.to_string()))
}

async fn register(
    core: &TeamCore,
    params: RegisterParams,
    origin: Option<&Connection>,
) -> TeamSnapshot {
    if let Some(connection) = origin {
        connection.set_metadata(NODE_ID_KEY, params.node_id.clone());
    }

    let node = TeamNode {
        node_id: params.node_id.clone(),
        name: params.name,
        host: params.host,
        role: params.role,
        read_only: params.read_only,
        capabilities: params.capabilities,
        last_seen: Utc::now(),
        repositories: Vec::new(),
    };

    let team_id = {
        let mut state = core.state.lock().await;
        let team_id = state
            .team_id
            .get_or_insert_with(|| {
                params
                    .team_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
            })
            .clone();
        let repositories: Vec<String> = state
            .attachments
            .iter()
            .filter(|(_, owner)| **owner == node.node_id)
            .map(|(repo, _)| repo.clone())
            .collect();
        state.nodes.insert(
            node.node_id.clone(),
            TeamNode {
                repositories,
                ..node.clone()
            },
        );
        team_id
    };

    info!(%team_id, node_id = %node.node_id, name = %node.name, "node registered");
    core.publish(&TeamEvent::Join { node });
    core.snapshot().await
}

async fn ledger(core: &TeamCore, params: LedgerParams) -> Result<Value> {
    let Some(entry) = params.entry else {
        return reply(&StatusReply::ignored());
    };
    core.append_ledger(entry).await?;
    reply(&StatusReply::ok())
}

async fn broadcast(
    core: &TeamCore,
    params: BroadcastParams,
    origin: Option<&Connection>,
) -> Result<Value> {
    let node = params
        .node_id
        .or_else(|| origin.and_then(Connection::node_id));
    let event = TeamEvent::Broadcast {
        message: params.message,
        payload: params.payload,
        node,
    };
    core.publish(&event);
    relay(core, &event, origin).await;
    reply(&StatusReply::ok())
}

async fn attach(core: &TeamCore, params: AttachParams) -> Result<Value> {
    if params.repo.is_empty() || params.node_id.is_empty() {
        return Err(AppError::InvalidParams(
            "attach: repo and node_id must not be empty".into(),
        ));
    }
    core.state.lock().await.attach(&params.repo, &params.node_id);
    core.persist().await?;
    core.publish(&TeamEvent::Attach {
        repo: params.repo,
        path: params.path,
        node: params.node_id,
    });
    reply(&StatusReply::ok())
}

async fn handoff(
    core: &TeamCore,
    params: HandoffParams,
    origin: Option<&Connection>,
) -> Result<Value> {
    let event = TeamEvent::Handoff {
        repo: params.repo,
        task: params.task,
        source: params.source,
        target: params.target,
    };
    core.publish(&event);
    relay(core, &event, origin).await;
    reply(&StatusReply::ok())
}

async fn mode(core: &TeamCore, params: ModeParams, origin: Option<&Connection>) -> Result<Value> {
    core.state.lock().await.mode.clone_from(&params.mode);
    let event = TeamEvent::Mode { mode: params.mode };
    core.publish(&event);
    relay(core, &event, origin).await;
    reply(&StatusReply::ok())
}

async fn leave(core: &TeamCore, params: LeaveParams, origin: Option<&Connection>) {
    let Some(node_id) = params
        .node_id
        .or_else(|| origin.and_then(Connection::node_id))
    else {
        return;
    };
    // The local node announces its own departure from `TeamManager::leave`.
    if node_id == core.node_id {
        return;
    }
    if core.state.lock().await.nodes.remove(&node_id).is_some() {
        info!(%node_id, "node left");
        core.publish(&TeamEvent::Leave { node: node_id });
    }
}

/// Publish an event the coordinator relayed, adopting a relayed mode.
async fn apply_relayed(core: &TeamCore, event: TeamEvent) {
    if let TeamEvent::Mode { ref mode } = event {
        core.state.lock().await.mode.clone_from(mode);
    }
    core.publish(&event);
}

/// Notify every peer except `origin` and this node's own loopback link.
async fn relay(core: &TeamCore, event: &TeamEvent, origin: Option<&Connection>) {
    let params = match serde_json::to_value(event) {
        Ok(params) => params,
        Err(err) => {
            warn!(error = %err, "failed to encode relayed event");
            return;
        }
    };

    for peer in core.engine.connections().await {
        if origin.is_some_and(|origin| origin.peer_id() == peer.peer_id()) {
            continue;
        }
        if peer.direction() == Direction::Outbound
            || peer.node_id().as_deref() == Some(core.node_id.as_str())
        {
            continue;
        }
        if let Err(err) = peer.notify(EVENT_METHOD, &params) {
            warn!(peer_id = peer.peer_id(), kind = event.kind(), error = %err, "relay failed");
        }
    }
}
