//! Typed team RPC methods.
//!
//! | Method | Params | Reply |
//! |--------|--------|-------|
//! | `register` | [`RegisterParams`] | [`TeamSnapshot`](super::models::TeamSnapshot) |
//! | `ledger` | [`LedgerParams`] | [`StatusReply`] |
//! | `broadcast` | [`BroadcastParams`] | [`StatusReply`] |
//! | `attach` | [`AttachParams`] | [`StatusReply`] |
//! | `handoff` | [`HandoffParams`] | [`StatusReply`] |
//! | `mode` | [`ModeParams`] | [`StatusReply`] |
//! | `heartbeat` | [`HeartbeatParams`] | [`StatusReply`] |
//! | `leave` | [`LeaveParams`] | notification, no reply |
//! | `team.event` | [`TeamEvent`] | notification relayed by the coordinator |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::events::TeamEvent;
use super::models::{default_role, LedgerEntry};
use crate::{AppError, Result};

/// Every method name understood by [`TeamCall::from_wire`].
pub const METHODS: [&str; 9] = [
    "register",
    "ledger",
    "broadcast",
    "attach",
    "handoff",
    "mode",
    "heartbeat",
    "leave",
    "team.event",
];

/// Parameters of `register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegisterParams {
    /// Registering node.
    pub node_id: String,
    /// Display name.
    pub name: String,
    /// Host name.
    pub host: String,
    /// Role, `editor` when omitted.
    #[serde(default = "default_role")]
    pub role: String,
    /// Read-only flag.
    #[serde(default)]
    pub read_only: bool,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    /// Requested team id; ignored once the coordinator has one.
    #[serde(default)]
    pub team_id: Option<String>,
}

/// Parameters of `ledger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerParams {
    /// Entry to append; a missing entry is ignored.
    #[serde(default)]
    pub entry: Option<LedgerEntry>,
}

/// Parameters of `broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BroadcastParams {
    /// Sending node.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Message label.
    #[serde(default)]
    pub message: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Value,
}

/// Parameters of `attach`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AttachParams {
    /// Node claiming the repository.
    pub node_id: String,
    /// Repository identifier.
    pub repo: String,
    /// Local path of the repository on the claiming node.
    #[serde(default)]
    pub path: String,
}

/// Parameters of `handoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffParams {
    /// Repository the task belongs to.
    pub repo: String,
    /// Task description.
    pub task: String,
    /// Node handing the task off.
    pub source: String,
    /// Intended receiver, if any.
    #[serde(default)]
    pub target: Option<String>,
}

/// Parameters of `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeParams {
    /// New shared mode.
    pub mode: String,
}

/// Parameters of `heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatParams {
    /// Node reporting liveness.
    pub node_id: String,
}

/// Parameters of `leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LeaveParams {
    /// Departing node; defaults to the node registered on the connection.
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Reply body of every non-`register` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    /// `ok`, or `ignored` for a `ledger` call without an entry.
    pub status: String,
}

impl StatusReply {
    /// The call was applied.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }

    /// The call carried nothing to apply.
    #[must_use]
    pub fn ignored() -> Self {
        Self {
            status: "ignored".into(),
        }
    }
}

/// Closed set of team protocol calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum TeamCall {
    /// Join the team and fetch its snapshot.
    Register(RegisterParams),
    /// Append a ledger entry.
    Ledger(LedgerParams),
    /// Fan a message out to the team.
    Broadcast(BroadcastParams),
    /// Claim a repository.
    Attach(AttachParams),
    /// Hand a task to another node.
    Handoff(HandoffParams),
    /// Change the shared mode.
    Mode(ModeParams),
    /// Report liveness.
    Heartbeat(HeartbeatParams),
    /// Depart the team.
    Leave(LeaveParams),
    /// Event relayed by the coordinator to followers.
    #[serde(rename = "team.event")]
    Event(TeamEvent),
}

impl TeamCall {
    /// Decode a call from its wire method name and parameters.
    ///
    /// # Errors
    ///
    /// - [`AppError::UnknownMethod`] if `method` is not a team method.
    /// - [`AppError::InvalidParams`] if `params` do not fit the method.
    pub fn from_wire(method: &str, params: Value) -> Result<Self> {
        if !METHODS.contains(&method) {
            return Err(AppError::UnknownMethod(method.to_owned()));
        }
        serde_json::from_value(serde_json::json!({ "method": method, "params": params }))
            .map_err(|err| AppError::InvalidParams(format!("{method}: {err}")))
    }

    /// Wire method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Ledger(_) => "ledger",
            Self::Broadcast(_) => "broadcast",
            Self::Attach(_) => "attach",
            Self::Handoff(_) => "handoff",
            Self::Mode(_) => "mode",
            Self::Heartbeat(_) => "heartbeat",
            Self::Leave(_) => "leave",
            Self::Event(_) => "team.event",
        }
    }

    /// Wire parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::MalformedFrame`] if the parameters cannot be serialised.
    pub fn params(&self) -> Result<Value> {
        let mut encoded = serde_json::to_value(self)?;
        Ok(encoded
            .get_mut("params")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}
