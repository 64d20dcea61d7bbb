//! Team domain entities shared between the wire protocol and local views.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default shared mode of a freshly formed team.
pub const DEFAULT_MODE: &str = "sync";

/// Default role advertised by a node.
pub const DEFAULT_ROLE: &str = "editor";

pub(crate) fn default_role() -> String {
    DEFAULT_ROLE.into()
}

pub(crate) fn default_mode() -> String {
    DEFAULT_MODE.into()
}

/// A member of a team as known to the coordinator's registry.
///
/// `last_seen` moves only on registration and heartbeats. Nodes are never
/// evicted for being stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TeamNode {
    /// Unique node identifier.
    pub node_id: String,
    /// Human-readable name.
    pub name: String,
    /// Host the node runs on.
    pub host: String,
    /// Free-form role (`editor` unless stated otherwise).
    #[serde(default = "default_role")]
    pub role: String,
    /// Whether the node promised not to mutate shared state.
    #[serde(default)]
    pub read_only: bool,
    /// Capabilities advertised at registration.
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    /// Last registration or heartbeat seen by the coordinator.
    pub last_seen: DateTime<Utc>,
    /// Repositories currently attached to this node.
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// One budget-usage record in the append-only team ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LedgerEntry {
    /// When the usage was recorded.
    pub timestamp: DateTime<Utc>,
    /// Node (or named actor) the usage is attributed to.
    #[serde(rename = "node")]
    pub node_id: String,
    /// Tokens consumed.
    pub tokens: f64,
    /// Minutes consumed.
    pub minutes: f64,
    /// Why the budget was spent.
    pub reason: String,
}

impl LedgerEntry {
    /// Build an entry stamped with the current time.
    #[must_use]
    pub fn now(node_id: impl Into<String>, tokens: f64, minutes: f64, reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node_id.into(),
            tokens,
            minutes,
            reason: reason.into(),
        }
    }
}

/// Full team snapshot returned by `register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TeamSnapshot {
    /// Immutable team identifier.
    pub team_id: String,
    /// Shared mode at snapshot time.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Every registered node.
    #[serde(default)]
    pub nodes: Vec<TeamNode>,
    /// Entire ledger.
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    /// Repository id to owning node id.
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

/// A node's local view of its team.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TeamState {
    /// Immutable team identifier.
    pub team_id: String,
    /// Address of the coordinator.
    pub broker_address: String,
    /// Shared mode, last write wins.
    pub mode: String,
    /// Known nodes keyed by node id.
    pub nodes: BTreeMap<String, TeamNode>,
    /// Ledger as known locally.
    pub ledger: Vec<LedgerEntry>,
    /// Repository id to owning node id, last write wins.
    pub attachments: BTreeMap<String, String>,
}

/// Aggregate totals over a ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LedgerSummary {
    /// Sum of `tokens` over all entries.
    pub total_tokens: f64,
    /// Sum of `minutes` over all entries.
    pub total_minutes: f64,
    /// The entries themselves, oldest first.
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSummary {
    /// Summarise `entries`.
    #[must_use]
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let total_tokens = entries.iter().map(|entry| entry.tokens).sum();
        let total_minutes = entries.iter().map(|entry| entry.minutes).sum();
        Self {
            total_tokens,
            total_minutes,
            entries,
        }
    }
}

/// Per-contributor totals reported by the analytics collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ContributorTotals {
    /// Node or actor the entries were attributed to.
    pub node_id: String,
    /// Tokens attributed to the contributor.
    pub tokens: f64,
    /// Minutes attributed to the contributor.
    pub minutes: f64,
    /// Number of entries.
    pub entries: usize,
}

/// Team-wide budget metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TeamMetrics {
    /// Team the metrics belong to (`local` when not joined).
    pub team_id: String,
    /// Sum of tokens.
    pub total_tokens: f64,
    /// Sum of minutes.
    pub total_minutes: f64,
    /// Number of ledger entries.
    pub entries: usize,
    /// Totals per contributor, largest token spend first.
    pub contributors: Vec<ContributorTotals>,
}
