//! Local domain events and the in-process fan-out bus.
//!
//! The bus is strictly intra-process: it is how a UI or CLI in the same
//! process observes team activity. Each subscriber gets its own unbounded
//! queue; events from one publisher arrive in publication order.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::models::{LedgerEntry, TeamNode, TeamSnapshot};

/// Receiving end handed to each subscriber.
pub type EventStream = mpsc::UnboundedReceiver<TeamEvent>;

/// State-changing team activity, as seen by local subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamEvent {
    /// This node completed `join`.
    #[serde(rename = "team-join")]
    TeamJoined {
        /// Snapshot received from the coordinator.
        team: TeamSnapshot,
    },
    /// A node registered with the coordinator.
    Join {
        /// Registered node.
        node: TeamNode,
    },
    /// A node left.
    Leave {
        /// Departed node id.
        node: String,
    },
    /// A ledger entry was recorded.
    Ledger {
        /// Recorded entry.
        entry: LedgerEntry,
    },
    /// A team-wide message.
    Broadcast {
        /// Message label.
        message: String,
        /// Arbitrary JSON payload.
        payload: Value,
        /// Sending node.
        #[serde(default)]
        node: Option<String>,
    },
    /// A repository was claimed.
    Attach {
        /// Repository identifier.
        repo: String,
        /// Path on the claiming node.
        path: String,
        /// Claiming node.
        node: String,
    },
    /// A task was handed off.
    Handoff {
        /// Repository the task belongs to.
        repo: String,
        /// Task description.
        task: String,
        /// Node handing the task off.
        source: String,
        /// Intended receiver.
        #[serde(default)]
        target: Option<String>,
    },
    /// The shared mode changed.
    Mode {
        /// New mode.
        mode: String,
    },
}

impl TeamEvent {
    /// Wire `kind` tag of the event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TeamJoined { .. } => "team-join",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Ledger { .. } => "ledger",
            Self::Broadcast { .. } => "broadcast",
            Self::Attach { .. } => "attach",
            Self::Handoff { .. } => "handoff",
            Self::Mode { .. } => "mode",
        }
    }
}

/// Per-process publish/subscribe fan-out.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TeamEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; it sees every event published from now on.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, forgetting dropped ones.
    pub fn publish(&self, event: &TeamEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(kind = event.kind(), subscribers = subscribers.len(), "team event published");
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<TeamEvent>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
