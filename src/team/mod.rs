//! Team coordination on top of the protocol engine.
//!
//! Submodules:
//! - `models`: nodes, ledger entries, snapshots, and summaries.
//! - `calls`: the closed set of team RPC methods ([`TeamCall`]).
//! - `events`: [`TeamEvent`] and the in-process [`EventBus`].
//! - `store`: whole-document JSON persistence per team.
//! - `analytics`: the [`TeamAnalytics`] collaborator.
//! - `coordinator`: [`TeamHandler`], which applies calls to shared state.
//! - `manager`: [`TeamManager`], the public entry point.

pub mod analytics;
pub mod calls;
pub mod coordinator;
pub mod events;
pub mod manager;
pub mod models;
mod shared;
pub mod store;

pub use analytics::{MemoryAnalytics, TeamAnalytics};
pub use calls::TeamCall;
pub use coordinator::TeamHandler;
pub use events::{EventBus, EventStream, TeamEvent};
pub use manager::{JoinOptions, TeamManager};
pub use models::{LedgerEntry, LedgerSummary, TeamMetrics, TeamNode, TeamSnapshot, TeamState};
pub use shared::{TeamPhase, LOCAL_TEAM};
pub use store::TeamStore;
