//! Analytics collaborator receiving every recorded ledger entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;

use super::models::{ContributorTotals, LedgerEntry, TeamMetrics};
use crate::Result;

/// Sink for ledger entries and source of aggregate team metrics.
pub trait TeamAnalytics: Send + Sync {
    /// Record one ledger entry for `team_id`.
    fn record_entry(
        &self,
        team_id: String,
        entry: LedgerEntry,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Aggregate metrics for `team_id`.
    fn snapshot(
        &self,
        team_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<TeamMetrics>> + Send + '_>>;
}

/// In-memory analytics used when no external store is wired in.
#[derive(Debug, Default)]
pub struct MemoryAnalytics {
    teams: Mutex<HashMap<String, Vec<LedgerEntry>>>,
}

impl MemoryAnalytics {
    /// Create an empty analytics store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TeamAnalytics for MemoryAnalytics {
    fn record_entry(
        &self,
        team_id: String,
        entry: LedgerEntry,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.teams.lock().await.entry(team_id).or_default().push(entry);
            Ok(())
        })
    }

    fn snapshot(
        &self,
        team_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<TeamMetrics>> + Send + '_>> {
        Box::pin(async move {
            let teams = self.teams.lock().await;
            let entries = teams.get(&team_id).map(Vec::as_slice).unwrap_or_default();

            let mut contributors: Vec<ContributorTotals> = Vec::new();
            for entry in entries {
                if let Some(totals) = contributors
                    .iter_mut()
                    .find(|totals| totals.node_id == entry.node_id)
                {
                    totals.tokens += entry.tokens;
                    totals.minutes += entry.minutes;
                    totals.entries += 1;
                } else {
                    contributors.push(ContributorTotals {
                        node_id: entry.node_id.clone(),
                        tokens: entry.tokens,
                        minutes: entry.minutes,
                        entries: 1,
                    });
                }
            }
            contributors.sort_by(|a, b| b.tokens.total_cmp(&a.tokens));

            Ok(TeamMetrics {
                team_id,
                total_tokens: entries.iter().map(|entry| entry.tokens).sum(),
                total_minutes: entries.iter().map(|entry| entry.minutes).sum(),
                entries: entries.len(),
                contributors,
            })
        })
    }
}
