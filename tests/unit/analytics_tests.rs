//! Unit tests for the in-memory analytics collaborator.

use agent_huddle::team::{LedgerEntry, MemoryAnalytics, TeamAnalytics};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Totals and per-contributor sums are reported, largest spender first.
#[tokio::test]
async fn snapshot_aggregates_by_contributor() {
    let analytics = MemoryAnalytics::new();
    for (node, tokens, minutes) in [("a", 5.0, 1.0), ("b", 20.0, 4.0), ("a", 7.5, 2.0)] {
        analytics
            .record_entry("alpha".into(), LedgerEntry::now(node, tokens, minutes, "work"))
            .await
            .unwrap();
    }

    let metrics = analytics.snapshot("alpha".into()).await.unwrap();

    assert_eq!(metrics.team_id, "alpha");
    assert_eq!(metrics.entries, 3);
    assert!(approx(metrics.total_tokens, 32.5));
    assert!(approx(metrics.total_minutes, 7.0));
    assert_eq!(metrics.contributors.len(), 2);
    assert_eq!(metrics.contributors[0].node_id, "b");
    assert_eq!(metrics.contributors[1].node_id, "a");
    assert_eq!(metrics.contributors[1].entries, 2);
    assert!(approx(metrics.contributors[1].tokens, 12.5));
}

/// Teams are kept apart.
#[tokio::test]
async fn teams_are_isolated() {
    let analytics = MemoryAnalytics::new();
    analytics
        .record_entry("alpha".into(), LedgerEntry::now("a", 1.0, 1.0, "x"))
        .await
        .unwrap();

    let other = analytics.snapshot("beta".into()).await.unwrap();

    assert_eq!(other.entries, 0);
    assert!(other.contributors.is_empty());
    assert!(approx(other.total_tokens, 0.0));
}
