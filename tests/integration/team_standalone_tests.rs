//! A node that never joined acts alone: calls apply locally and publish locally.

use serde_json::json;

use agent_huddle::team::{TeamEvent, TeamPhase, LOCAL_TEAM};
use agent_huddle::AppError;

use super::test_helpers::{drain, open_node};

/// Every domain call succeeds and is published without a team.
#[tokio::test]
async fn operations_publish_without_join() {
    let temp = tempfile::tempdir().unwrap();
    let node = open_node(temp.path(), "solo");
    let mut events = node.subscribe();

    node.broadcast("note", json!({ "text": "alone" })).await.unwrap();
    node.attach_repo("repo-one", "/solo/repo-one").await.unwrap();
    node.handoff("repo-one", "write docs", None).await.unwrap();
    node.set_mode("focus").await.unwrap();
    node.record_budget(6.0, 2.0, "drafting", None).await.unwrap();

    let kinds: Vec<&str> = drain(&mut events).iter().map(TeamEvent::kind).collect();
    assert_eq!(kinds, ["broadcast", "attach", "handoff", "mode", "ledger"]);
    assert_eq!(node.phase().await, TeamPhase::Unjoined);
    assert!(node.state().await.is_none());
    assert!(node.connection().await.is_none());
}

/// The local ledger and metrics work without a team id.
#[tokio::test]
async fn ledger_and_metrics_without_join() {
    let temp = tempfile::tempdir().unwrap();
    let node = open_node(temp.path(), "solo");

    node.record_budget(6.0, 2.0, "drafting", None).await.unwrap();
    node.record_budget(4.0, 1.0, "review", None).await.unwrap();

    let summary = node.ledger_summary().await;
    assert_eq!(summary.entries.len(), 2);
    assert!((summary.total_tokens - 10.0).abs() < f64::EPSILON);
    assert!((summary.total_minutes - 3.0).abs() < f64::EPSILON);

    let metrics = node.team_metrics().await.unwrap();
    assert_eq!(metrics.team_id, LOCAL_TEAM);
    assert_eq!(metrics.entries, 2);
    assert_eq!(metrics.contributors.len(), 1);
    assert_eq!(metrics.contributors[0].node_id, node.node_id());
}

/// Nothing is written to disk while the node has no team id.
#[tokio::test]
async fn standalone_calls_do_not_persist() {
    let temp = tempfile::tempdir().unwrap();
    let node = open_node(temp.path(), "solo");

    node.record_budget(1.0, 1.0, "scratch", None).await.unwrap();
    node.attach_repo("repo-one", "/solo/repo-one").await.unwrap();

    let entries: Vec<_> = std::fs::read_dir(temp.path().join("solo"))
        .unwrap()
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "secrets")
        .collect();
    assert!(entries.is_empty(), "unexpected files: {entries:?}");
}

/// Invalid attach parameters are rejected locally too.
#[tokio::test]
async fn standalone_attach_rejects_empty_repo() {
    let temp = tempfile::tempdir().unwrap();
    let node = open_node(temp.path(), "solo");
    let mut events = node.subscribe();

    let err = node.attach_repo("", "/nowhere").await.unwrap_err();

    assert!(matches!(err, AppError::InvalidParams(_)), "got {err:?}");
    assert!(drain(&mut events).is_empty());
}
