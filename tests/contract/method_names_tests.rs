//! Contract tests pinning team method names, parameter keys and reply shapes.
//!
//! Renaming any of these breaks interoperability with running peers.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use agent_huddle::team::calls::{
    AttachParams, BroadcastParams, HandoffParams, HeartbeatParams, LeaveParams, LedgerParams,
    ModeParams, RegisterParams, StatusReply, TeamCall, METHODS,
};
use agent_huddle::team::{LedgerEntry, TeamEvent};

fn keys(value: &Value) -> BTreeSet<String> {
    value.as_object().unwrap().keys().cloned().collect()
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

fn every_call() -> Vec<TeamCall> {
    vec![
        TeamCall::Register(RegisterParams {
            node_id: "n1".into(),
            name: "alpha".into(),
            host: "box".into(),
            role: "editor".into(),
            read_only: false,
            capabilities: Map::new(),
            team_id: Some("t1".into()),
        }),
        TeamCall::Ledger(LedgerParams {
            entry: Some(LedgerEntry::now("n1", 1.0, 1.0, "lint")),
        }),
        TeamCall::Broadcast(BroadcastParams {
            node_id: Some("n1".into()),
            message: "hi".into(),
            payload: json!({}),
        }),
        TeamCall::Attach(AttachParams {
            node_id: "n1".into(),
            repo: "repo".into(),
            path: "/repo".into(),
        }),
        TeamCall::Handoff(HandoffParams {
            repo: "repo".into(),
            task: "task".into(),
            source: "n1".into(),
            target: None,
        }),
        TeamCall::Mode(ModeParams { mode: "sync".into() }),
        TeamCall::Heartbeat(HeartbeatParams { node_id: "n1".into() }),
        TeamCall::Leave(LeaveParams { node_id: None }),
        TeamCall::Event(TeamEvent::Mode { mode: "sync".into() }),
    ]
}

// ── Method names ────────────────────────────────────────────────────────────

/// The method table is fixed.
#[test]
fn method_table_is_stable() {
    assert_eq!(
        METHODS,
        [
            "register",
            "ledger",
            "broadcast",
            "attach",
            "handoff",
            "mode",
            "heartbeat",
            "leave",
            "team.event"
        ]
    );
}

/// Every call variant maps onto exactly one listed method.
#[test]
fn every_variant_has_a_listed_method() {
    let methods: Vec<&str> = every_call().iter().map(TeamCall::method).collect();

    assert_eq!(methods, METHODS);
}

/// Encoding a call and decoding it by name yields the same call.
#[test]
fn calls_decode_from_their_own_wire_form() {
    for call in every_call() {
        let decoded = TeamCall::from_wire(call.method(), call.params().unwrap()).unwrap();
        assert_eq!(decoded, call, "method {}", call.method());
    }
}

// ── Parameter keys ──────────────────────────────────────────────────────────

/// Parameter objects use these exact keys.
#[test]
fn parameter_keys_are_stable() {
    let expected = [
        set(&["node_id", "name", "host", "role", "read_only", "capabilities", "team_id"]),
        set(&["entry"]),
        set(&["node_id", "message", "payload"]),
        set(&["node_id", "repo", "path"]),
        set(&["repo", "task", "source", "target"]),
        set(&["mode"]),
        set(&["node_id"]),
        set(&["node_id"]),
        set(&["kind", "mode"]),
    ];

    for (call, expected) in every_call().iter().zip(expected) {
        assert_eq!(keys(&call.params().unwrap()), expected, "method {}", call.method());
    }
}

/// Ledger entries carry `timestamp`, `node`, `tokens`, `minutes`, `reason`.
#[test]
fn ledger_entry_keys_are_stable() {
    let entry = serde_json::to_value(LedgerEntry::now("n1", 10.0, 3.0, "review")).unwrap();

    assert_eq!(
        keys(&entry),
        set(&["timestamp", "node", "tokens", "minutes", "reason"])
    );
    assert_eq!(entry["node"], "n1");
    assert!(entry["timestamp"].as_str().unwrap().ends_with('Z'));
}

// ── Replies ─────────────────────────────────────────────────────────────────

/// Status replies are `{"status": "ok"}` or `{"status": "ignored"}`.
#[test]
fn status_replies_are_stable() {
    assert_eq!(serde_json::to_value(StatusReply::ok()).unwrap(), json!({ "status": "ok" }));
    assert_eq!(
        serde_json::to_value(StatusReply::ignored()).unwrap(),
        json!({ "status": "ignored" })
    );
}
