//! Crash recovery, snapshot cadence, replay determinism, and shutdown.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use gantry::engine::reducer::{replay, RunState};
use gantry::engine::{Engine, EngineConfig};
use gantry::events::EventDraft;
use gantry::lease::InMemoryLeaseManager;
use gantry::store::{EventStore, InMemoryEventStore};

fn engine_with(store: &Arc<dyn EventStore>, snapshot_interval: u64) -> Engine {
    Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .config(EngineConfig {
            snapshot_interval,
            ..EngineConfig::default()
        })
        .build()
}

#[tokio::test]
async fn recovery_resumes_after_a_partial_log() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());

    // Simulate a crash: the log ends after node a completed, before b
    // started. These are exactly the events a dying engine left behind.
    let cid = gantry::utils::ids::IdGenerator::new().correlation_id();
    store
        .append(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "linear", json!({"x": 7}), None),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_completed(&cid, "a", 1, json!(7)),
            ],
        )
        .await
        .unwrap();

    let engine = engine_with(&store, 50);
    engine.register(linear_graph());
    engine.recover(&cid).await.unwrap();

    let events = wait_terminal(&store, &cid).await;
    let tail: Vec<&str> = types_of(&events)[3..].to_vec();
    assert_eq!(
        tail,
        vec![
            "node.started",
            "node.completed",
            "node.started",
            "node.completed",
            "workflow.completed",
        ]
    );
    let started: Vec<String> = events[3..]
        .iter()
        .filter(|e| e.event_type.as_str() == "node.started")
        .map(|e| node_of(e))
        .collect();
    assert_eq!(started, ["b", "z"]);
    assert_eq!(events.last().unwrap().payload["outputs"]["z"], json!(7));
}

#[tokio::test]
async fn interrupted_attempt_resumes_with_the_same_attempt_number() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());

    // Crash mid-attempt: node.started(2) has no completion.
    let cid = gantry::utils::ids::IdGenerator::new().correlation_id();
    store
        .append(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "linear", json!({"x": 1}), None),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_failed(&cid, "a", 1, "hiccup", true, true),
                EventDraft::node_started(&cid, "a", 2),
            ],
        )
        .await
        .unwrap();

    let engine = engine_with(&store, 50);
    engine.register(linear_graph());
    engine.recover(&cid).await.unwrap();

    let events = wait_terminal(&store, &cid).await;
    // The re-issued node.started(a, 2) was absorbed by idempotency; the
    // completion carries attempt 2 and no duplicate start exists.
    let a_starts: Vec<u64> = events
        .iter()
        .filter(|e| e.event_type.as_str() == "node.started" && node_of(e) == "a")
        .map(|e| attempt_of(e))
        .collect();
    assert_eq!(a_starts, [1, 2]);
    let a_completed = events
        .iter()
        .find(|e| e.event_type.as_str() == "node.completed" && node_of(e) == "a")
        .unwrap();
    assert_eq!(attempt_of(a_completed), 2);
    assert_eq!(
        events.last().unwrap().event_type.as_str(),
        "workflow.completed"
    );
}

#[tokio::test]
async fn replay_from_zero_equals_replay_from_snapshot() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(&store, 3);
    let graph = linear_graph();
    let graph_id = engine.register(linear_graph());

    let cid = engine.start(&graph_id, json!({"x": 3}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    // The cadence produced snapshots and their marker events.
    assert!(types_of(&events).contains(&"snapshot.created"));
    let snapshot = store
        .read_snapshot(&cid)
        .await
        .unwrap()
        .expect("cadence snapshot must exist");

    let from_zero = replay(&graph, RunState::default(), &events);
    let tail: Vec<_> = events
        .iter()
        .filter(|e| e.sequence > snapshot.up_to_sequence)
        .cloned()
        .collect();
    let from_snapshot = replay(&graph, RunState::from_value(snapshot.payload), &tail);
    assert_eq!(from_zero, from_snapshot);
}

#[tokio::test]
async fn snapshot_api_and_audit_replay() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(&store, 50);
    let graph_id = engine.register(approval_graph());

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    wait_until(&store, &cid, |events| {
        types_of(events).contains(&"human.awaited")
    })
    .await;

    // On-demand snapshot of the parked run.
    let snapshot_id = engine.snapshot(&cid).await.unwrap();
    let listed = engine.list_snapshots(&cid).await.unwrap();
    assert!(listed.iter().any(|m| m.snapshot_id == snapshot_id));

    // Audit replay reconstructs the parked state and halts.
    let state = engine.replay(&cid, &snapshot_id).await.unwrap();
    assert!(state.pending_humans.contains("h"));
    assert!(!state.is_terminal());

    let missing = engine.replay(&cid, "snap-nope").await;
    assert!(matches!(
        missing,
        Err(gantry::engine::EngineError::SnapshotMissing { .. })
    ));

    engine.resume(&cid, json!(true)).await;
    wait_terminal(&store, &cid).await;
}

#[tokio::test]
async fn shutdown_parks_runs_resumably() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = engine_with(&store, 50);
    let graph_id = engine.register(approval_graph());

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    let parked = wait_until(&store, &cid, |events| {
        types_of(events).contains(&"human.awaited")
    })
    .await;

    engine.shutdown().await;
    assert!(!engine.is_active(&cid).await);
    // No terminal event: the run is parked, not failed.
    let events = store.load(&cid, 0).await.unwrap();
    assert_eq!(events.len(), parked.len());

    // A fresh engine picks the run back up and completes it.
    let engine2 = engine_with(&store, 50);
    engine2.register(approval_graph());
    engine2.recover(&cid).await.unwrap();
    assert_eq!(
        engine2.resume(&cid, json!(true)).await,
        gantry::engine::ResumeOutcome::Accepted
    );
    let events = wait_terminal(&store, &cid).await;
    assert_eq!(
        events.last().unwrap().event_type.as_str(),
        "workflow.completed"
    );
}
