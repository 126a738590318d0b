//! Happy-path execution: scheduling order, outputs, and audit records.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use gantry::audit::MemoryDecisionSink;
use gantry::engine::{Engine, EngineConfig, RunState, RunStatus};
use gantry::lease::InMemoryLeaseManager;
use gantry::store::{EventStore, InMemoryEventStore};
use gantry::types::NodeKind;

#[tokio::test]
async fn linear_run_emits_the_expected_sequence() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new())).build();
    let graph_id = engine.register(linear_graph());

    let cid = engine
        .start(&graph_id, json!({"x": 1}), None)
        .await
        .unwrap();
    let events = wait_terminal(&store, &cid).await;

    assert_eq!(
        types_of(&events),
        vec![
            "workflow.started",
            "node.started",
            "node.completed",
            "node.started",
            "node.completed",
            "node.started",
            "node.completed",
            "workflow.completed",
        ]
    );
    // Scheduling order is a, then b, then the terminal.
    let started: Vec<String> = events
        .iter()
        .filter(|e| e.event_type.as_str() == "node.started")
        .map(node_of)
        .collect();
    assert_eq!(started, ["a", "b", "z"]);
    for e in events
        .iter()
        .filter(|e| e.event_type.as_str() == "node.started")
    {
        assert_eq!(attempt_of(e), 1);
    }

    // Dense sequencing from 1.
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());

    // Data flowed: a projected the bag entry, b projected a's output, the
    // terminal carried it into the final outputs.
    let completed = events.last().unwrap();
    assert_eq!(completed.payload["outputs"]["z"], json!(1));
}

#[tokio::test]
async fn run_context_is_reconstructible_from_events_alone() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new())).build();
    let graph = linear_graph();
    let graph_id = engine.register(linear_graph());

    let cid = engine
        .start(&graph_id, json!({"x": "payload"}), None)
        .await
        .unwrap();
    let events = wait_terminal(&store, &cid).await;

    let mut state = RunState::default();
    for e in &events {
        state.apply(&graph, e);
    }
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.context.output("a"), Some(&json!("payload")));
    assert_eq!(state.context.output("z"), Some(&json!("payload")));
    assert!(state.pending_humans.is_empty());
}

#[tokio::test]
async fn every_node_invocation_gets_a_decision_record() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let sink = Arc::new(MemoryDecisionSink::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .decision_sink(sink.clone())
        .build();
    let graph_id = engine.register(linear_graph());

    let cid = engine.start(&graph_id, json!({"x": 9}), None).await.unwrap();
    wait_terminal(&store, &cid).await;

    let records = sink.records();
    let nodes: Vec<String> = records.iter().map(|r| r.node_id.clone()).collect();
    assert_eq!(nodes, ["a", "b", "z"]);
    assert!(records.iter().all(|r| r.allowed));
    assert!(records.iter().all(|r| r.workflow_id == "linear"));
    assert_eq!(records[2].node_kind, NodeKind::Terminal);
    assert_eq!(records[1].output_snapshot, json!(9));
}

#[tokio::test]
async fn admission_is_bounded_and_cancellation_terminates() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .config(EngineConfig {
            max_concurrent_runs: 1,
            ..EngineConfig::default()
        })
        .build();
    let graph_id = engine.register(approval_graph());

    // First run parks on the human checkpoint and occupies the only slot.
    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    wait_until(&store, &cid, |events| {
        types_of(events).contains(&"human.awaited")
    })
    .await;

    let err = engine.start(&graph_id, json!({}), None).await.unwrap_err();
    assert!(matches!(err, gantry::engine::EngineError::Busy));

    // Cancelling frees the slot with an explicit terminal event.
    assert!(engine.cancel(&cid).await);
    let events = wait_terminal(&store, &cid).await;
    let last = events.last().unwrap();
    assert_eq!(last.event_type.as_str(), "workflow.failed");
    assert_eq!(last.payload["reason"], json!("cancelled"));

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if engine.start(&graph_id, json!({}), None).await.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot was not released after cancellation"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
