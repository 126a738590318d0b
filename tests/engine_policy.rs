//! Policy gating: denial terminates the run, oracle outages fail closed.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::*;
use gantry::audit::MemoryDecisionSink;
use gantry::engine::Engine;
use gantry::lease::InMemoryLeaseManager;
use gantry::policy::{Decision, OracleError, OracleInput, PolicyOracle, TagTableOracle};
use gantry::store::{EventStore, InMemoryEventStore};

/// Denies any edge leading into the named node.
struct DenyInto(&'static str);

#[async_trait]
impl PolicyOracle for DenyInto {
    async fn evaluate(&self, input: &OracleInput) -> Result<Decision, OracleError> {
        if input.edge.to == self.0 {
            Ok(Decision::deny("blocked by compliance"))
        } else {
            Ok(Decision::Allow)
        }
    }
}

/// Always unreachable.
struct DownOracle;

#[async_trait]
impl PolicyOracle for DownOracle {
    async fn evaluate(&self, _input: &OracleInput) -> Result<Decision, OracleError> {
        Err(OracleError::Unavailable {
            message: "connection refused".into(),
        })
    }
}

#[tokio::test]
async fn denied_edge_fails_the_run_before_the_checkpoint() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let sink = Arc::new(MemoryDecisionSink::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .oracle(Arc::new(DenyInto("h")))
        .decision_sink(sink.clone())
        .build();
    let graph_id = engine.register(approval_graph());

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    assert_eq!(
        types_of(&events),
        vec![
            "workflow.started",
            "node.started",
            "node.completed",
            "policy.denied",
            "workflow.failed",
        ]
    );
    let denied = &events[3];
    assert_eq!(denied.payload["edge"]["from"], json!("a"));
    assert_eq!(denied.payload["edge"]["to"], json!("h"));
    assert_eq!(denied.payload["reason"], json!("blocked by compliance"));
    assert_eq!(events[4].payload["reason"], json!("policy_denied"));

    // The blocked invocation is still audited, with allowed = false.
    let blocked: Vec<_> = sink.records().into_iter().filter(|r| !r.allowed).collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].node_id, "h");
}

#[tokio::test]
async fn unreachable_oracle_fails_closed() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .oracle(Arc::new(DownOracle))
        .config(gantry::engine::EngineConfig {
            oracle_attempts: 3,
            oracle_backoff: std::time::Duration::from_millis(1),
            ..Default::default()
        })
        .build();
    let graph_id = engine.register(approval_graph());

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    let denied = events
        .iter()
        .find(|e| e.event_type.as_str() == "policy.denied")
        .expect("run must be denied");
    assert_eq!(denied.payload["reason"], json!("oracle_unavailable"));
    assert_eq!(
        events.last().unwrap().payload["reason"],
        json!("policy_denied")
    );
    assert!(!types_of(&events).contains(&"human.awaited"));
}

#[tokio::test]
async fn tag_table_oracle_passes_untagged_edges() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .oracle(Arc::new(TagTableOracle::default()))
        .build();
    let graph_id = engine.register(linear_graph());

    let cid = engine.start(&graph_id, json!({"x": 1}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;
    assert_eq!(
        events.last().unwrap().event_type.as_str(),
        "workflow.completed"
    );
}

#[tokio::test]
async fn deny_all_tag_kills_a_tagged_run() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .oracle(Arc::new(TagTableOracle::default()))
        .build();
    let graph = gantry::graphs::GraphBuilder::new("gated")
        .add_node(gantry::spec::NodeSpec::task("a", "A"))
        .add_node(gantry::spec::NodeSpec::terminal("z", "Z"))
        .add_edge("a", "z", ["deny_all"])
        .compile()
        .unwrap();
    let graph_id = engine.register(graph);

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;
    assert!(types_of(&events).contains(&"policy.denied"));
    assert_eq!(
        events.last().unwrap().payload["reason"],
        json!("policy_denied")
    );
}
