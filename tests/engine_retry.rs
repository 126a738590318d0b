//! Durable retries: transient failures back off and re-attempt, permanent
//! failures and exhausted budgets terminate the run.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use gantry::engine::Engine;
use gantry::graphs::GraphBuilder;
use gantry::lease::InMemoryLeaseManager;
use gantry::spec::{NodeSpec, RetrySpec};
use gantry::store::{EventStore, InMemoryEventStore};

fn agent_graph(max_attempts: u32) -> gantry::graphs::Graph {
    GraphBuilder::new("agentic")
        .add_node(
            NodeSpec::agent("call", "Call upstream")
                .with_expr("bag.q")
                .with_retry(RetrySpec {
                    max_attempts,
                    base_delay_ms: 10,
                    max_delay_ms: 100,
                    jitter: false,
                }),
        )
        .add_node(NodeSpec::terminal("z", "Z").with_expr("call"))
        .add_edge("call", "z", [] as [&str; 0])
        .compile()
        .unwrap()
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let gateway = Arc::new(ScriptedGateway::failing(2, true));
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .gateway(gateway.clone())
        .build();
    let graph_id = engine.register(agent_graph(3));

    let started_at = std::time::Instant::now();
    let cid = engine.start(&graph_id, json!({"q": "ping"}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    let node_events: Vec<(&str, u64)> = events
        .iter()
        .filter(|e| node_of(e) == "call")
        .map(|e| (e.event_type.as_str(), attempt_of(e)))
        .collect();
    assert_eq!(
        node_events,
        vec![
            ("node.started", 1),
            ("node.failed", 1),
            ("node.started", 2),
            ("node.failed", 2),
            ("node.started", 3),
            ("node.completed", 3),
        ]
    );
    // Failed attempts were flagged transient and retryable.
    for e in events.iter().filter(|e| e.event_type.as_str() == "node.failed") {
        assert_eq!(e.payload["transient"], json!(true));
        assert_eq!(e.payload["will_retry"], json!(true));
    }
    assert_eq!(
        events.last().unwrap().event_type.as_str(),
        "workflow.completed"
    );
    // Backoff slept roughly 10ms then 20ms between attempts.
    assert!(started_at.elapsed() >= std::time::Duration::from_millis(30));
    assert_eq!(gateway.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_run() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .gateway(Arc::new(ScriptedGateway::failing(u32::MAX, true)))
        .build();
    let graph_id = engine.register(agent_graph(2));

    let cid = engine.start(&graph_id, json!({"q": "x"}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    let last_failed = events
        .iter()
        .rfind(|e| e.event_type.as_str() == "node.failed")
        .unwrap();
    assert_eq!(attempt_of(last_failed), 2);
    assert_eq!(last_failed.payload["will_retry"], json!(false));
    let terminal = events.last().unwrap();
    assert_eq!(terminal.event_type.as_str(), "workflow.failed");
    assert_eq!(terminal.payload["reason"], json!("node_failed"));
    assert_eq!(terminal.payload["node"], json!("call"));
}

#[tokio::test]
async fn permanent_failures_do_not_retry() {
    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let gateway = Arc::new(ScriptedGateway::failing(u32::MAX, false));
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new()))
        .gateway(gateway.clone())
        .build();
    let graph_id = engine.register(agent_graph(3));

    let cid = engine.start(&graph_id, json!({}), None).await.unwrap();
    let events = wait_terminal(&store, &cid).await;

    let failed: Vec<_> = events
        .iter()
        .filter(|e| e.event_type.as_str() == "node.failed")
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["transient"], json!(false));
    assert_eq!(failed[0].payload["will_retry"], json!(false));
    assert_eq!(gateway.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        events.last().unwrap().payload["reason"],
        json!("node_failed")
    );
}
