//! End-to-end: declarative YAML spec through compile, start, approval,
//! and completion.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use gantry::engine::{Engine, ResumeOutcome};
use gantry::lease::InMemoryLeaseManager;
use gantry::spec::WorkflowSpec;
use gantry::store::{EventStore, InMemoryEventStore};

#[tokio::test]
async fn shipping_demo_runs_to_completion() {
    let spec = WorkflowSpec::from_yaml(include_str!("../demos/shipping.yaml")).unwrap();
    assert_eq!(spec.id, "shipping");

    let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let engine = Engine::builder(store.clone(), Arc::new(InMemoryLeaseManager::new())).build();
    let graph_id = engine.compile(spec).unwrap();
    assert_eq!(graph_id, "shipping");

    let parcel = json!({"kg": 3, "dest": "oslo"});
    let cid = engine
        .start(&graph_id, json!({"parcel": parcel}), Some("acme".into()))
        .await
        .unwrap();

    wait_until(&store, &cid, |events| {
        types_of(events).contains(&"human.awaited")
    })
    .await;
    assert_eq!(
        engine.resume(&cid, json!(true)).await,
        ResumeOutcome::Accepted
    );
    let events = wait_terminal(&store, &cid).await;

    let last = events.last().unwrap();
    assert_eq!(last.event_type.as_str(), "workflow.completed");
    // quote projected the parcel; book echoed it; done carried it out.
    assert_eq!(last.payload["outputs"]["done"], parcel);

    // The tenant tag rode along on the birth event.
    assert_eq!(events[0].payload["tenant"], json!("acme"));
}

#[tokio::test]
async fn compile_errors_surface_synchronously() {
    let engine = Engine::builder(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryLeaseManager::new()),
    )
    .build();

    let spec = WorkflowSpec::from_yaml(
        r#"
id: broken
nodes:
  - id: a
    kind: task
edges:
  - from: a
    to: ghost
"#,
    )
    .unwrap();
    let err = engine.compile(spec).unwrap_err();
    assert!(matches!(
        err,
        gantry::graphs::CompileError::UnknownNodeReference { .. }
    ));

    // No run was created for the broken spec.
    let start = engine.start("broken", json!({}), None).await;
    assert!(matches!(
        start,
        Err(gantry::engine::EngineError::UnknownGraph { .. })
    ));
}
