//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use gantry::bus::{BusError, BusMessage, EventBus, InMemoryBus};
use gantry::events::Event;
use gantry::gateway::{AgentGateway, AgentInvocation, AgentReply, GatewayError};
use gantry::graphs::{Graph, GraphBuilder};
use gantry::spec::NodeSpec;
use gantry::store::EventStore;
use gantry::types::CorrelationId;

/// Poll the store until `pred` holds for the run's event log, or panic
/// after five seconds.
pub async fn wait_until<F>(store: &Arc<dyn EventStore>, cid: &CorrelationId, pred: F) -> Vec<Event>
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let events = store.load(cid, 0).await.expect("load events");
        if pred(&events) {
            return events;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "condition not reached; events so far: {:?}",
                types_of(&events)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the run has appended a terminal event.
pub async fn wait_terminal(store: &Arc<dyn EventStore>, cid: &CorrelationId) -> Vec<Event> {
    wait_until(store, cid, |events| {
        events.last().is_some_and(|e| e.event_type.is_terminal())
    })
    .await
}

/// Wire names of an event list, for order assertions.
pub fn types_of(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

/// The S1 shape: task -> task -> terminal, no policies.
pub fn linear_graph() -> Graph {
    GraphBuilder::new("linear")
        .add_node(NodeSpec::task("a", "A").with_expr("bag.x"))
        .add_node(NodeSpec::task("b", "B").with_expr("a"))
        .add_node(NodeSpec::terminal("z", "Z").with_expr("b"))
        .add_edge("a", "b", [] as [&str; 0])
        .add_edge("b", "z", [] as [&str; 0])
        .compile()
        .expect("linear graph compiles")
}

/// The S2 shape: task -> human -> terminal, approval tag on the exit edge.
pub fn approval_graph() -> Graph {
    GraphBuilder::new("approval")
        .add_node(NodeSpec::task("a", "A"))
        .add_node(NodeSpec::human("h", "Review", "ok"))
        .add_node(NodeSpec::terminal("z", "Z"))
        .add_edge("a", "h", [] as [&str; 0])
        .add_edge("h", "z", ["require_approval"])
        .compile()
        .expect("approval graph compiles")
}

/// Gateway that fails the first `fail_first` invocations, then echoes.
pub struct ScriptedGateway {
    pub fail_first: u32,
    pub transient: bool,
    pub calls: AtomicU32,
}

impl ScriptedGateway {
    pub fn failing(fail_first: u32, transient: bool) -> Self {
        Self {
            fail_first,
            transient,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AgentGateway for ScriptedGateway {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<AgentReply, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            if self.transient {
                Err(GatewayError::transient("upstream hiccup"))
            } else {
                Err(GatewayError::permanent("bad request"))
            }
        } else {
            Ok(AgentReply::from_output(invocation.input))
        }
    }
}

/// Bus whose health can be toggled; unhealthy publishes fail.
pub struct SwitchBus {
    healthy: AtomicBool,
    pub inner: InMemoryBus,
}

impl SwitchBus {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            inner: InMemoryBus::new(),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> flume::Receiver<BusMessage> {
        self.inner.subscribe()
    }
}

#[async_trait]
impl EventBus for SwitchBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        if self.healthy.load(Ordering::SeqCst) {
            self.inner.publish(message).await
        } else {
            Err(BusError::Unavailable {
                message: "bus offline".into(),
            })
        }
    }
}

/// Attempt counter from a `node.started`/`node.failed` payload.
pub fn attempt_of(event: &Event) -> u64 {
    event.payload["attempt"].as_u64().unwrap_or(0)
}

/// Node id from a node-scoped payload.
pub fn node_of(event: &Event) -> String {
    event.payload["node"].as_str().unwrap_or_default().to_string()
}
