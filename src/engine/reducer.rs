//! The pure run-state reducer.
//!
//! [`RunState`] is everything the scheduler needs to drive a run: the
//! context, the ready set, pending human checkpoints, completed nodes,
//! durable attempt counters, and the terminal status. [`RunState::apply`]
//! folds one event into the state; it is pure and total over the event
//! vocabulary, and it is the *only* way state changes — the live driver
//! and crash-recovery replay go through the same function, which is what
//! makes replay deterministic.
//!
//! The reducer plus the event log are the sole source of truth. Snapshots
//! serialize a `RunState` via [`RunState::to_value`] and are losslessly
//! reconstructible from events alone.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::events::{payload, Event};
use crate::graphs::Graph;
use crate::types::EventType;

/// Terminal status of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed { reason: String },
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Running
    }
}

/// Materialized state of one run at a given sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct RunState {
    pub spec_id: String,
    pub tenant: Option<String>,
    pub context: RunContext,
    /// Nodes eligible for dispatch, keyed by id; the scheduler picks the
    /// lowest (topological rank, id).
    pub ready: BTreeSet<String>,
    /// Nodes with a `node.started` but no completion/failure yet. After a
    /// crash these are re-dispatched with the same attempt number.
    pub in_flight: BTreeSet<String>,
    pub pending_humans: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    /// Last started attempt per node; durable across recovery.
    pub attempts: BTreeMap<String, u32>,
    pub status: RunStatus,
    /// Sequence number of the last applied event.
    pub last_applied: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            spec_id: String::new(),
            tenant: None,
            context: RunContext::default(),
            ready: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            pending_humans: BTreeSet::new(),
            completed: BTreeSet::new(),
            attempts: BTreeMap::new(),
            status: RunStatus::Running,
            last_applied: 0,
        }
    }
}

/// Serde mirror of [`RunState`] used as the snapshot payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedRunState {
    spec_id: String,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    context: Value,
    #[serde(default)]
    ready: Vec<String>,
    #[serde(default)]
    in_flight: Vec<String>,
    #[serde(default)]
    pending_humans: Vec<String>,
    #[serde(default)]
    completed: Vec<String>,
    #[serde(default)]
    attempts: BTreeMap<String, u32>,
    #[serde(default = "default_status")]
    status: RunStatus,
    #[serde(default)]
    last_applied: u64,
}

fn default_status() -> RunStatus {
    RunStatus::Running
}

impl RunState {
    /// Fold one event into the state.
    ///
    /// The graph parameter supplies structure (successor lists, join
    /// checks); it never changes during a run, so the fold stays a pure
    /// function of `(graph, events)`.
    pub fn apply(&mut self, graph: &Graph, event: &Event) {
        match event.event_type {
            EventType::WorkflowStarted => {
                let p: payload::WorkflowStarted = event.payload_as();
                self.spec_id = p.spec_id;
                self.tenant = p.tenant;
                self.context = RunContext::new(p.initial_bag);
                self.ready.insert(graph.start().id.clone());
            }
            EventType::NodeStarted => {
                let p: payload::NodeStarted = event.payload_as();
                self.ready.remove(&p.node);
                self.in_flight.insert(p.node.clone());
                self.attempts.insert(p.node, p.attempt.max(1));
            }
            EventType::NodeCompleted => {
                let p: payload::NodeCompleted = event.payload_as();
                self.in_flight.remove(&p.node);
                self.ready.remove(&p.node);
                self.completed.insert(p.node.clone());
                self.context.record_output(&p.node, p.output);
                self.enqueue_successors(graph, &p.node);
            }
            EventType::NodeFailed => {
                let p: payload::NodeFailed = event.payload_as();
                self.in_flight.remove(&p.node);
                if p.will_retry {
                    self.ready.insert(p.node);
                }
            }
            EventType::PolicyDenied => {
                let p: payload::PolicyDenied = event.payload_as();
                self.ready.remove(&p.edge.to);
            }
            EventType::HumanAwaited => {
                let p: payload::HumanAwaited = event.payload_as();
                self.ready.remove(&p.node);
                self.pending_humans.insert(p.node);
            }
            EventType::HumanApproved => {
                let p: payload::HumanDecision = event.payload_as();
                self.pending_humans.remove(&p.node);
                self.completed.insert(p.node.clone());
                if !p.approval_key.is_empty() {
                    self.context.set_bag_entry(&p.approval_key, p.value);
                }
                self.enqueue_successors(graph, &p.node);
            }
            EventType::HumanRejected => {
                let p: payload::HumanDecision = event.payload_as();
                self.pending_humans.remove(&p.node);
                if !p.approval_key.is_empty() {
                    self.context.set_bag_entry(&p.approval_key, p.value);
                }
            }
            EventType::WorkflowCompleted => {
                self.status = RunStatus::Completed;
            }
            EventType::WorkflowFailed => {
                let p: payload::WorkflowFailed = event.payload_as();
                self.status = RunStatus::Failed { reason: p.reason };
            }
            EventType::SnapshotCreated => {}
        }
        self.last_applied = event.sequence;
    }

    /// Insert every successor whose predecessor set is fully completed
    /// (AND-join) and which is not already completed, running, or awaited.
    fn enqueue_successors(&mut self, graph: &Graph, node: &str) {
        let eligible: Vec<String> = graph
            .successors(node)
            .filter(|s| {
                graph.join_satisfied(&s.id, &self.completed)
                    && !self.completed.contains(&s.id)
                    && !self.in_flight.contains(&s.id)
                    && !self.pending_humans.contains(&s.id)
            })
            .map(|s| s.id.clone())
            .collect();
        self.ready.extend(eligible);
    }

    /// True once a terminal event has been applied.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completion condition: every terminal node reachable from start has
    /// completed.
    #[must_use]
    pub fn all_terminals_completed(&self, graph: &Graph) -> bool {
        let mut terminals = graph.reachable_terminals().peekable();
        if terminals.peek().is_none() {
            return false;
        }
        graph
            .reachable_terminals()
            .all(|t| self.completed.contains(&t.id))
    }

    /// Final outputs: captured values of every reachable terminal node.
    #[must_use]
    pub fn terminal_outputs(&self, graph: &Graph) -> Value {
        let mut outputs = serde_json::Map::new();
        for t in graph.reachable_terminals() {
            if let Some(v) = self.context.output(&t.id) {
                outputs.insert(t.id.clone(), v.clone());
            }
        }
        Value::Object(outputs)
    }

    /// Serialize for the snapshot payload.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let persisted = PersistedRunState {
            spec_id: self.spec_id.clone(),
            tenant: self.tenant.clone(),
            context: self.context.to_value(),
            ready: self.ready.iter().cloned().collect(),
            in_flight: self.in_flight.iter().cloned().collect(),
            pending_humans: self.pending_humans.iter().cloned().collect(),
            completed: self.completed.iter().cloned().collect(),
            attempts: self.attempts.clone(),
            status: self.status.clone(),
            last_applied: self.last_applied,
        };
        serde_json::to_value(persisted).unwrap_or(Value::Null)
    }

    /// Rebuild from a snapshot payload. Malformed payloads yield the empty
    /// state, which replay-from-zero then corrects.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let p: PersistedRunState = serde_json::from_value(value).unwrap_or_default();
        Self {
            spec_id: p.spec_id,
            tenant: p.tenant,
            context: RunContext::from_value(p.context),
            ready: p.ready.into_iter().collect(),
            in_flight: p.in_flight.into_iter().collect(),
            pending_humans: p.pending_humans.into_iter().collect(),
            completed: p.completed.into_iter().collect(),
            attempts: p.attempts,
            status: p.status,
            last_applied: p.last_applied,
        }
    }
}

/// Fold a sequence of events over a base state.
#[must_use]
pub fn replay<'a, I>(graph: &Graph, base: RunState, events: I) -> RunState
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut state = base;
    for event in events {
        state.apply(graph, event);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDraft;
    use crate::graphs::GraphBuilder;
    use crate::spec::NodeSpec;
    use crate::types::CorrelationId;
    use chrono::Utc;
    use serde_json::json;

    fn diamond() -> Graph {
        GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("b", "B"))
            .add_node(NodeSpec::task("c", "C"))
            .add_node(NodeSpec::terminal("z", "Z"))
            .add_edge("a", "b", [] as [&str; 0])
            .add_edge("a", "c", [] as [&str; 0])
            .add_edge("b", "z", [] as [&str; 0])
            .add_edge("c", "z", [] as [&str; 0])
            .compile()
            .unwrap()
    }

    fn materialize(cid: &CorrelationId, drafts: Vec<EventDraft>) -> Vec<Event> {
        drafts
            .into_iter()
            .enumerate()
            .map(|(i, d)| Event {
                id: format!("e{i}"),
                correlation_id: cid.clone(),
                sequence: i as u64 + 1,
                event_type: d.event_type,
                payload: d.payload,
                idempotency_key: d.idempotency_key,
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn and_join_waits_for_all_predecessors() {
        let graph = diamond();
        let cid = CorrelationId::from("run-r");
        let events = materialize(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "w", json!({}), None),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_completed(&cid, "a", 1, json!(1)),
                EventDraft::node_started(&cid, "b", 1),
                EventDraft::node_completed(&cid, "b", 1, json!(2)),
            ],
        );
        let state = replay(&graph, RunState::default(), &events);
        // c is ready (fan-out from a); z is not, c has not completed.
        assert!(state.ready.contains("c"));
        assert!(!state.ready.contains("z"));

        let more = materialize(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "w", json!({}), None),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_completed(&cid, "a", 1, json!(1)),
                EventDraft::node_started(&cid, "b", 1),
                EventDraft::node_completed(&cid, "b", 1, json!(2)),
                EventDraft::node_started(&cid, "c", 1),
                EventDraft::node_completed(&cid, "c", 1, json!(3)),
            ],
        );
        let state = replay(&graph, RunState::default(), &more);
        assert!(state.ready.contains("z"));
    }

    #[test]
    fn failed_with_retry_requeues() {
        let graph = diamond();
        let cid = CorrelationId::from("run-r2");
        let events = materialize(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "w", json!({}), None),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_failed(&cid, "a", 1, "boom", true, true),
            ],
        );
        let state = replay(&graph, RunState::default(), &events);
        assert!(state.ready.contains("a"));
        assert_eq!(state.attempts.get("a"), Some(&1));
        assert!(state.in_flight.is_empty());
    }

    #[test]
    fn snapshot_round_trip_is_lossless() {
        let graph = diamond();
        let cid = CorrelationId::from("run-r3");
        let events = materialize(
            &cid,
            vec![
                EventDraft::workflow_started(&cid, "w", json!({"x": 1}), Some("acme")),
                EventDraft::node_started(&cid, "a", 1),
                EventDraft::node_completed(&cid, "a", 1, json!({"ok": true})),
            ],
        );
        let state = replay(&graph, RunState::default(), &events);
        let restored = RunState::from_value(state.to_value());
        assert_eq!(restored, state);
    }

    #[test]
    fn terminal_status_and_outputs() {
        let graph = diamond();
        let cid = CorrelationId::from("run-r4");
        let mut drafts = vec![
            EventDraft::workflow_started(&cid, "w", json!({}), None),
            EventDraft::node_started(&cid, "a", 1),
            EventDraft::node_completed(&cid, "a", 1, json!(1)),
            EventDraft::node_started(&cid, "b", 1),
            EventDraft::node_completed(&cid, "b", 1, json!(2)),
            EventDraft::node_started(&cid, "c", 1),
            EventDraft::node_completed(&cid, "c", 1, json!(3)),
            EventDraft::node_started(&cid, "z", 1),
            EventDraft::node_completed(&cid, "z", 1, json!("fin")),
        ];
        let state = replay(&graph, RunState::default(), &materialize(&cid, drafts.clone()));
        assert!(state.all_terminals_completed(&graph));
        assert_eq!(state.terminal_outputs(&graph), json!({"z": "fin"}));
        assert!(!state.is_terminal());

        drafts.push(EventDraft::workflow_completed(&cid, json!({"z": "fin"})));
        let state = replay(&graph, RunState::default(), &materialize(&cid, drafts));
        assert_eq!(state.status, RunStatus::Completed);
    }
}
