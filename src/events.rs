//! Run events: the envelope, typed payloads, and idempotency keys.
//!
//! Events are the sole durable record of a run. The engine constructs
//! [`EventDraft`]s; the store assigns ids, timestamps, and the dense
//! per-correlation sequence number at append time and hands back stored
//! [`Event`]s. Payloads are `serde_json::Value` on the envelope with typed
//! views ([`payload`]) for the reducer and tests.
//!
//! Idempotency keys are derived deterministically from
//! `(correlation_id, node_id, logical step, attempt)` so that a recovered
//! scheduler re-issuing the same append is absorbed by the store instead of
//! duplicating history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CorrelationId, EventType};

/// Stored event id (UUID text form).
pub type EventId = String;

/// A durably appended event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub correlation_id: CorrelationId,
    /// Dense per-correlation sequence, starting at 1; assigned at append.
    pub sequence: u64,
    pub event_type: EventType,
    pub payload: Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Decode the payload into a typed view. Missing fields fall back to
    /// serde defaults so the reducer stays total over the vocabulary.
    #[must_use]
    pub fn payload_as<T: Default + for<'de> Deserialize<'de>>(&self) -> T {
        serde_json::from_value(self.payload.clone()).unwrap_or_default()
    }
}

/// An event the engine wants appended; the store stamps everything else.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub payload: Value,
    pub idempotency_key: String,
}

impl EventDraft {
    pub fn new(event_type: EventType, payload: Value, idempotency_key: impl Into<String>) -> Self {
        Self {
            event_type,
            payload,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn workflow_started(
        cid: &CorrelationId,
        spec_id: &str,
        initial_bag: Value,
        tenant: Option<&str>,
    ) -> Self {
        Self::new(
            EventType::WorkflowStarted,
            serde_json::json!({
                "spec_id": spec_id,
                "initial_bag": initial_bag,
                "tenant": tenant,
            }),
            // The run's own id is the natural dedupe key for its birth event.
            cid.as_str().to_string(),
        )
    }

    pub fn node_started(cid: &CorrelationId, node: &str, attempt: u32) -> Self {
        Self::new(
            EventType::NodeStarted,
            serde_json::json!({ "node": node, "attempt": attempt }),
            keys::node(cid, node, "started", attempt),
        )
    }

    pub fn node_completed(cid: &CorrelationId, node: &str, attempt: u32, output: Value) -> Self {
        Self::new(
            EventType::NodeCompleted,
            serde_json::json!({ "node": node, "attempt": attempt, "output": output }),
            keys::node(cid, node, "completed", attempt),
        )
    }

    pub fn node_failed(
        cid: &CorrelationId,
        node: &str,
        attempt: u32,
        error: &str,
        transient: bool,
        will_retry: bool,
    ) -> Self {
        Self::new(
            EventType::NodeFailed,
            serde_json::json!({
                "node": node,
                "attempt": attempt,
                "error": error,
                "transient": transient,
                "will_retry": will_retry,
            }),
            keys::node(cid, node, "failed", attempt),
        )
    }

    pub fn policy_denied(
        cid: &CorrelationId,
        from: &str,
        to: &str,
        reason: &str,
        policies: &[String],
    ) -> Self {
        Self::new(
            EventType::PolicyDenied,
            serde_json::json!({
                "edge": { "from": from, "to": to },
                "reason": reason,
                "policies": policies,
            }),
            format!("{}:policy:{from}->{to}", cid.as_str()),
        )
    }

    pub fn human_awaited(cid: &CorrelationId, node: &str, approval_key: &str) -> Self {
        Self::new(
            EventType::HumanAwaited,
            serde_json::json!({ "node": node, "approval_key": approval_key }),
            keys::node(cid, node, "awaited", 1),
        )
    }

    pub fn human_approved(cid: &CorrelationId, node: &str, approval_key: &str, value: Value) -> Self {
        Self::new(
            EventType::HumanApproved,
            serde_json::json!({ "node": node, "approval_key": approval_key, "value": value }),
            keys::node(cid, node, "approved", 1),
        )
    }

    pub fn human_rejected(cid: &CorrelationId, node: &str, approval_key: &str, value: Value) -> Self {
        Self::new(
            EventType::HumanRejected,
            serde_json::json!({ "node": node, "approval_key": approval_key, "value": value }),
            keys::node(cid, node, "rejected", 1),
        )
    }

    pub fn workflow_completed(cid: &CorrelationId, outputs: Value) -> Self {
        Self::new(
            EventType::WorkflowCompleted,
            serde_json::json!({ "outputs": outputs }),
            format!("{}:completed", cid.as_str()),
        )
    }

    pub fn workflow_failed(cid: &CorrelationId, reason: &str, node: Option<&str>) -> Self {
        Self::new(
            EventType::WorkflowFailed,
            serde_json::json!({ "reason": reason, "node": node }),
            format!("{}:failed", cid.as_str()),
        )
    }

    pub fn snapshot_created(cid: &CorrelationId, snapshot_id: &str, up_to_sequence: u64) -> Self {
        Self::new(
            EventType::SnapshotCreated,
            serde_json::json!({ "snapshot_id": snapshot_id, "up_to_sequence": up_to_sequence }),
            format!("{}:snapshot:{up_to_sequence}", cid.as_str()),
        )
    }
}

/// Deterministic idempotency-key derivation.
pub mod keys {
    use crate::types::CorrelationId;

    /// Key for a node-scoped logical step.
    #[must_use]
    pub fn node(cid: &CorrelationId, node: &str, step: &str, attempt: u32) -> String {
        format!("{}:{node}:{step}:{attempt}", cid.as_str())
    }
}

/// Typed payload views, decoded via [`Event::payload_as`].
pub mod payload {
    use super::*;

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct WorkflowStarted {
        pub spec_id: String,
        #[serde(default)]
        pub initial_bag: Value,
        #[serde(default)]
        pub tenant: Option<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct NodeStarted {
        pub node: String,
        #[serde(default)]
        pub attempt: u32,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct NodeCompleted {
        pub node: String,
        #[serde(default)]
        pub attempt: u32,
        #[serde(default)]
        pub output: Value,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct NodeFailed {
        pub node: String,
        #[serde(default)]
        pub attempt: u32,
        #[serde(default)]
        pub error: String,
        #[serde(default)]
        pub transient: bool,
        #[serde(default)]
        pub will_retry: bool,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct EdgeRef {
        pub from: String,
        pub to: String,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct PolicyDenied {
        #[serde(default)]
        pub edge: EdgeRef,
        #[serde(default)]
        pub reason: String,
        #[serde(default)]
        pub policies: Vec<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct HumanAwaited {
        pub node: String,
        #[serde(default)]
        pub approval_key: String,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct HumanDecision {
        pub node: String,
        #[serde(default)]
        pub approval_key: String,
        #[serde(default)]
        pub value: Value,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct WorkflowCompleted {
        #[serde(default)]
        pub outputs: Value,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct WorkflowFailed {
        #[serde(default)]
        pub reason: String,
        #[serde(default)]
        pub node: Option<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize)]
    pub struct SnapshotCreated {
        #[serde(default)]
        pub snapshot_id: String,
        #[serde(default)]
        pub up_to_sequence: u64,
    }
}
