//! Core types for the gantry workflow engine.
//!
//! This module defines the fundamental identifiers and closed vocabularies
//! used throughout the system: run correlation ids, the four node kinds,
//! the event type vocabulary, and retry policies. These are the domain
//! concepts that define what a run *is*.
//!
//! For runtime execution state (ready sets, reducer state), see
//! [`crate::engine::reducer`].
//!
//! # Examples
//!
//! ```rust
//! use gantry::types::{CorrelationId, EventType, NodeKind};
//!
//! let cid = CorrelationId::from("run-42");
//! assert_eq!(cid.as_str(), "run-42");
//!
//! // Wire names round-trip through the closed vocabulary.
//! let et = EventType::parse("workflow.started").unwrap();
//! assert_eq!(et, EventType::WorkflowStarted);
//! assert!(!et.is_terminal());
//! assert!(EventType::WorkflowFailed.is_terminal());
//!
//! assert_eq!(NodeKind::Human.as_str(), "human");
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies one execution instance of a compiled graph.
///
/// Every event, snapshot, lease, and decision record is keyed by the run's
/// correlation id. The id is an opaque string; [`crate::utils::ids`]
/// generates prefixed UUID forms, but externally supplied ids are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The four shapes a workflow node can take.
///
/// The set is closed on purpose: the compiler, the reducer, and the engine
/// dispatch table each match exhaustively on it, so a new kind requires an
/// explicit addition to all three.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Deterministic step, pure over the run context.
    Task,
    /// Non-deterministic invocation of an external model/tool chain;
    /// the reply is captured verbatim.
    Agent,
    /// Suspends the run until an external resume supplies an approval value.
    Human,
    /// Sink node with no outgoing edges; produces part of the final output.
    Terminal,
}

impl NodeKind {
    /// Wire/persisted form of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Task => "task",
            NodeKind::Agent => "agent",
            NodeKind::Human => "human",
            NodeKind::Terminal => "terminal",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Terminal)
    }

    #[must_use]
    pub fn is_human(&self) -> bool {
        matches!(self, NodeKind::Human)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed vocabulary of run events.
///
/// Every state change in a run is expressed as exactly one of these types.
/// The reducer in [`crate::engine::reducer`] is total over this vocabulary,
/// and the store rejects appends after a terminal type has been materialized
/// for a correlation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.completed")]
    NodeCompleted,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "policy.denied")]
    PolicyDenied,
    #[serde(rename = "human.awaited")]
    HumanAwaited,
    #[serde(rename = "human.approved")]
    HumanApproved,
    #[serde(rename = "human.rejected")]
    HumanRejected,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "snapshot.created")]
    SnapshotCreated,
}

impl EventType {
    /// Dotted wire name, as persisted in the `type` column and published on
    /// the bus.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow.started",
            EventType::NodeStarted => "node.started",
            EventType::NodeCompleted => "node.completed",
            EventType::NodeFailed => "node.failed",
            EventType::PolicyDenied => "policy.denied",
            EventType::HumanAwaited => "human.awaited",
            EventType::HumanApproved => "human.approved",
            EventType::HumanRejected => "human.rejected",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowFailed => "workflow.failed",
            EventType::SnapshotCreated => "snapshot.created",
        }
    }

    /// Parse a wire name back into the vocabulary.
    ///
    /// Returns `None` for anything outside the closed set; callers decide
    /// whether that is a deserialization error or a skip.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "workflow.started" => EventType::WorkflowStarted,
            "node.started" => EventType::NodeStarted,
            "node.completed" => EventType::NodeCompleted,
            "node.failed" => EventType::NodeFailed,
            "policy.denied" => EventType::PolicyDenied,
            "human.awaited" => EventType::HumanAwaited,
            "human.approved" => EventType::HumanApproved,
            "human.rejected" => EventType::HumanRejected,
            "workflow.completed" => EventType::WorkflowCompleted,
            "workflow.failed" => EventType::WorkflowFailed,
            "snapshot.created" => EventType::SnapshotCreated,
            _ => return None,
        })
    }

    /// Terminal types close the event log for their correlation id.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted | EventType::WorkflowFailed
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds enforced by the compiler on [`RetryPolicy::max_attempts`].
pub const RETRY_ATTEMPTS_MIN: u32 = 1;
pub const RETRY_ATTEMPTS_MAX: u32 = 16;

/// Per-node retry policy.
///
/// Attempts are durable: each attempt is recorded in its own `node.started`
/// event, so a recovered run resumes counting where it left off. Delay for
/// attempt `n` (1-based) is `min(max_delay, base_delay * 2^(n-1))`,
/// optionally multiplied by a uniform factor in `[0.5, 1.0)` when jitter is
/// enabled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries up to `max_attempts` with the default delays.
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// True when a failed attempt number `attempt` (1-based) may run again.
    #[must_use]
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Default per-attempt timeout for node behavior invocations.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);
