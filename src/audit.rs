//! Decision records: one audit row per node invocation.
//!
//! Every node invocation — including ones blocked by policy, retried, or
//! failed — produces a [`DecisionRecord`] capturing what went in, what came
//! out, which policies applied, and what it cost. Records flow through a
//! write-only [`DecisionSink`]; the sink is *not* on the critical path of
//! state changes. When it is unavailable, records are parked in a bounded
//! deferred buffer and re-flushed on later emissions; the run continues
//! either way.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::{CorrelationId, NodeKind};

/// One external call made on behalf of a node (tool or model invocation).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalCall {
    pub target: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Named cost counters (tokens, credits, milliseconds of GPU, ...).
pub type CostMeters = FxHashMap<String, f64>;

/// The audit row for a single node invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub correlation_id: CorrelationId,
    pub workflow_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_kind: NodeKind,
    pub allowed: bool,
    pub policies_applied: Vec<String>,
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    #[serde(default)]
    pub external_calls: Vec<ExternalCall>,
    #[serde(default)]
    pub cost_meters: CostMeters,
    pub latency_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("decision sink unavailable: {message}")]
    #[diagnostic(code(gantry::audit::sink_unavailable))]
    Unavailable { message: String },
}

/// Write-only audit sink adapter. Downstream batching (columnar export,
/// warehouse loads) lives behind this interface.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn record(&self, record: DecisionRecord) -> Result<(), SinkError>;
}

/// Sink that collects records in memory; the default for tests and
/// embedded use.
#[derive(Default)]
pub struct MemoryDecisionSink {
    records: std::sync::Mutex<Vec<DecisionRecord>>,
}

impl MemoryDecisionSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().expect("sink mutex poisoned").clone()
    }
}

#[async_trait]
impl DecisionSink for MemoryDecisionSink {
    async fn record(&self, record: DecisionRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .expect("sink mutex poisoned")
            .push(record);
        Ok(())
    }
}

/// Engine-facing recorder wrapping a sink with deferred buffering.
///
/// `emit` never fails and never blocks run progress on sink health: a
/// failed write parks the record (bounded; oldest dropped on overflow) and
/// every later emission first retries the parked backlog.
pub struct DecisionRecorder {
    sink: Arc<dyn DecisionSink>,
    deferred: Mutex<VecDeque<DecisionRecord>>,
    capacity: usize,
}

impl DecisionRecorder {
    /// Default deferred-buffer capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(sink: Arc<dyn DecisionSink>) -> Self {
        Self::with_capacity(sink, Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(sink: Arc<dyn DecisionSink>, capacity: usize) -> Self {
        Self {
            sink,
            deferred: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a decision, flushing any deferred backlog first.
    pub async fn emit(&self, record: DecisionRecord) {
        let mut deferred = self.deferred.lock().await;
        while let Some(parked) = deferred.front().cloned() {
            match self.sink.record(parked).await {
                Ok(()) => {
                    deferred.pop_front();
                }
                Err(_) => break,
            }
        }
        if deferred.is_empty() {
            if let Err(e) = self.sink.record(record.clone()).await {
                warn!(
                    run = %record.correlation_id,
                    node = %record.node_id,
                    error = %e,
                    "decision sink unavailable; deferring record"
                );
                Self::park(&mut deferred, self.capacity, record);
            }
        } else {
            Self::park(&mut deferred, self.capacity, record);
        }
    }

    /// Number of records currently parked.
    pub async fn deferred_len(&self) -> usize {
        self.deferred.lock().await.len()
    }

    fn park(deferred: &mut VecDeque<DecisionRecord>, capacity: usize, record: DecisionRecord) {
        if deferred.len() >= capacity {
            deferred.pop_front();
            warn!("deferred decision buffer full; dropping oldest record");
        }
        deferred.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(node: &str) -> DecisionRecord {
        DecisionRecord {
            correlation_id: CorrelationId::from("run-a"),
            workflow_id: "wf".into(),
            node_id: node.into(),
            node_name: node.to_uppercase(),
            node_kind: NodeKind::Task,
            allowed: true,
            policies_applied: vec![],
            input_snapshot: Value::Null,
            output_snapshot: Value::Null,
            external_calls: vec![],
            cost_meters: CostMeters::default(),
            latency_ms: Some(1.5),
            created_at: Utc::now(),
        }
    }

    struct TogglableSink {
        healthy: AtomicBool,
        inner: MemoryDecisionSink,
    }

    #[async_trait]
    impl DecisionSink for TogglableSink {
        async fn record(&self, record: DecisionRecord) -> Result<(), SinkError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.inner.record(record).await
            } else {
                Err(SinkError::Unavailable {
                    message: "down".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn unavailable_sink_defers_then_flushes_in_order() {
        let sink = Arc::new(TogglableSink {
            healthy: AtomicBool::new(false),
            inner: MemoryDecisionSink::new(),
        });
        let recorder = DecisionRecorder::new(sink.clone());

        recorder.emit(record("a")).await;
        recorder.emit(record("b")).await;
        assert_eq!(recorder.deferred_len().await, 2);
        assert!(sink.inner.records().is_empty());

        sink.healthy.store(true, Ordering::SeqCst);
        recorder.emit(record("c")).await;
        assert_eq!(recorder.deferred_len().await, 0);
        let ids: Vec<String> = sink.inner.records().iter().map(|r| r.node_id.clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let sink = Arc::new(TogglableSink {
            healthy: AtomicBool::new(false),
            inner: MemoryDecisionSink::new(),
        });
        let recorder = DecisionRecorder::with_capacity(sink.clone(), 2);
        recorder.emit(record("a")).await;
        recorder.emit(record("b")).await;
        recorder.emit(record("c")).await;
        assert_eq!(recorder.deferred_len().await, 2);

        sink.healthy.store(true, Ordering::SeqCst);
        recorder.emit(record("d")).await;
        let ids: Vec<String> = sink.inner.records().iter().map(|r| r.node_id.clone()).collect();
        assert_eq!(ids, ["b", "c", "d"]);
    }
}
