//! The event store adapter: append-only log, snapshots, outbox, and DLQ.
//!
//! The store is the single durability boundary of the engine. Everything a
//! run *is* lives here: its dense event sequence, its snapshots, the outbox
//! rows awaiting downstream publication, and the dead-letter rows whose
//! publication exhausted retries.
//!
//! Two backends ship with the crate:
//!
//! - [`InMemoryEventStore`] — volatile, for tests and embedding.
//! - [`SqliteEventStore`] — durable, behind the `sqlite` feature.
//!
//! # Guarantees
//!
//! - `append` assigns a dense per-correlation sequence starting at 1 and is
//!   atomic across the event and outbox tables.
//! - An append whose `(correlation_id, idempotency_key)` already exists is
//!   absorbed: the existing event is returned instead of a failure, which
//!   makes scheduler retries and crash-recovery re-appends safe.
//! - A terminal event closes the log; later appends fail with
//!   [`StoreError::RunTerminated`].
//! - The outbox `published_at`/`attempts` columns are mutated only through
//!   [`mark_published`](EventStore::mark_published),
//!   [`record_publish_failure`](EventStore::record_publish_failure), and
//!   [`quarantine`](EventStore::quarantine) — the publisher's write paths.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryEventStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::events::{Event, EventDraft, EventId};
use crate::types::CorrelationId;

/// A persisted run snapshot.
///
/// `payload` is the serialized reducer state (context, ready set, pending
/// humans, completed set, attempts, status) at `up_to_sequence`. Snapshots
/// are an optimization: the event log alone must always be able to
/// reconstruct the same state.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub correlation_id: CorrelationId,
    pub snapshot_id: String,
    pub up_to_sequence: u64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Snapshot listing row for the audit surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub up_to_sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// One unpublished (or failing) outbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRow {
    /// Global append ordinal; the publisher's watermark cursor.
    pub cursor: u64,
    pub event_id: EventId,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// One dead-letter row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlqEntry {
    pub event_id: EventId,
    pub error: String,
    pub quarantine_until: DateTime<Utc>,
    pub manual_retries: u32,
    pub quarantined_at: DateTime<Utc>,
}

/// How one draft fared inside an [`append`](EventStore::append).
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    /// Newly materialized.
    Appended(Event),
    /// Absorbed by idempotency; this is the pre-existing event.
    Deduplicated(Event),
}

impl AppendOutcome {
    #[must_use]
    pub fn event(&self) -> &Event {
        match self {
            AppendOutcome::Appended(e) | AppendOutcome::Deduplicated(e) => e,
        }
    }

    #[must_use]
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended(_))
    }
}

/// Result of an append call, one outcome per draft in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendReceipt {
    pub outcomes: Vec<AppendOutcome>,
}

impl AppendReceipt {
    /// Events that were newly materialized by this call.
    pub fn appended(&self) -> impl Iterator<Item = &Event> {
        self.outcomes
            .iter()
            .filter(|o| o.is_appended())
            .map(AppendOutcome::event)
    }

    /// All events the drafts resolved to, appended or deduplicated.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.outcomes.iter().map(AppendOutcome::event)
    }
}

/// Store failures.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("sequence conflict for run {correlation_id} at sequence {sequence}")]
    #[diagnostic(
        code(gantry::store::sequence_conflict),
        help(
            "Another writer appended concurrently; check the run lease and reload from the store."
        )
    )]
    SequenceConflict {
        correlation_id: CorrelationId,
        sequence: u64,
    },

    #[error("run {correlation_id} is terminated; no further events may be appended")]
    #[diagnostic(code(gantry::store::run_terminated))]
    RunTerminated { correlation_id: CorrelationId },

    #[error("unknown event id {event_id}")]
    #[diagnostic(code(gantry::store::unknown_event))]
    UnknownEvent { event_id: EventId },

    #[error("event {event_id} is not quarantined")]
    #[diagnostic(code(gantry::store::not_quarantined))]
    NotQuarantined { event_id: EventId },

    #[error("serialization failure: {source}")]
    #[diagnostic(code(gantry::store::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    #[error("store backend error: {message}")]
    #[diagnostic(code(gantry::store::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Event store adapter contract.
///
/// Any engine satisfying these semantics can back the core; see the module
/// docs for the guarantees each operation carries.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append `drafts` (in order) for one run, creating one
    /// outbox row per newly materialized event.
    async fn append(
        &self,
        correlation_id: &CorrelationId,
        drafts: Vec<EventDraft>,
    ) -> Result<AppendReceipt>;

    /// Events with `sequence > from_seq`, in sequence order. `from_seq = 0`
    /// loads the full log; passing the last seen sequence restarts a read.
    async fn load(&self, correlation_id: &CorrelationId, from_seq: u64) -> Result<Vec<Event>>;

    /// Highest assigned sequence for a run (0 when the run has no events).
    async fn head(&self, correlation_id: &CorrelationId) -> Result<u64>;

    /// Persist a snapshot; becomes the latest for its correlation id.
    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Most recent snapshot, by `up_to_sequence`.
    async fn read_snapshot(&self, correlation_id: &CorrelationId) -> Result<Option<Snapshot>>;

    /// A specific historical snapshot.
    async fn read_snapshot_by_id(
        &self,
        correlation_id: &CorrelationId,
        snapshot_id: &str,
    ) -> Result<Option<Snapshot>>;

    /// All snapshots for a run, oldest first.
    async fn list_snapshots(&self, correlation_id: &CorrelationId) -> Result<Vec<SnapshotMeta>>;

    /// Unresolved outbox rows with `cursor > after`, in append order.
    async fn scan_outbox(&self, limit: usize, after: u64) -> Result<Vec<OutboxRow>>;

    /// Fetch a stored event by id.
    async fn fetch_event(&self, event_id: &EventId) -> Result<Option<Event>>;

    /// Mark outbox rows as successfully published.
    async fn mark_published(&self, event_ids: &[EventId]) -> Result<()>;

    /// Record a failed publish attempt; returns the new attempt count.
    async fn record_publish_failure(&self, event_id: &EventId, error: &str) -> Result<u32>;

    /// Move an event to the DLQ and resolve its outbox row with an error
    /// marker so the backlog no longer reports it.
    async fn quarantine(
        &self,
        event_id: &EventId,
        error: &str,
        quarantine_until: DateTime<Utc>,
    ) -> Result<()>;

    /// DLQ rows; `ready_only` restricts to `quarantine_until <= now`.
    async fn dlq_list(&self, ready_only: bool) -> Result<Vec<DlqEntry>>;

    /// Reset a quarantined event's publication state so the publisher
    /// re-attempts it; bumps the manual retry counter.
    async fn dlq_requeue(&self, event_id: &EventId) -> Result<()>;

    /// Permanently remove a DLQ row (operator action).
    async fn dlq_purge(&self, event_id: &EventId) -> Result<()>;
}

/// Retention horizons for durable state, consumed by explicit maintenance
/// sweeps. Nothing is pruned implicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Events and snapshots of terminated runs older than this are eligible.
    pub terminated_runs: std::time::Duration,
    /// DLQ rows older than this are eligible.
    pub dlq: std::time::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            terminated_runs: std::time::Duration::from_secs(30 * 24 * 3600),
            dlq: std::time::Duration::from_secs(14 * 24 * 3600),
        }
    }
}
