//! Volatile in-memory event store for tests and embedding.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::events::{Event, EventDraft, EventId};
use crate::types::CorrelationId;
use crate::utils::ids::IdGenerator;

use super::{
    AppendOutcome, AppendReceipt, DlqEntry, EventStore, OutboxRow, Result, Snapshot, SnapshotMeta,
    StoreError,
};

#[derive(Clone, Debug)]
struct OutboxState {
    event_index: usize,
    published_at: Option<DateTime<Utc>>,
    attempts: u32,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// Global append order; the vector position + 1 is the outbox cursor.
    events: Vec<Event>,
    by_id: FxHashMap<EventId, usize>,
    by_corr: FxHashMap<CorrelationId, Vec<usize>>,
    idem: FxHashMap<(CorrelationId, String), usize>,
    terminated: FxHashSet<CorrelationId>,
    outbox: Vec<OutboxState>,
    snapshots: FxHashMap<CorrelationId, Vec<Snapshot>>,
    dlq: FxHashMap<EventId, DlqEntry>,
    /// Survives requeue so a re-quarantined event keeps its counter.
    manual_retries: FxHashMap<EventId, u32>,
}

/// In-memory [`EventStore`] with the full contract, including outbox and
/// DLQ semantics. State is lost on drop.
#[derive(Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
    ids: IdGenerator,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a panic escaped while holding the
        // guard; propagating the panic is the correct response.
        self.inner.lock().expect("store mutex poisoned")
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        correlation_id: &CorrelationId,
        drafts: Vec<EventDraft>,
    ) -> Result<AppendReceipt> {
        let mut inner = self.lock();
        let mut receipt = AppendReceipt::default();

        for draft in drafts {
            let idem_key = (correlation_id.clone(), draft.idempotency_key.clone());
            if let Some(&existing) = inner.idem.get(&idem_key) {
                receipt
                    .outcomes
                    .push(AppendOutcome::Deduplicated(inner.events[existing].clone()));
                continue;
            }
            if inner.terminated.contains(correlation_id) {
                return Err(StoreError::RunTerminated {
                    correlation_id: correlation_id.clone(),
                });
            }

            let sequence = inner
                .by_corr
                .get(correlation_id)
                .and_then(|v| v.last())
                .map(|&i| inner.events[i].sequence)
                .unwrap_or(0)
                + 1;

            let event = Event {
                id: self.ids.event_id(),
                correlation_id: correlation_id.clone(),
                sequence,
                event_type: draft.event_type,
                payload: draft.payload,
                idempotency_key: draft.idempotency_key,
                created_at: Utc::now(),
            };

            let index = inner.events.len();
            inner.by_id.insert(event.id.clone(), index);
            inner
                .by_corr
                .entry(correlation_id.clone())
                .or_default()
                .push(index);
            inner.idem.insert(idem_key, index);
            if event.event_type.is_terminal() {
                inner.terminated.insert(correlation_id.clone());
            }
            inner.outbox.push(OutboxState {
                event_index: index,
                published_at: None,
                attempts: 0,
                last_error: None,
            });
            inner.events.push(event.clone());
            receipt.outcomes.push(AppendOutcome::Appended(event));
        }

        Ok(receipt)
    }

    async fn load(&self, correlation_id: &CorrelationId, from_seq: u64) -> Result<Vec<Event>> {
        let inner = self.lock();
        Ok(inner
            .by_corr
            .get(correlation_id)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|&i| &inner.events[i])
                    .filter(|e| e.sequence > from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head(&self, correlation_id: &CorrelationId) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .by_corr
            .get(correlation_id)
            .and_then(|v| v.last())
            .map(|&i| inner.events[i].sequence)
            .unwrap_or(0))
    }

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.lock();
        inner
            .snapshots
            .entry(snapshot.correlation_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self, correlation_id: &CorrelationId) -> Result<Option<Snapshot>> {
        let inner = self.lock();
        Ok(inner
            .snapshots
            .get(correlation_id)
            .and_then(|v| v.iter().max_by_key(|s| s.up_to_sequence))
            .cloned())
    }

    async fn read_snapshot_by_id(
        &self,
        correlation_id: &CorrelationId,
        snapshot_id: &str,
    ) -> Result<Option<Snapshot>> {
        let inner = self.lock();
        Ok(inner
            .snapshots
            .get(correlation_id)
            .and_then(|v| v.iter().find(|s| s.snapshot_id == snapshot_id))
            .cloned())
    }

    async fn list_snapshots(&self, correlation_id: &CorrelationId) -> Result<Vec<SnapshotMeta>> {
        let inner = self.lock();
        let mut metas: Vec<SnapshotMeta> = inner
            .snapshots
            .get(correlation_id)
            .map(|v| {
                v.iter()
                    .map(|s| SnapshotMeta {
                        snapshot_id: s.snapshot_id.clone(),
                        up_to_sequence: s.up_to_sequence,
                        created_at: s.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        metas.sort_by_key(|m| m.up_to_sequence);
        Ok(metas)
    }

    async fn scan_outbox(&self, limit: usize, after: u64) -> Result<Vec<OutboxRow>> {
        let inner = self.lock();
        Ok(inner
            .outbox
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u64 + 1, s))
            .filter(|(cursor, s)| *cursor > after && s.published_at.is_none())
            .take(limit)
            .map(|(cursor, s)| OutboxRow {
                cursor,
                event_id: inner.events[s.event_index].id.clone(),
                attempts: s.attempts,
                last_error: s.last_error.clone(),
            })
            .collect())
    }

    async fn fetch_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        let inner = self.lock();
        Ok(inner.by_id.get(event_id).map(|&i| inner.events[i].clone()))
    }

    async fn mark_published(&self, event_ids: &[EventId]) -> Result<()> {
        let mut inner = self.lock();
        let now = Utc::now();
        for id in event_ids {
            let index = *inner.by_id.get(id).ok_or_else(|| StoreError::UnknownEvent {
                event_id: id.clone(),
            })?;
            if let Some(state) = inner.outbox.iter_mut().find(|s| s.event_index == index) {
                state.published_at = Some(now);
            }
        }
        Ok(())
    }

    async fn record_publish_failure(&self, event_id: &EventId, error: &str) -> Result<u32> {
        let mut inner = self.lock();
        let index = *inner
            .by_id
            .get(event_id)
            .ok_or_else(|| StoreError::UnknownEvent {
                event_id: event_id.clone(),
            })?;
        let state = inner
            .outbox
            .iter_mut()
            .find(|s| s.event_index == index)
            .ok_or_else(|| StoreError::UnknownEvent {
                event_id: event_id.clone(),
            })?;
        state.attempts += 1;
        state.last_error = Some(error.to_string());
        Ok(state.attempts)
    }

    async fn quarantine(
        &self,
        event_id: &EventId,
        error: &str,
        quarantine_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let index = *inner
            .by_id
            .get(event_id)
            .ok_or_else(|| StoreError::UnknownEvent {
                event_id: event_id.clone(),
            })?;
        let now = Utc::now();
        if let Some(state) = inner.outbox.iter_mut().find(|s| s.event_index == index) {
            state.published_at = Some(now);
            state.last_error = Some(format!("error: {error}"));
        }
        let manual_retries = inner.manual_retries.get(event_id).copied().unwrap_or(0);
        inner.dlq.insert(
            event_id.clone(),
            DlqEntry {
                event_id: event_id.clone(),
                error: error.to_string(),
                quarantine_until,
                manual_retries,
                quarantined_at: now,
            },
        );
        Ok(())
    }

    async fn dlq_list(&self, ready_only: bool) -> Result<Vec<DlqEntry>> {
        let inner = self.lock();
        let now = Utc::now();
        let mut entries: Vec<DlqEntry> = inner
            .dlq
            .values()
            .filter(|e| !ready_only || e.quarantine_until <= now)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.quarantined_at.cmp(&b.quarantined_at));
        Ok(entries)
    }

    async fn dlq_requeue(&self, event_id: &EventId) -> Result<()> {
        let mut inner = self.lock();
        inner
            .dlq
            .remove(event_id)
            .ok_or_else(|| StoreError::NotQuarantined {
                event_id: event_id.clone(),
            })?;
        let index = *inner
            .by_id
            .get(event_id)
            .ok_or_else(|| StoreError::UnknownEvent {
                event_id: event_id.clone(),
            })?;
        if let Some(state) = inner.outbox.iter_mut().find(|s| s.event_index == index) {
            state.published_at = None;
            state.attempts = 0;
            state.last_error = None;
        }
        *inner.manual_retries.entry(event_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn dlq_purge(&self, event_id: &EventId) -> Result<()> {
        let mut inner = self.lock();
        inner
            .dlq
            .remove(event_id)
            .ok_or_else(|| StoreError::NotQuarantined {
                event_id: event_id.clone(),
            })?;
        Ok(())
    }
}
