//! Dead-letter queue: operator surface over quarantined events.
//!
//! Events land here when the publisher exhausts its retry budget. Rows
//! carry the last error, a `quarantine_until` timestamp, and a manual
//! retry counter that survives requeues. All state lives in the event
//! store; this type is the operator-facing API over it.

use std::sync::Arc;

use crate::events::EventId;
use crate::store::{DlqEntry, EventStore, Result};

/// Operator handle for DLQ inspection and recovery.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn EventStore>,
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// All quarantined entries, oldest first.
    pub async fn list(&self) -> Result<Vec<DlqEntry>> {
        self.store.dlq_list(false).await
    }

    /// Entries whose quarantine window has elapsed (`quarantine_until <= now`).
    pub async fn list_ready_for_retry(&self) -> Result<Vec<DlqEntry>> {
        self.store.dlq_list(true).await
    }

    /// Reset an event's publication state; the publisher will re-attempt it
    /// on its next pass. Bumps the manual retry counter.
    pub async fn requeue(&self, event_id: &EventId) -> Result<()> {
        self.store.dlq_requeue(event_id).await
    }

    /// Permanently remove an entry. Operator action only; the underlying
    /// event stays in the log.
    pub async fn purge(&self, event_id: &EventId) -> Result<()> {
        self.store.dlq_purge(event_id).await
    }
}
