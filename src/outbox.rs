//! The outbox publisher: at-least-once drain of stored events to the bus.
//!
//! A standalone long-running worker. It elects itself drain leader through
//! a lease on a dedicated key, reads unpublished outbox rows after its
//! watermark cursor in global append order, publishes each referenced
//! event to the [`EventBus`] keyed by correlation id, and resolves the row:
//! `mark_published` on success, attempt bump on failure, DLQ quarantine
//! once the retry budget is spent.
//!
//! Ordering: rows are processed in append order and a failing row blocks
//! later rows of the same correlation id until it resolves, so downstream
//! consumers observe each run's events in sequence order. Across runs no
//! ordering is promised.
//!
//! The drain loop sleeps a jittered poll interval when idle and can be
//! woken early through [`PublisherHandle::nudge`] — the engine nudges after
//! every append batch.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rustc_hash::FxHashSet;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::{message_for, EventBus};
use crate::lease::{AcquireOutcome, LeaseManager, LeaseToken, RenewOutcome};
use crate::store::EventStore;
use crate::types::CorrelationId;

/// Tunables for the publisher worker.
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Max outbox rows fetched per drain pass.
    pub batch_size: usize,
    /// Publish attempts before an event is quarantined.
    pub max_attempts: u32,
    /// Idle poll interval; a uniform jitter of up to the same length is
    /// added to spread pollers.
    pub poll_interval: Duration,
    /// Quarantine window stamped on DLQ rows (`quarantine_until = now + ttl`).
    pub dlq_ttl: Duration,
    /// Leadership lease key; all publisher candidates contend on it.
    pub lease_key: String,
    pub lease_ttl: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_attempts: 5,
            poll_interval: Duration::from_millis(500),
            dlq_ttl: Duration::from_secs(600),
            lease_key: "outbox-publisher".to_string(),
            lease_ttl: Duration::from_secs(10),
        }
    }
}

/// Control handle for a spawned publisher.
pub struct PublisherHandle {
    nudge: Arc<Notify>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PublisherHandle {
    /// Wake the drain loop immediately instead of waiting out the poll
    /// interval.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    /// A cloneable waker for embedding into the engine.
    #[must_use]
    pub fn nudger(&self) -> Arc<Notify> {
        self.nudge.clone()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// The outbox drain worker. See the module docs for the algorithm.
pub struct OutboxPublisher {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    leases: Arc<dyn LeaseManager>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        leases: Arc<dyn LeaseManager>,
    ) -> Self {
        Self {
            store,
            bus,
            leases,
            config: PublisherConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the worker onto the current runtime.
    #[must_use]
    pub fn spawn(self) -> PublisherHandle {
        let nudge = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker_nudge = nudge.clone();
        let handle = tokio::spawn(async move {
            self.run(worker_nudge, shutdown_rx).await;
        });
        PublisherHandle {
            nudge,
            shutdown_tx,
            handle,
        }
    }

    #[instrument(skip_all, fields(lease_key = %self.config.lease_key))]
    async fn run(self, nudge: Arc<Notify>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            // Leadership: contend on the publisher lease until acquired.
            let token = match self.acquire_leadership(&mut shutdown).await {
                Some(t) => t,
                None => return,
            };
            info!("outbox publisher became drain leader");

            if !self.drain_as_leader(&token, &nudge, &mut shutdown).await {
                let _ = self.leases.release(&token).await;
                return;
            }
            // Leadership lost: release best-effort and contend again.
            let _ = self.leases.release(&token).await;
            warn!("publisher lease lost; re-entering leadership contention");
        }
    }

    /// Returns `None` when shutdown arrived while contending.
    async fn acquire_leadership(
        &self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<LeaseToken> {
        loop {
            match self
                .leases
                .acquire(&self.config.lease_key, self.config.lease_ttl)
                .await
            {
                Ok(AcquireOutcome::Acquired(token)) => return Some(token),
                Ok(AcquireOutcome::Busy) => {}
                Err(e) => warn!(error = %e, "lease backend error during leadership contention"),
            }
            tokio::select! {
                _ = &mut *shutdown => return None,
                () = tokio::time::sleep(self.config.lease_ttl / 2) => {}
            }
        }
    }

    /// Drain until shutdown (returns `false`) or leadership loss (`true`).
    async fn drain_as_leader(
        &self,
        token: &LeaseToken,
        nudge: &Notify,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> bool {
        let mut watermark = 0u64;
        loop {
            match self.leases.renew(token, self.config.lease_ttl).await {
                Ok(RenewOutcome::Renewed) => {}
                Ok(RenewOutcome::Lost) => return true,
                Err(e) => {
                    warn!(error = %e, "lease renewal error; treating as lost");
                    return true;
                }
            }

            let drained = match self.drain_batch(&mut watermark).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "outbox drain error; backing off");
                    tokio::select! {
                        _ = &mut *shutdown => return false,
                        () = tokio::time::sleep(self.config.poll_interval * 2) => continue,
                    }
                }
            };

            if drained > 0 {
                continue;
            }
            // Idle: restart the scan from the beginning next pass so rows
            // re-opened by a DLQ requeue are picked up again.
            watermark = 0;
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.config.poll_interval);
            tokio::select! {
                _ = &mut *shutdown => return false,
                () = nudge.notified() => {}
                () = tokio::time::sleep(self.config.poll_interval + jitter) => {}
            }
        }
    }

    /// One pass over the backlog. Returns the number of rows resolved
    /// (published or quarantined).
    async fn drain_batch(&self, watermark: &mut u64) -> Result<usize, crate::store::StoreError> {
        let rows = self
            .store
            .scan_outbox(self.config.batch_size, *watermark)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut resolved = 0usize;
        // The watermark may only advance over a fully resolved prefix.
        let mut prefix_resolved = true;
        // A failing row blocks later rows of its correlation id so that
        // per-run sequence order survives downstream.
        let mut blocked: FxHashSet<CorrelationId> = FxHashSet::default();

        for row in rows {
            let event = match self.store.fetch_event(&row.event_id).await? {
                Some(e) => e,
                None => {
                    warn!(event_id = %row.event_id, "outbox row references missing event; quarantining");
                    self.store
                        .quarantine(
                            &row.event_id,
                            "outbox row references missing event",
                            chrono::Utc::now()
                                + chrono::Duration::from_std(self.config.dlq_ttl)
                                    .unwrap_or_default(),
                        )
                        .await?;
                    resolved += 1;
                    if prefix_resolved {
                        *watermark = row.cursor;
                    }
                    continue;
                }
            };

            if blocked.contains(&event.correlation_id) {
                prefix_resolved = false;
                continue;
            }

            match self.bus.publish(message_for(event.clone())).await {
                Ok(()) => {
                    self.store.mark_published(&[row.event_id.clone()]).await?;
                    resolved += 1;
                    if prefix_resolved {
                        *watermark = row.cursor;
                    }
                    debug!(
                        run = %event.correlation_id,
                        seq = event.sequence,
                        "published outbox event"
                    );
                }
                Err(e) => {
                    let attempts = self
                        .store
                        .record_publish_failure(&row.event_id, &e.to_string())
                        .await?;
                    if attempts >= self.config.max_attempts {
                        let until = chrono::Utc::now()
                            + chrono::Duration::from_std(self.config.dlq_ttl).unwrap_or_default();
                        self.store
                            .quarantine(&row.event_id, &e.to_string(), until)
                            .await?;
                        warn!(
                            run = %event.correlation_id,
                            seq = event.sequence,
                            attempts,
                            "publish retries exhausted; event quarantined to DLQ"
                        );
                        resolved += 1;
                        if prefix_resolved {
                            *watermark = row.cursor;
                        }
                    } else {
                        blocked.insert(event.correlation_id.clone());
                        prefix_resolved = false;
                        debug!(
                            run = %event.correlation_id,
                            seq = event.sequence,
                            attempts,
                            "publish failed; will retry"
                        );
                    }
                }
            }
        }
        Ok(resolved)
    }
}
