//! Per-run session leases: the single-writer guarantee.
//!
//! A lease is a short-TTL exclusive token keyed by correlation id. Holding
//! a valid lease is the precondition for appending events or writing
//! snapshots for that run; the outbox publisher uses the same mechanism on
//! a dedicated key to elect a single drain leader.
//!
//! Lost leases are non-recoverable: once [`renew`](LeaseManager::renew)
//! reports [`RenewOutcome::Lost`], the holder must stop writing, attempt a
//! fresh [`acquire`](LeaseManager::acquire), and reload state from the
//! store before continuing.
//!
//! The in-memory implementation is suitable for single-process deployments
//! and tests; production deployments back the trait with an external fast
//! store that supports atomic set-if-absent with expiry.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::utils::ids::IdGenerator;

/// Proof of lease ownership; opaque to holders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseToken {
    key: String,
    value: String,
}

impl LeaseToken {
    /// The lease key (usually a correlation id).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Result of an acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Exclusive write right granted until the TTL elapses.
    Acquired(LeaseToken),
    /// Another holder owns a live lease on this key.
    Busy,
}

/// Result of a renewal attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The lease expired or was taken over; the holder must stop writing.
    Lost,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LeaseError {
    #[error("lease backend error: {message}")]
    #[diagnostic(code(gantry::lease::backend))]
    Backend { message: String },
}

/// Lease adapter contract.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Try to take the lease on `key` for `ttl`.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome, LeaseError>;

    /// Extend a held lease. Callers must renew at a cadence below TTL/2
    /// during long operations.
    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> Result<RenewOutcome, LeaseError>;

    /// Give the lease back. Best-effort; expiry handles the rest.
    async fn release(&self, token: &LeaseToken) -> Result<(), LeaseError>;
}

#[derive(Debug)]
struct Held {
    value: String,
    expires_at: Instant,
}

/// Process-local [`LeaseManager`] with monotonic-clock expiry.
#[derive(Default)]
pub struct InMemoryLeaseManager {
    held: Mutex<FxHashMap<String, Held>>,
    ids: IdGenerator,
}

impl InMemoryLeaseManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<AcquireOutcome, LeaseError> {
        let mut held = self.held.lock().expect("lease mutex poisoned");
        let now = Instant::now();
        if let Some(existing) = held.get(key) {
            if existing.expires_at > now {
                return Ok(AcquireOutcome::Busy);
            }
        }
        let value = self.ids.lease_token();
        held.insert(
            key.to_string(),
            Held {
                value: value.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(AcquireOutcome::Acquired(LeaseToken {
            key: key.to_string(),
            value,
        }))
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> Result<RenewOutcome, LeaseError> {
        let mut held = self.held.lock().expect("lease mutex poisoned");
        let now = Instant::now();
        match held.get_mut(&token.key) {
            Some(existing) if existing.value == token.value && existing.expires_at > now => {
                existing.expires_at = now + ttl;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<(), LeaseError> {
        let mut held = self.held.lock().expect("lease mutex poisoned");
        if let Some(existing) = held.get(&token.key) {
            if existing.value == token.value {
                held.remove(&token.key);
            }
        }
        Ok(())
    }
}
