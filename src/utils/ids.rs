//! Identifier generation.
//!
//! All runtime identifiers are prefixed UUID v4 strings so that a log line
//! or a database row is self-describing about what kind of id it carries.

use uuid::Uuid;

use crate::types::CorrelationId;

/// Generates prefixed unique identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Fresh correlation id for a new run.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::new(format!("run-{}", Uuid::new_v4()))
    }

    /// Fresh event id.
    #[must_use]
    pub fn event_id(&self) -> String {
        format!("evt-{}", Uuid::new_v4())
    }

    /// Fresh snapshot id.
    #[must_use]
    pub fn snapshot_id(&self) -> String {
        format!("snap-{}", Uuid::new_v4())
    }

    /// Fresh lease token value.
    #[must_use]
    pub fn lease_token(&self) -> String {
        format!("lease-{}", Uuid::new_v4())
    }
}
