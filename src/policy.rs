//! Policy oracle client: deny-by-exception edge gating.
//!
//! The core never interprets policy tags. For every gated edge it builds an
//! [`OracleInput`] document — the target node, a projection of the run
//! context bag, the edge's tags, and the edge itself — and asks the
//! external oracle for a verdict. The oracle is expected to be
//! deterministic over its inputs; the engine evaluates each edge once per
//! node-step, which is the only caching that happens.
//!
//! Network failures are retried with exponential backoff; exhaustion is
//! **fail-closed**: the client returns a deny with
//! `reason = "oracle_unavailable"` and the run terminates with
//! `policy.denied`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::types::NodeKind;

/// Deny reason used when the oracle cannot be reached.
pub const REASON_ORACLE_UNAVAILABLE: &str = "oracle_unavailable";

/// The verdict for one edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "decision")]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Node description inside an oracle input document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

/// Edge description inside an oracle input document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleEdge {
    pub from: String,
    pub to: String,
}

/// The document posted to the oracle for one edge evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleInput {
    /// The node the edge leads to.
    pub node: OracleNode,
    /// Projection of the run context bag at evaluation time.
    pub bag: Value,
    /// The edge's opaque policy tags.
    pub policies: Vec<String>,
    pub edge: OracleEdge,
}

#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    #[error("policy oracle unavailable: {message}")]
    #[diagnostic(
        code(gantry::policy::unavailable),
        help("Transient oracle failures are retried; exhaustion fails closed as a deny.")
    )]
    Unavailable { message: String },
}

/// External decision service adapter.
#[async_trait]
pub trait PolicyOracle: Send + Sync {
    async fn evaluate(&self, input: &OracleInput) -> Result<Decision, OracleError>;
}

/// Oracle that allows everything. The default for unconfigured engines and
/// the zero-policy test path.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllOracle;

#[async_trait]
impl PolicyOracle for AllowAllOracle {
    async fn evaluate(&self, _input: &OracleInput) -> Result<Decision, OracleError> {
        Ok(Decision::Allow)
    }
}

/// Offline tag-table oracle: denies an edge when any of its tags appears in
/// the deny set. Ships with `deny_all` denied, matching the conventional
/// kill-switch tag.
#[derive(Clone, Debug)]
pub struct TagTableOracle {
    denied: Vec<String>,
}

impl Default for TagTableOracle {
    fn default() -> Self {
        Self {
            denied: vec!["deny_all".to_string()],
        }
    }
}

impl TagTableOracle {
    #[must_use]
    pub fn denying<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: tags.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyOracle for TagTableOracle {
    async fn evaluate(&self, input: &OracleInput) -> Result<Decision, OracleError> {
        match input.policies.iter().find(|t| self.denied.contains(t)) {
            Some(tag) => Ok(Decision::deny(format!("tag {tag} denied"))),
            None => Ok(Decision::Allow),
        }
    }
}

/// Retrying, fail-closed wrapper around a [`PolicyOracle`].
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn PolicyOracle>,
    max_attempts: u32,
    base_delay: Duration,
}

impl OracleClient {
    /// Defaults: 3 attempts, 50 ms base backoff.
    #[must_use]
    pub fn new(oracle: Arc<dyn PolicyOracle>) -> Self {
        Self {
            oracle,
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }

    #[must_use]
    pub fn with_retries(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    /// Evaluate one edge. Errors are retried with exponential backoff up to
    /// the configured attempts; exhaustion yields a deny with
    /// [`REASON_ORACLE_UNAVAILABLE`].
    pub async fn evaluate(&self, input: &OracleInput) -> Decision {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.oracle.evaluate(input).await {
                Ok(decision) => return decision,
                Err(OracleError::Unavailable { message }) => {
                    last_error = message;
                    if attempt < self.max_attempts {
                        let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        warn!(
            edge.from = %input.edge.from,
            edge.to = %input.edge.to,
            error = %last_error,
            "policy oracle unreachable; failing closed"
        );
        Decision::deny(REASON_ORACLE_UNAVAILABLE)
    }
}
