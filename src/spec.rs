//! Declarative workflow specifications.
//!
//! A [`WorkflowSpec`] is the serialization-facing shape of a workflow: an
//! id, an ordered list of nodes, and a list of policy-tagged edges. Specs
//! are loaded from YAML or JSON and handed to
//! [`GraphBuilder::from_spec`](crate::graphs::GraphBuilder::from_spec) for
//! validation and compilation into a runtime graph.
//!
//! Parsing is intentionally dumb: no structural validation happens here
//! beyond serde's shape checks. All graph-level invariants (edge endpoints,
//! cycles, approval keys, retry bounds) are enforced by the compiler so
//! that every violation is reported as a [`CompileError`] with the
//! offending location.
//!
//! [`CompileError`]: crate::graphs::CompileError
//!
//! # Example
//!
//! ```rust
//! use gantry::spec::WorkflowSpec;
//!
//! let spec = WorkflowSpec::from_yaml(r#"
//! id: shipping
//! nodes:
//!   - id: quote
//!     kind: task
//!     name: Quote carrier
//!     expr: bag.parcel
//!   - id: approve
//!     kind: human
//!     name: Ops approval
//!     approval_key: ops_ok
//!   - id: done
//!     kind: terminal
//!     name: Final
//! edges:
//!   - from: quote
//!     to: approve
//!     policies: [require_approval]
//!   - from: approve
//!     to: done
//! "#).unwrap();
//!
//! assert_eq!(spec.id, "shipping");
//! assert_eq!(spec.nodes.len(), 3);
//! assert_eq!(spec.edges[0].policies, vec!["require_approval"]);
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeKind;

/// Declarative retry configuration, delays in milliseconds.
///
/// Converted to a [`RetryPolicy`](crate::types::RetryPolicy) during
/// compilation; bounds are checked there, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(default = "RetrySpec::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "RetrySpec::default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl RetrySpec {
    fn default_base_delay_ms() -> u64 {
        100
    }

    fn default_max_delay_ms() -> u64 {
        30_000
    }
}

/// One node in a declarative workflow spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    /// Context projection expression; see [`crate::context::Projection`]
    /// for the grammar. Empty/absent projects the whole bag.
    #[serde(default)]
    pub expr: Option<String>,
    /// Required for `human` nodes; the bag key the approval value lands in.
    #[serde(default)]
    pub approval_key: Option<String>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    /// Per-attempt timeout in milliseconds; defaults to 30 000.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One directed edge, optionally gated by opaque policy tags.
///
/// Tags are never interpreted by the core; they travel to the policy
/// oracle verbatim. The `on_failure` tag is reserved for compensation
/// edges and is carried but not acted on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub policies: Vec<String>,
}

/// A complete declarative workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Errors surfaced while deserializing a spec document.
#[derive(Debug, Error, Diagnostic)]
pub enum SpecError {
    #[error("invalid YAML workflow spec: {source}")]
    #[diagnostic(
        code(gantry::spec::yaml),
        help("Check indentation and that every node has `id` and `kind`.")
    )]
    Yaml {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid JSON workflow spec: {source}")]
    #[diagnostic(code(gantry::spec::json))]
    Json {
        #[source]
        source: serde_json::Error,
    },
}

impl NodeSpec {
    fn bare(id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            expr: None,
            approval_key: None,
            retry: None,
            timeout_ms: None,
        }
    }

    /// A deterministic task node.
    #[must_use]
    pub fn task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::bare(id, NodeKind::Task, name)
    }

    /// An agent node invoking the tool/model gateway.
    #[must_use]
    pub fn agent(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::bare(id, NodeKind::Agent, name)
    }

    /// A human checkpoint; `approval_key` is where the approval value lands
    /// in the bag.
    #[must_use]
    pub fn human(
        id: impl Into<String>,
        name: impl Into<String>,
        approval_key: impl Into<String>,
    ) -> Self {
        let mut n = Self::bare(id, NodeKind::Human, name);
        n.approval_key = Some(approval_key.into());
        n
    }

    /// A terminal node producing part of the final output.
    #[must_use]
    pub fn terminal(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::bare(id, NodeKind::Terminal, name)
    }

    /// Set the context projection expression.
    #[must_use]
    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.expr = Some(expr.into());
        self
    }

    /// Set the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the per-attempt timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

impl WorkflowSpec {
    /// Parse a spec from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, SpecError> {
        serde_yaml::from_str(text).map_err(|source| SpecError::Yaml { source })
    }

    /// Parse a spec from JSON text.
    pub fn from_json(text: &str) -> Result<Self, SpecError> {
        serde_json::from_str(text).map_err(|source| SpecError::Json { source })
    }

    /// Look up a node spec by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_defaults() {
        let spec = WorkflowSpec::from_yaml(
            r#"
id: w1
nodes:
  - id: a
    kind: task
edges: []
"#,
        )
        .unwrap();
        let node = spec.node("a").unwrap();
        assert_eq!(node.kind, NodeKind::Task);
        assert!(node.expr.is_none());
        assert!(node.retry.is_none());
    }

    #[test]
    fn retry_spec_defaults_fill_in() {
        let spec = WorkflowSpec::from_yaml(
            r#"
id: w1
nodes:
  - id: a
    kind: agent
    retry: { max_attempts: 4 }
"#,
        )
        .unwrap();
        let retry = spec.node("a").unwrap().retry.clone().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay_ms, 100);
        assert_eq!(retry.max_delay_ms, 30_000);
        assert!(!retry.jitter);
    }

    #[test]
    fn json_spec_parses() {
        let spec = WorkflowSpec::from_json(
            r#"{"id":"w2","nodes":[{"id":"z","kind":"terminal","name":"end"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.nodes[0].kind, NodeKind::Terminal);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let err = WorkflowSpec::from_yaml("id: [unclosed").unwrap_err();
        assert!(matches!(err, SpecError::Yaml { .. }));
    }
}
