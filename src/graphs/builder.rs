//! GraphBuilder: fluent construction of workflow graphs.
//!
//! The builder is a thin, order-preserving accumulator. It performs no
//! validation of its own — every structural rule is enforced by
//! [`compile`](GraphBuilder::compile) so that all violations surface as
//! [`CompileError`](super::CompileError)s, whether the graph came from
//! fluent calls or a parsed spec.

use crate::spec::{EdgeSpec, NodeSpec, WorkflowSpec};

use super::compile::{compile_spec, CompileError, Graph};

/// Builder for workflow graphs.
///
/// # Examples
///
/// ```rust
/// use gantry::graphs::GraphBuilder;
/// use gantry::spec::NodeSpec;
///
/// let graph = GraphBuilder::new("shipping")
///     .add_node(NodeSpec::task("quote", "Quote carrier").with_expr("bag.parcel"))
///     .add_node(NodeSpec::human("approve", "Ops approval", "ops_ok"))
///     .add_node(NodeSpec::terminal("done", "Final"))
///     .add_edge("quote", "approve", ["require_approval"])
///     .add_edge("approve", "done", [] as [&str; 0])
///     .compile()
///     .unwrap();
///
/// assert_eq!(graph.start().id, "quote");
/// assert_eq!(graph.terminals().count(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct GraphBuilder {
    spec_id: String,
    nodes: Vec<NodeSpec>,
    edges: Vec<EdgeSpec>,
}

impl GraphBuilder {
    /// Create an empty builder for a workflow with the given id.
    #[must_use]
    pub fn new(spec_id: impl Into<String>) -> Self {
        Self {
            spec_id: spec_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Seed a builder from a parsed declarative spec.
    ///
    /// Node order in the spec is preserved; it is the tie-break order used
    /// everywhere determinism matters.
    #[must_use]
    pub fn from_spec(spec: WorkflowSpec) -> Self {
        Self {
            spec_id: spec.id,
            nodes: spec.nodes,
            edges: spec.edges,
        }
    }

    /// Add a node. Duplicate ids are reported at compile time.
    #[must_use]
    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a directed edge with zero or more policy tags.
    #[must_use]
    pub fn add_edge<I, S>(mut self, from: impl Into<String>, to: impl Into<String>, policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges.push(EdgeSpec {
            from: from.into(),
            to: to.into(),
            policies: policies.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Validate and compile into an executable [`Graph`].
    pub fn compile(self) -> Result<Graph, CompileError> {
        compile_spec(self.spec_id, self.nodes, self.edges)
    }
}
