//! Graph construction and compilation.
//!
//! [`GraphBuilder`] collects nodes and edges (fluently or from a
//! declarative [`WorkflowSpec`](crate::spec::WorkflowSpec)) and
//! [`compile`](GraphBuilder::compile)s them into an executable [`Graph`]:
//! validated, acyclic, with forward/reverse adjacency indexes, a
//! deterministic topological order, and precomputed transitive predecessor
//! sets for join evaluation.
//!
//! Compilation is pure and side-effect-free; the same spec always yields
//! an identical graph.

mod builder;
mod compile;

pub use builder::GraphBuilder;
pub use compile::{CompileError, CompiledEdge, Graph, NodeDef};
