//! Spec validation and compilation into the runtime [`Graph`].
//!
//! The compiler enforces every structural invariant of a workflow before
//! the engine ever sees it: edge endpoints exist, ids are unique, the
//! graph is acyclic with exactly one start node, human nodes carry
//! approval keys, and retry policies are within bounds. On success it
//! produces flat adjacency indexes (forward and reverse), a deterministic
//! topological order, and per-node transitive predecessor sets — no owning
//! pointers between nodes, only stable indexes.

use std::collections::BinaryHeap;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::context::{Projection, ProjectionError};
use crate::spec::{EdgeSpec, NodeSpec};
use crate::types::{
    NodeKind, RetryPolicy, DEFAULT_NODE_TIMEOUT, RETRY_ATTEMPTS_MAX, RETRY_ATTEMPTS_MIN,
};

/// A validated, executable node.
#[derive(Clone, Debug)]
pub struct NodeDef {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// Compiled context projection (whole bag when the spec omitted `expr`).
    pub projection: Projection,
    pub approval_key: Option<String>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

/// A validated edge, endpoints as node indexes into [`Graph::nodes`].
#[derive(Clone, Debug)]
pub struct CompiledEdge {
    pub from: usize,
    pub to: usize,
    pub policies: Vec<String>,
}

/// Compile-time rejections, each pointing at the offending location.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("workflow spec has no nodes")]
    #[diagnostic(code(gantry::compile::empty_graph))]
    EmptyGraph,

    #[error("duplicate node id `{node_id}`")]
    #[diagnostic(
        code(gantry::compile::duplicate_node_id),
        help("Node ids must be unique within a workflow spec.")
    )]
    DuplicateNodeId { node_id: String },

    #[error("edge `{from}` -> `{to}` references unknown node `{missing}`")]
    #[diagnostic(code(gantry::compile::unknown_node_reference))]
    UnknownNodeReference {
        from: String,
        to: String,
        missing: String,
    },

    #[error("cycle detected: {}", path.join(" -> "))]
    #[diagnostic(
        code(gantry::compile::cycle_detected),
        help("Workflow graphs must be acyclic; break the loop or route it through a new run.")
    )]
    CycleDetected { path: Vec<String> },

    #[error("human node `{node_id}` has no approval_key")]
    #[diagnostic(
        code(gantry::compile::missing_approval_key),
        help("Every human checkpoint needs the bag key its approval value lands in.")
    )]
    MissingApprovalKey { node_id: String },

    #[error("invalid retry policy on node `{node_id}`: {field}")]
    #[diagnostic(code(gantry::compile::invalid_retry_policy))]
    InvalidRetryPolicy {
        node_id: String,
        field: &'static str,
    },

    #[error("invalid projection on node `{node_id}`")]
    #[diagnostic(code(gantry::compile::invalid_projection))]
    InvalidProjection {
        node_id: String,
        #[source]
        source: ProjectionError,
    },

    #[error("no start node: every non-terminal node has incoming edges")]
    #[diagnostic(code(gantry::compile::no_start_node))]
    NoStartNode,

    #[error("multiple start nodes: {}", candidates.join(", "))]
    #[diagnostic(
        code(gantry::compile::multiple_start_nodes),
        help("Exactly one non-terminal node may have in-degree zero.")
    )]
    MultipleStartNodes { candidates: Vec<String> },
}

/// A validated runtime DAG.
///
/// Node order follows the spec; all adjacency is indexed by position so
/// lookups are O(1) and iteration order is deterministic.
#[derive(Clone, Debug)]
pub struct Graph {
    spec_id: String,
    nodes: Vec<NodeDef>,
    index: FxHashMap<String, usize>,
    edges: Vec<CompiledEdge>,
    forward: Vec<Vec<usize>>,
    reverse: Vec<Vec<usize>>,
    edge_of: FxHashMap<(usize, usize), usize>,
    topo_rank: Vec<usize>,
    transitive_preds: Vec<FxHashSet<usize>>,
    start: usize,
    terminals: Vec<usize>,
    reachable: Vec<bool>,
}

impl Graph {
    /// The workflow id this graph was compiled from.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec_id
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The single start node.
    #[must_use]
    pub fn start(&self) -> &NodeDef {
        &self.nodes[self.start]
    }

    /// All terminal nodes, in spec order.
    pub fn terminals(&self) -> impl Iterator<Item = &NodeDef> {
        self.terminals.iter().map(move |&i| &self.nodes[i])
    }

    /// Terminal nodes reachable from the start node; only these gate run
    /// completion.
    pub fn reachable_terminals(&self) -> impl Iterator<Item = &NodeDef> {
        self.terminals
            .iter()
            .filter(move |&&i| self.reachable[i])
            .map(move |&i| &self.nodes[i])
    }

    /// Direct successors of a node, in spec order.
    pub fn successors(&self, id: &str) -> impl Iterator<Item = &NodeDef> {
        self.adjacent(id, &self.forward)
    }

    /// Direct predecessors of a node, in spec order.
    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &NodeDef> {
        self.adjacent(id, &self.reverse)
    }

    fn adjacent<'a>(&'a self, id: &str, table: &'a [Vec<usize>]) -> impl Iterator<Item = &'a NodeDef> {
        let list: &'a [usize] = self
            .index
            .get(id)
            .map(|&i| table[i].as_slice())
            .unwrap_or(&[]);
        list.iter().map(move |&i| &self.nodes[i])
    }

    /// Edges arriving at a node, in spec order of their sources.
    pub fn incoming_edges(&self, id: &str) -> impl Iterator<Item = &CompiledEdge> {
        let edges: Vec<&CompiledEdge> = match self.index.get(id) {
            Some(&to) => self.reverse[to]
                .iter()
                .filter_map(|&from| self.edge_of.get(&(from, to)))
                .map(|&e| &self.edges[e])
                .collect(),
            None => Vec::new(),
        };
        edges.into_iter()
    }

    /// The edge between two nodes, if one exists.
    #[must_use]
    pub fn edge_between(&self, from: &str, to: &str) -> Option<&CompiledEdge> {
        let from = *self.index.get(from)?;
        let to = *self.index.get(to)?;
        self.edge_of.get(&(from, to)).map(|&e| &self.edges[e])
    }

    /// Node id of an edge endpoint.
    #[must_use]
    pub fn node_id_at(&self, index: usize) -> &str {
        &self.nodes[index].id
    }

    /// Position of a node in the deterministic topological order.
    #[must_use]
    pub fn topo_rank(&self, id: &str) -> usize {
        self.index.get(id).map(|&i| self.topo_rank[i]).unwrap_or(usize::MAX)
    }

    /// Every node that precedes `id` along any path.
    pub fn transitive_predecessors(&self, id: &str) -> impl Iterator<Item = &NodeDef> {
        let set: Vec<usize> = match self.index.get(id) {
            Some(&i) => {
                let mut v: Vec<usize> = self.transitive_preds[i].iter().copied().collect();
                v.sort_unstable();
                v
            }
            None => Vec::new(),
        };
        set.into_iter().map(move |i| &self.nodes[i])
    }

    /// AND-join check: all direct predecessors of `id` are in `completed`.
    #[must_use]
    pub fn join_satisfied(&self, id: &str, completed: &std::collections::BTreeSet<String>) -> bool {
        self.predecessors(id).all(|p| completed.contains(&p.id))
    }

    /// Deterministic scheduling tie-break: the ready node with the lowest
    /// topological rank, then the lowest id.
    #[must_use]
    pub fn pick_next<'a, I>(&self, ready: I) -> Option<&NodeDef>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ready
            .into_iter()
            .filter_map(|id| self.node(id))
            .min_by(|a, b| {
                self.topo_rank(&a.id)
                    .cmp(&self.topo_rank(&b.id))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}

fn build_node(spec: NodeSpec) -> Result<NodeDef, CompileError> {
    if spec.kind.is_human() {
        match spec.approval_key.as_deref() {
            Some(k) if !k.trim().is_empty() => {}
            _ => {
                return Err(CompileError::MissingApprovalKey {
                    node_id: spec.id,
                })
            }
        }
    }

    let retry = match &spec.retry {
        None => RetryPolicy::default(),
        Some(r) => {
            if r.max_attempts < RETRY_ATTEMPTS_MIN || r.max_attempts > RETRY_ATTEMPTS_MAX {
                return Err(CompileError::InvalidRetryPolicy {
                    node_id: spec.id,
                    field: "max_attempts",
                });
            }
            if r.base_delay_ms > r.max_delay_ms {
                return Err(CompileError::InvalidRetryPolicy {
                    node_id: spec.id,
                    field: "base_delay",
                });
            }
            RetryPolicy {
                max_attempts: r.max_attempts,
                base_delay: Duration::from_millis(r.base_delay_ms),
                max_delay: Duration::from_millis(r.max_delay_ms),
                jitter: r.jitter,
            }
        }
    };

    let projection = match &spec.expr {
        None => Projection::whole_bag(),
        Some(expr) => Projection::parse(expr).map_err(|source| CompileError::InvalidProjection {
            node_id: spec.id.clone(),
            source,
        })?,
    };

    let timeout = spec
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_NODE_TIMEOUT);

    Ok(NodeDef {
        id: spec.id,
        name: spec.name,
        kind: spec.kind,
        projection,
        approval_key: spec.approval_key,
        retry,
        timeout,
    })
}

/// Find a cycle with iterative DFS; the first back-edge encountered is
/// reported with its full path.
fn find_cycle(nodes: &[NodeDef], forward: &[Vec<usize>]) -> Option<Vec<String>> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut color = vec![WHITE; nodes.len()];
    for root in 0..nodes.len() {
        if color[root] != WHITE {
            continue;
        }
        // Stack holds (node, next child position); `path` mirrors the gray
        // chain for cycle reconstruction.
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        let mut path: Vec<usize> = vec![root];
        color[root] = GRAY;

        while let Some(&mut (node, ref mut next)) = stack.last_mut() {
            if *next < forward[node].len() {
                let child = forward[node][*next];
                *next += 1;
                match color[child] {
                    WHITE => {
                        color[child] = GRAY;
                        stack.push((child, 0));
                        path.push(child);
                    }
                    GRAY => {
                        let start = path.iter().position(|&n| n == child).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&n| nodes[n].id.clone()).collect();
                        cycle.push(nodes[child].id.clone());
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                color[node] = BLACK;
                stack.pop();
                path.pop();
            }
        }
    }
    None
}

pub(super) fn compile_spec(
    spec_id: String,
    node_specs: Vec<NodeSpec>,
    edge_specs: Vec<EdgeSpec>,
) -> Result<Graph, CompileError> {
    if node_specs.is_empty() {
        return Err(CompileError::EmptyGraph);
    }

    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    for (i, n) in node_specs.iter().enumerate() {
        if index.insert(n.id.clone(), i).is_some() {
            return Err(CompileError::DuplicateNodeId {
                node_id: n.id.clone(),
            });
        }
    }

    let mut nodes = Vec::with_capacity(node_specs.len());
    for spec in node_specs {
        nodes.push(build_node(spec)?);
    }

    // Resolve edges; duplicate (from, to) pairs merge their policy tags.
    let mut edges: Vec<CompiledEdge> = Vec::new();
    let mut edge_of: FxHashMap<(usize, usize), usize> = FxHashMap::default();
    for e in edge_specs {
        let from = *index
            .get(&e.from)
            .ok_or_else(|| CompileError::UnknownNodeReference {
                from: e.from.clone(),
                to: e.to.clone(),
                missing: e.from.clone(),
            })?;
        let to = *index
            .get(&e.to)
            .ok_or_else(|| CompileError::UnknownNodeReference {
                from: e.from.clone(),
                to: e.to.clone(),
                missing: e.to.clone(),
            })?;
        match edge_of.get(&(from, to)) {
            Some(&existing) => {
                for p in e.policies {
                    if !edges[existing].policies.contains(&p) {
                        edges[existing].policies.push(p);
                    }
                }
            }
            None => {
                edge_of.insert((from, to), edges.len());
                edges.push(CompiledEdge {
                    from,
                    to,
                    policies: e.policies,
                });
            }
        }
    }

    let mut forward: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for e in &edges {
        forward[e.from].push(e.to);
        reverse[e.to].push(e.from);
    }
    for list in forward.iter_mut().chain(reverse.iter_mut()) {
        list.sort_unstable();
    }

    if let Some(path) = find_cycle(&nodes, &forward) {
        return Err(CompileError::CycleDetected { path });
    }

    // Exactly one start: in-degree zero among non-terminal nodes.
    let starts: Vec<usize> = (0..nodes.len())
        .filter(|&i| reverse[i].is_empty() && !nodes[i].kind.is_terminal())
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(CompileError::NoStartNode),
        [only] => *only,
        many => {
            return Err(CompileError::MultipleStartNodes {
                candidates: many.iter().map(|&i| nodes[i].id.clone()).collect(),
            })
        }
    };

    // Deterministic topological order: Kahn's algorithm with a min-heap on
    // node position, so equal-depth nodes rank in spec order.
    let mut in_degree: Vec<usize> = reverse.iter().map(Vec::len).collect();
    let mut heap: BinaryHeap<std::cmp::Reverse<usize>> = (0..nodes.len())
        .filter(|&i| in_degree[i] == 0)
        .map(std::cmp::Reverse)
        .collect();
    let mut topo_rank = vec![usize::MAX; nodes.len()];
    let mut rank = 0usize;
    while let Some(std::cmp::Reverse(node)) = heap.pop() {
        topo_rank[node] = rank;
        rank += 1;
        for &next in &forward[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                heap.push(std::cmp::Reverse(next));
            }
        }
    }

    // Transitive predecessor sets, built in topological order.
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_unstable_by_key(|&i| topo_rank[i]);
    let mut transitive_preds: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); nodes.len()];
    for &node in &order {
        let mut set = FxHashSet::default();
        for &p in &reverse[node] {
            set.insert(p);
            set.extend(transitive_preds[p].iter().copied());
        }
        transitive_preds[node] = set;
    }

    // Reachability from start; unreachable terminals never gate completion.
    let mut reachable = vec![false; nodes.len()];
    let mut queue = vec![start];
    reachable[start] = true;
    while let Some(node) = queue.pop() {
        for &next in &forward[node] {
            if !reachable[next] {
                reachable[next] = true;
                queue.push(next);
            }
        }
    }

    let terminals: Vec<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].kind.is_terminal())
        .collect();

    Ok(Graph {
        spec_id,
        nodes,
        index,
        edges,
        forward,
        reverse,
        edge_of,
        topo_rank,
        transitive_preds,
        start,
        terminals,
        reachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::GraphBuilder;
    use crate::spec::{NodeSpec, RetrySpec};

    fn linear() -> GraphBuilder {
        GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("b", "B"))
            .add_node(NodeSpec::terminal("z", "Z"))
            .add_edge("a", "b", [] as [&str; 0])
            .add_edge("b", "z", [] as [&str; 0])
    }

    #[test]
    fn linear_graph_compiles() {
        let g = linear().compile().unwrap();
        assert_eq!(g.start().id, "a");
        assert_eq!(g.successors("a").map(|n| n.id.clone()).collect::<Vec<_>>(), ["b"]);
        assert_eq!(g.predecessors("z").map(|n| n.id.clone()).collect::<Vec<_>>(), ["b"]);
        assert!(g.topo_rank("a") < g.topo_rank("b"));
        assert!(g.topo_rank("b") < g.topo_rank("z"));
    }

    #[test]
    fn transitive_predecessors_cover_all_paths() {
        let g = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("b", "B"))
            .add_node(NodeSpec::task("c", "C"))
            .add_node(NodeSpec::terminal("z", "Z"))
            .add_edge("a", "b", [] as [&str; 0])
            .add_edge("a", "c", [] as [&str; 0])
            .add_edge("b", "z", [] as [&str; 0])
            .add_edge("c", "z", [] as [&str; 0])
            .compile()
            .unwrap();
        let preds: Vec<String> = g
            .transitive_predecessors("z")
            .map(|n| n.id.clone())
            .collect();
        assert_eq!(preds, ["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("b", "B"))
            .add_node(NodeSpec::task("c", "C"))
            .add_edge("a", "b", [] as [&str; 0])
            .add_edge("b", "c", [] as [&str; 0])
            .add_edge("c", "a", [] as [&str; 0])
            .compile()
            .unwrap_err();
        match err {
            CompileError::CycleDetected { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_and_unknown_nodes() {
        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("a", "A2"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateNodeId { node_id } if node_id == "a"));

        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_edge("a", "ghost", [] as [&str; 0])
            .compile()
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownNodeReference { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn human_requires_approval_key() {
        let err = GraphBuilder::new("w")
            .add_node(NodeSpec {
                approval_key: Some("  ".into()),
                ..NodeSpec::human("h", "H", "x")
            })
            .compile()
            .unwrap_err();
        assert!(matches!(err, CompileError::MissingApprovalKey { node_id } if node_id == "h"));
    }

    #[test]
    fn retry_bounds_enforced() {
        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A").with_retry(RetrySpec {
                max_attempts: 17,
                base_delay_ms: 10,
                max_delay_ms: 100,
                jitter: false,
            }))
            .compile()
            .unwrap_err();
        assert!(
            matches!(err, CompileError::InvalidRetryPolicy { field, .. } if field == "max_attempts")
        );

        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A").with_retry(RetrySpec {
                max_attempts: 2,
                base_delay_ms: 500,
                max_delay_ms: 100,
                jitter: false,
            }))
            .compile()
            .unwrap_err();
        assert!(
            matches!(err, CompileError::InvalidRetryPolicy { field, .. } if field == "base_delay")
        );
    }

    #[test]
    fn start_node_detection() {
        let err = GraphBuilder::new("w").compile().unwrap_err();
        assert!(matches!(err, CompileError::EmptyGraph));

        let err = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::task("b", "B"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, CompileError::MultipleStartNodes { .. }));
    }

    #[test]
    fn pick_next_orders_by_topo_then_id() {
        let g = GraphBuilder::new("w")
            .add_node(NodeSpec::task("root", "R"))
            .add_node(NodeSpec::task("beta", "B"))
            .add_node(NodeSpec::task("alfa", "A"))
            .add_node(NodeSpec::terminal("z", "Z"))
            .add_edge("root", "beta", [] as [&str; 0])
            .add_edge("root", "alfa", [] as [&str; 0])
            .add_edge("beta", "z", [] as [&str; 0])
            .add_edge("alfa", "z", [] as [&str; 0])
            .compile()
            .unwrap();
        let ready = ["beta".to_string(), "alfa".to_string()];
        // Same depth; ascending node id wins.
        assert_eq!(g.pick_next(ready.iter()).unwrap().id, "alfa");
    }

    #[test]
    fn duplicate_edges_merge_policies() {
        let g = GraphBuilder::new("w")
            .add_node(NodeSpec::task("a", "A"))
            .add_node(NodeSpec::terminal("z", "Z"))
            .add_edge("a", "z", ["p1"])
            .add_edge("a", "z", ["p2", "p1"])
            .compile()
            .unwrap();
        let edge = g.edge_between("a", "z").unwrap();
        assert_eq!(edge.policies, ["p1", "p2"]);
    }

    #[test]
    fn compilation_is_deterministic() {
        let a = linear().compile().unwrap();
        let b = linear().compile().unwrap();
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }
}
