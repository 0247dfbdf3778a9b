//! Graph model: build this before validating or executing a flow.
//!
//! Rules enforced by [`Graph::build`]:
//! 1. Node IDs must be unique within the flow.
//! 2. No edge may connect a node to itself.
//! 3. At most one edge per ordered `(from, to)` pair.
//! 4. Every edge must reference valid node IDs (both `from` and `to`).
//!
//! Acyclicity is an execution-time property checked by
//! [`Graph::topological_order`] over the subgraph reachable from the triggers.
//!
//! Nodes and edges live in flat vectors; adjacency lists hold indices, so
//! traversal never follows references between nodes.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::GraphError;
use crate::models::{Edge, Flow, Node};

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// node index -> edge indices, in edge creation order.
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl Graph {
    /// Validate the structure of `nodes`/`edges` and index them.
    ///
    /// # Errors
    /// - [`GraphError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`GraphError::SelfLoop`] if an edge has `from == to`.
    /// - [`GraphError::DanglingReference`] if an edge references a missing node.
    /// - [`GraphError::DuplicateEdge`] if two edges share `(from, to)`.
    pub fn build(nodes: &[Node], edges: &[Edge]) -> Result<Self, GraphError> {
        // -----------------------------------------------------------------------
        // 1. Ensure node IDs are unique
        // -----------------------------------------------------------------------
        let mut index: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id.clone()));
            }
        }

        // -----------------------------------------------------------------------
        // 2. Validate edges and build adjacency lists
        // -----------------------------------------------------------------------
        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        let mut seen_pairs: HashSet<(&str, &str)> = HashSet::new();

        for (e, edge) in edges.iter().enumerate() {
            if edge.from == edge.to {
                return Err(GraphError::SelfLoop {
                    edge_id: edge.id.clone(),
                    node_id: edge.from.clone(),
                });
            }
            let from = *index.get(&edge.from).ok_or_else(|| GraphError::DanglingReference {
                edge_id: edge.id.clone(),
                node_id: edge.from.clone(),
                side: "from",
            })?;
            let to = *index.get(&edge.to).ok_or_else(|| GraphError::DanglingReference {
                edge_id: edge.id.clone(),
                node_id: edge.to.clone(),
                side: "to",
            })?;
            if !seen_pairs.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(GraphError::DuplicateEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
            outgoing[from].push(e);
            incoming[to].push(e);
        }

        Ok(Self {
            nodes: nodes.to_vec(),
            index,
            edges: edges.to_vec(),
            outgoing,
            incoming,
        })
    }

    pub fn from_flow(flow: &Flow) -> Result<Self, GraphError> {
        Self::build(&flow.nodes, &flow.edges)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Outgoing edges of `id`, in creation order. Empty for unknown IDs.
    pub fn outgoing_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.edge_list(&self.outgoing, id)
    }

    /// Incoming edges of `id`, in creation order. Empty for unknown IDs.
    pub fn incoming_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.edge_list(&self.incoming, id)
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.outgoing_edges(id).map(|e| e.to.as_str()).collect()
    }

    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.incoming_edges(id).map(|e| e.from.as_str()).collect()
    }

    fn edge_list<'a>(&'a self, lists: &'a [Vec<usize>], id: &str) -> impl Iterator<Item = &'a Edge> {
        let list: &[usize] = self.index.get(id).map(|&i| lists[i].as_slice()).unwrap_or(&[]);
        list.iter().map(move |&e| &self.edges[e])
    }

    fn resolve_roots<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<usize>, GraphError> {
        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            let root = root.as_ref();
            let i = *self
                .index
                .get(root)
                .ok_or_else(|| GraphError::UnknownTrigger(root.to_owned()))?;
            if !resolved.contains(&i) {
                resolved.push(i);
            }
        }
        Ok(resolved)
    }

    fn reachable_mask(&self, roots: &[usize]) -> Vec<bool> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = roots.iter().copied().collect();
        for &r in roots {
            reachable[r] = true;
        }
        while let Some(n) = queue.pop_front() {
            for &e in &self.outgoing[n] {
                let to = self.index[&self.edges[e].to];
                if !reachable[to] {
                    reachable[to] = true;
                    queue.push_back(to);
                }
            }
        }
        reachable
    }

    /// Every node reachable from `roots` (roots included), in node order.
    pub fn reachable_from<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<String>, GraphError> {
        let roots = self.resolve_roots(roots)?;
        let mask = self.reachable_mask(&roots);
        Ok(self
            .nodes
            .iter()
            .zip(mask)
            .filter(|(_, r)| *r)
            .map(|(n, _)| n.id.clone())
            .collect())
    }

    /// Order the subgraph reachable from `triggers` so every node follows all
    /// of its reachable predecessors.
    ///
    /// Kahn's algorithm: the queue is seeded with the triggers in the given
    /// order, and successors are enqueued following edge creation order, so
    /// the result is identical across runs.
    ///
    /// # Errors
    /// - [`GraphError::UnknownTrigger`] if a trigger ID is not in the graph.
    /// - [`GraphError::CycleDetected`] if a cycle is reachable from a trigger.
    pub fn topological_order<S: AsRef<str>>(&self, triggers: &[S]) -> Result<Vec<String>, GraphError> {
        let roots = self.resolve_roots(triggers)?;
        let reachable = self.reachable_mask(&roots);

        // In-degree counted over edges whose source is reachable.
        let mut in_degree = vec![0usize; self.nodes.len()];
        for (n, targets) in self.outgoing.iter().enumerate() {
            if !reachable[n] {
                continue;
            }
            for &e in targets {
                in_degree[self.index[&self.edges[e].to]] += 1;
            }
        }

        let mut queue: VecDeque<usize> = roots.iter().copied().filter(|&r| in_degree[r] == 0).collect();
        let mut sorted: Vec<usize> = Vec::new();

        while let Some(n) = queue.pop_front() {
            sorted.push(n);
            for &e in &self.outgoing[n] {
                let to = self.index[&self.edges[e].to];
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }

        let reachable_count = reachable.iter().filter(|r| **r).count();
        if sorted.len() != reachable_count {
            let mut stuck: Vec<bool> = reachable.clone();
            for &n in &sorted {
                stuck[n] = false;
            }
            return Err(GraphError::CycleDetected(self.cycle_members(stuck)));
        }

        Ok(sorted.into_iter().map(|i| self.nodes[i].id.clone()).collect())
    }

    /// `true` if any cycle exists anywhere in the graph.
    pub fn has_cycle(&self) -> bool {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut visited = 0;
        while let Some(n) = queue.pop_front() {
            visited += 1;
            for &e in &self.outgoing[n] {
                let to = self.index[&self.edges[e].to];
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }
        visited != self.nodes.len()
    }

    // Nodes Kahn could not order include everything downstream of a cycle.
    // Peel off those with no outgoing edge back into the stuck set; what
    // remains lies on (or between) cycles.
    fn cycle_members(&self, mut stuck: Vec<bool>) -> Vec<String> {
        loop {
            let peel: Vec<usize> = (0..self.nodes.len())
                .filter(|&n| stuck[n])
                .filter(|&n| {
                    !self.outgoing[n]
                        .iter()
                        .any(|&e| stuck[self.index[&self.edges[e].to]])
                })
                .collect();
            if peel.is_empty() {
                break;
            }
            for n in peel {
                stuck[n] = false;
            }
        }
        self.nodes
            .iter()
            .zip(stuck)
            .filter(|(_, s)| *s)
            .map(|(n, _)| n.id.clone())
            .collect()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn make_node(id: &str) -> Node {
        Node::new(id, "mock", Value::Null)
    }

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| make_node(id)).collect()
    }

    #[test]
    fn valid_linear_graph_returns_sorted_order() {
        // A → B → C
        let graph = Graph::build(
            &nodes(&["a", "b", "c"]),
            &[Edge::new("a", "b"), Edge::new("b", "c")],
        )
        .expect("should be valid");

        assert_eq!(graph.topological_order(&["a"]).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_orders_siblings_by_edge_creation() {
        //   A
        //  / \
        // C   B
        //  \ /
        //   D
        let graph = Graph::build(
            &nodes(&["a", "b", "c", "d"]),
            &[
                Edge::new("a", "c"),
                Edge::new("a", "b"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
        .unwrap();

        assert_eq!(graph.topological_order(&["a"]).unwrap(), vec!["a", "c", "b", "d"]);
        assert_eq!(graph.predecessors("d"), vec!["b", "c"]);
        assert_eq!(graph.successors("a"), vec!["c", "b"]);
    }

    #[test]
    fn order_is_restricted_to_the_reachable_subgraph() {
        // t → x ; island → y
        let graph = Graph::build(
            &nodes(&["t", "x", "island", "y"]),
            &[Edge::new("t", "x"), Edge::new("island", "y")],
        )
        .unwrap();

        assert_eq!(graph.topological_order(&["t"]).unwrap(), vec!["t", "x"]);
        assert_eq!(graph.reachable_from(&["island"]).unwrap(), vec!["island", "y"]);
    }

    #[test]
    fn every_reachable_node_appears_once_after_its_predecessors() {
        // Two triggers feeding a shared tail.
        let graph = Graph::build(
            &nodes(&["t1", "t2", "a", "b", "c"]),
            &[
                Edge::new("t1", "a"),
                Edge::new("t2", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "c"),
                Edge::new("t1", "b"),
            ],
        )
        .unwrap();

        let order = graph.topological_order(&["t1", "t2"]).unwrap();
        assert_eq!(order.len(), 5);
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        for edge in graph.edges() {
            assert!(pos(&edge.from) < pos(&edge.to), "{} before {}", edge.from, edge.to);
        }
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        assert!(matches!(
            Graph::build(&nodes(&["a", "a"]), &[]),
            Err(GraphError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn self_loop_is_rejected() {
        assert!(matches!(
            Graph::build(&nodes(&["a"]), &[Edge::new("a", "a")]),
            Err(GraphError::SelfLoop { node_id, .. }) if node_id == "a"
        ));
    }

    #[test]
    fn duplicate_edge_is_rejected() {
        assert!(matches!(
            Graph::build(&nodes(&["a", "b"]), &[Edge::new("a", "b"), Edge::new("a", "b")]),
            Err(GraphError::DuplicateEdge { .. })
        ));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        assert!(matches!(
            Graph::build(&nodes(&["a"]), &[Edge::new("a", "ghost")]),
            Err(GraphError::DanglingReference { node_id, side: "to", .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn reachable_cycle_is_detected_with_its_members() {
        // T → A → B → C → A, C → D
        let graph = Graph::build(
            &nodes(&["t", "a", "b", "c", "d"]),
            &[
                Edge::new("t", "a"),
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "a"),
                Edge::new("c", "d"),
            ],
        )
        .unwrap();

        match graph.topological_order(&["t"]) {
            Err(GraphError::CycleDetected(members)) => assert_eq!(members, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(graph.has_cycle());
    }

    #[test]
    fn unreachable_cycle_does_not_block_ordering() {
        let graph = Graph::build(
            &nodes(&["t", "a", "x", "y"]),
            &[Edge::new("t", "a"), Edge::new("x", "y"), Edge::new("y", "x")],
        )
        .unwrap();

        assert_eq!(graph.topological_order(&["t"]).unwrap(), vec!["t", "a"]);
        assert!(graph.has_cycle());
    }

    #[test]
    fn unknown_trigger_is_rejected() {
        let graph = Graph::build(&nodes(&["a"]), &[]).unwrap();
        assert!(matches!(
            graph.topological_order(&["nope"]),
            Err(GraphError::UnknownTrigger(id)) if id == "nope"
        ));
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let graph = Graph::build(&nodes(&["solo"]), &[]).unwrap();
        assert_eq!(graph.topological_order(&["solo"]).unwrap(), vec!["solo"]);
        assert!(!graph.has_cycle());
    }
}
