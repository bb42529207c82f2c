//! Graph access traits.
//!
//! The algorithms in [`crate::utils::graph::algorithms`] are written against these traits
//! instead of a concrete graph type, so that a [`crate::ir::Function`] can be analysed in
//! place without first being copied into a separate graph structure.

use crate::utils::graph::NodeId;

/// Basic node enumeration.
pub trait GraphBase {
    /// Number of nodes. Node ids are dense in `0..node_count()`.
    fn node_count(&self) -> usize;

    /// Iterates over all node ids.
    fn node_ids(&self) -> impl Iterator<Item = NodeId>;
}

/// Forward edges.
pub trait Successors: GraphBase {
    /// Iterates over the direct successors of `node`.
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// Backward edges.
pub trait Predecessors: GraphBase {
    /// Iterates over the direct predecessors of `node`.
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// A graph with a distinguished entry node.
pub trait RootedGraph: Successors + Predecessors {
    /// The entry node.
    fn entry(&self) -> NodeId;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal edge-list graph shared by the algorithm tests.
    pub(crate) struct TestGraph {
        node_count: usize,
        edges: Vec<(NodeId, NodeId)>,
        entry: NodeId,
    }

    impl TestGraph {
        pub(crate) fn new(node_count: usize, edges: &[(usize, usize)]) -> Self {
            TestGraph {
                node_count,
                edges: edges
                    .iter()
                    .map(|&(a, b)| (NodeId::new(a), NodeId::new(b)))
                    .collect(),
                entry: NodeId::new(0),
            }
        }
    }

    impl GraphBase for TestGraph {
        fn node_count(&self) -> usize {
            self.node_count
        }

        fn node_ids(&self) -> impl Iterator<Item = NodeId> {
            (0..self.node_count).map(NodeId::new)
        }
    }

    impl Successors for TestGraph {
        fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
            self.edges
                .iter()
                .filter(move |(src, _)| *src == node)
                .map(|(_, dst)| *dst)
        }
    }

    impl Predecessors for TestGraph {
        fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
            self.edges
                .iter()
                .filter(move |(_, dst)| *dst == node)
                .map(|(src, _)| *src)
        }
    }

    impl RootedGraph for TestGraph {
        fn entry(&self) -> NodeId {
            self.entry
        }
    }

    #[test]
    fn test_edges() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        assert_eq!(graph.node_count(), 4);

        let succ: Vec<NodeId> = graph.successors(NodeId::new(0)).collect();
        assert_eq!(succ, vec![NodeId::new(1), NodeId::new(2)]);

        let pred: Vec<NodeId> = graph.predecessors(NodeId::new(3)).collect();
        assert_eq!(pred, vec![NodeId::new(1), NodeId::new(2)]);

        assert_eq!(graph.entry(), NodeId::new(0));
    }
}
