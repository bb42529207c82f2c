//! Graph traversal algorithms.
//!
//! The instrumentation walks every function breadth-first from its entry block, so the
//! [`bfs`] iterator defines the fixed block worklist order shared by all passes.

use std::collections::VecDeque;

use crate::utils::graph::{NodeId, Successors};

/// Breadth-first iterator over the nodes reachable from a start node.
///
/// Each reachable node is yielded exactly once, in order of increasing distance from the
/// start; successors of one node are enqueued in the order the graph reports them.
pub struct BfsIterator<'g, G: Successors> {
    graph: &'g G,
    queue: VecDeque<NodeId>,
    visited: Vec<bool>,
}

impl<'g, G: Successors> BfsIterator<'g, G> {
    fn new(graph: &'g G, start: NodeId) -> Self {
        let node_count = graph.node_count();
        let mut visited = vec![false; node_count];
        let mut queue = VecDeque::new();

        if start.index() < node_count {
            visited[start.index()] = true;
            queue.push_back(start);
        }

        BfsIterator {
            graph,
            queue,
            visited,
        }
    }
}

impl<G: Successors> Iterator for BfsIterator<'_, G> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.pop_front()?;

        for succ in self.graph.successors(node) {
            if !self.visited[succ.index()] {
                self.visited[succ.index()] = true;
                self.queue.push_back(succ);
            }
        }

        Some(node)
    }
}

/// Returns a breadth-first iterator starting from `start`.
///
/// An out-of-range start yields nothing.
pub fn bfs<G: Successors>(graph: &G, start: NodeId) -> BfsIterator<'_, G> {
    BfsIterator::new(graph, start)
}

/// Computes the set of nodes reachable from `start`, indexed by node id.
pub fn reachable<G: Successors>(graph: &G, start: NodeId) -> Vec<bool> {
    let mut seen = vec![false; graph.node_count()];
    for node in bfs(graph, start) {
        seen[node.index()] = true;
    }
    seen
}

/// Computes the postorder of the nodes reachable from `start`.
///
/// A node appears after all nodes reachable from it through tree edges of the depth-first
/// search. Iterative, so deep graphs do not exhaust the call stack.
pub fn postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let node_count = graph.node_count();
    if start.index() >= node_count {
        return Vec::new();
    }

    let mut visited = vec![false; node_count];
    let mut order = Vec::with_capacity(node_count);
    let mut stack: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

    visited[start.index()] = true;
    stack.push((start, graph.successors(start).collect()));

    while let Some((node, pending)) = stack.last_mut() {
        if let Some(next) = pending.pop() {
            if !visited[next.index()] {
                visited[next.index()] = true;
                let succs: Vec<NodeId> = graph.successors(next).collect();
                stack.push((next, succs));
            }
        } else {
            order.push(*node);
            stack.pop();
        }
    }

    order
}

/// Computes the reverse postorder of the nodes reachable from `start`.
///
/// In reverse postorder every node precedes its successors, except along back edges.
pub fn reverse_postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let mut order = postorder(graph, start);
    order.reverse();
    order
}
