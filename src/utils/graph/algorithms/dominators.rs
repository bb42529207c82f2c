//! Dominator tree computation.
//!
//! A node `d` **dominates** a node `n` if every path from the entry node to `n` passes
//! through `d`. The **immediate dominator** of `n` is the closest strict dominator of `n`;
//! linking every node to its immediate dominator yields the dominator tree, rooted at the
//! entry.
//!
//! # Algorithm
//!
//! The iterative data-flow formulation of Cooper, Harvey and Kennedy: nodes are numbered in
//! reverse postorder and each node's immediate dominator is refined by intersecting the
//! dominator-tree paths of its already processed predecessors until nothing changes.
//! Control flow graphs of single functions are small and converge in two or three sweeps.
//!
//! Nodes not reachable from the entry have no dominators and are dominated by nothing.

use crate::utils::graph::{algorithms::reverse_postorder, NodeId, RootedGraph};

/// Result of dominator tree computation.
///
/// # Examples
///
/// ```rust,ignore
/// use softboundcets::utils::graph::{algorithms::compute_dominators, NodeId};
///
/// // function with blocks: entry -> a -> b
/// let dom_tree = compute_dominators(&function);
/// let (entry, a, b) = (NodeId::new(0), NodeId::new(1), NodeId::new(2));
///
/// assert!(dom_tree.dominates(entry, b));
/// assert_eq!(dom_tree.immediate_dominator(b), Some(a));
/// ```
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// The entry (root) node of the dominator tree
    entry: NodeId,
    /// Immediate dominator per node; `None` for the entry and for unreachable nodes
    idom: Vec<Option<NodeId>>,
    /// Whether the node is reachable from the entry
    reachable: Vec<bool>,
}

impl DominatorTree {
    /// Returns the entry (root) node of the dominator tree.
    #[inline]
    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Returns the number of nodes covered by the tree.
    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.idom.len()
    }

    /// Returns `true` if `node` is reachable from the entry.
    #[inline]
    #[must_use]
    pub fn is_reachable(&self, node: NodeId) -> bool {
        self.reachable.get(node.index()).copied().unwrap_or(false)
    }

    /// Returns the immediate dominator of a node.
    ///
    /// `None` for the entry node, unreachable nodes and out-of-range ids.
    #[inline]
    #[must_use]
    pub fn immediate_dominator(&self, node: NodeId) -> Option<NodeId> {
        self.idom.get(node.index()).copied().flatten()
    }

    /// Checks if node `a` dominates node `b`.
    ///
    /// A node dominates itself. Nothing dominates an unreachable node except the node itself.
    ///
    /// # Complexity
    ///
    /// O(depth) where depth is the depth of `b` in the dominator tree.
    #[must_use]
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }

        let mut current = b;
        while let Some(idom) = self.immediate_dominator(current) {
            if idom == a {
                return true;
            }
            current = idom;
        }
        false
    }

    /// Checks if node `a` strictly dominates node `b`.
    #[inline]
    #[must_use]
    pub fn strictly_dominates(&self, a: NodeId, b: NodeId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Returns an iterator over all dominators of a node, from the node itself up to and
    /// including the entry node.
    pub fn dominators(&self, node: NodeId) -> DominatorIterator<'_> {
        DominatorIterator {
            tree: self,
            current: Some(node),
        }
    }

    /// Returns the depth of a node in the dominator tree. The entry node has depth 0.
    #[must_use]
    pub fn depth(&self, node: NodeId) -> usize {
        let mut depth = 0;
        let mut current = node;
        while let Some(idom) = self.immediate_dominator(current) {
            current = idom;
            depth += 1;
        }
        depth
    }

    /// Returns all nodes whose immediate dominator is `node`.
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.idom
            .iter()
            .enumerate()
            .filter(|(_, idom)| **idom == Some(node))
            .map(|(i, _)| NodeId::new(i))
            .collect()
    }
}

/// Iterator over dominators of a node, from the node up to the entry.
pub struct DominatorIterator<'a> {
    tree: &'a DominatorTree,
    current: Option<NodeId>,
}

impl Iterator for DominatorIterator<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        self.current = self.tree.immediate_dominator(node);
        Some(node)
    }
}

/// Computes the dominator tree of a rooted graph.
pub fn compute_dominators<G: RootedGraph>(graph: &G) -> DominatorTree {
    let node_count = graph.node_count();
    let entry = graph.entry();

    let mut idom: Vec<Option<NodeId>> = vec![None; node_count];
    let mut reachable = vec![false; node_count];

    if entry.index() >= node_count {
        return DominatorTree {
            entry,
            idom,
            reachable,
        };
    }

    let rpo = reverse_postorder(graph, entry);
    // rpo_number[n] is the position of n in reverse postorder, usize::MAX if unreachable
    let mut rpo_number = vec![usize::MAX; node_count];
    for (position, node) in rpo.iter().enumerate() {
        rpo_number[node.index()] = position;
        reachable[node.index()] = true;
    }

    // The entry temporarily dominates itself so intersection terminates at the root
    idom[entry.index()] = Some(entry);

    let mut changed = true;
    while changed {
        changed = false;

        for &node in rpo.iter().skip(1) {
            let mut new_idom: Option<NodeId> = None;

            for pred in graph.predecessors(node) {
                if idom[pred.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, &rpo_number, pred, current),
                });
            }

            if new_idom.is_some() && idom[node.index()] != new_idom {
                idom[node.index()] = new_idom;
                changed = true;
            }
        }
    }

    idom[entry.index()] = None;

    DominatorTree {
        entry,
        idom,
        reachable,
    }
}

fn intersect(
    idom: &[Option<NodeId>],
    rpo_number: &[usize],
    mut a: NodeId,
    mut b: NodeId,
) -> NodeId {
    while a != b {
        while rpo_number[a.index()] > rpo_number[b.index()] {
            match idom[a.index()] {
                Some(next) => a = next,
                None => return b,
            }
        }
        while rpo_number[b.index()] > rpo_number[a.index()] {
            match idom[b.index()] {
                Some(next) => b = next,
                None => return a,
            }
        }
    }
    a
}
