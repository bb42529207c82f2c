//! Graph algorithms for control flow analysis.
//!
//! - [`bfs`], [`reachable`], [`postorder`], [`reverse_postorder`] - traversals
//! - [`compute_dominators`] / [`DominatorTree`] - dominance queries used by the
//!   whole-function check elimination and by the IR verifier

mod dominators;
mod traversal;

pub use dominators::{compute_dominators, DominatorTree};
pub use traversal::{bfs, postorder, reachable, reverse_postorder, BfsIterator};
