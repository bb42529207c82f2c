//! Generic directed-graph infrastructure.
//!
//! Only what the instrumentation needs lives here: a node identifier, the access traits a
//! control flow graph implements, and the traversal and dominance algorithms built on them.

mod node;
mod traits;

pub mod algorithms;

pub use node::NodeId;
pub use traits::{GraphBase, Predecessors, RootedGraph, Successors};

#[cfg(test)]
pub(crate) use traits::tests::TestGraph;
