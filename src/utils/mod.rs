//! Utilities shared by the IR and the instrumentation passes.

pub mod graph;
