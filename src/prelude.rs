//! # softboundcets Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the softboundcets library. Import this module to build a module and instrument it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all softboundcets operations
pub use crate::Error;

/// The result type used throughout softboundcets
pub use crate::Result;

// ================================================================================================
// Instrumentation
// ================================================================================================

/// Runs the instrumentation over a module
pub use crate::instrument::InstrumentEngine;

/// Switches and presets of the instrumentation
pub use crate::instrument::InstrumentConfig;

/// Per-module and per-function counters
pub use crate::instrument::{FunctionReport, InstrumentReport};

/// Pointer metadata and its store
pub use crate::instrument::{MetadataStore, PointerMetadata};

/// Pass abstraction for custom pipelines
pub use crate::instrument::{FunctionPass, PassContext};

/// The runtime ABI
pub use crate::instrument::{RuntimeDecls, RuntimeFn};

// ================================================================================================
// Intermediate Representation
// ================================================================================================

/// Containers
pub use crate::ir::{Block, Function, GlobalVariable, Module};

/// Types and target layout
pub use crate::ir::{DataLayout, FunctionType, PointerWidth, Type};

/// Values and constants
pub use crate::ir::{BlockId, ConstExpr, Constant, FuncId, GlobalId, Operand, ValueId};

/// Instructions
pub use crate::ir::{BinaryOp, InstKind, Instruction, IntPredicate};

/// Construction and rewriting
pub use crate::ir::{FunctionFlags, InsertPoint, Inserter, ParamAttributes};

/// Verification
pub use crate::ir::{verify_function, verify_module};
