//! A compact SSA intermediate representation.
//!
//! The IR is shaped after LLVM's: typed pointers, basic blocks ending in terminators, phis for
//! merges and constant expressions for link-time addresses. It carries exactly what the
//! memory-safety instrumentation consumes and produces, and nothing more.
//!
//! # Architecture
//!
//! - [`types`] - [`Type`], [`FunctionType`], [`PointerWidth`] and [`DataLayout`]
//! - [`value`] - handles ([`FuncId`], [`GlobalId`], [`BlockId`], [`ValueId`]), [`Operand`]
//!   and [`Constant`]
//! - [`instruction`] - the closed [`InstKind`] set
//! - [`Block`], [`Function`] and [`Module`] - containers; a function is also a rooted graph
//!   over its blocks
//! - [`builder`] - [`FunctionBuilder`] for input programs and [`Inserter`] for instrumentation
//! - [`verify`] - structural and SSA-dominance checks
//!
//! # Identity
//!
//! Values are named by [`ValueId`], a `(function, index)` pair into the owning function's
//! arena. Instructions are values; inserting into a block never renumbers anything, so ids are
//! stable keys for side tables for the lifetime of the module.

mod block;
pub mod builder;
mod display;
mod function;
pub mod instruction;
mod module;
pub mod types;
pub mod value;
pub mod verify;

pub use block::Block;
pub use builder::{BlockBuilder, FunctionBuilder, FunctionContext, InsertPoint, Inserter};
pub use function::{Function, FunctionFlags, ParamAttributes, ValueData, ValueDef};
pub use instruction::{BinaryOp, InstKind, Instruction, IntPredicate};
pub use module::{GlobalVariable, Module};
pub use types::{DataLayout, FunctionType, PointerWidth, Type};
pub use value::{BlockId, ConstExpr, Constant, FuncId, GlobalId, Operand, ValueId};
pub use verify::{verify_function, verify_module};
