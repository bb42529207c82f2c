//! SoftBound/CETS memory-safety instrumentation.
//!
//! This module rewrites the functions of a [`Module`](crate::ir::Module) so that every
//! dereference is checked against per-pointer metadata at run time:
//!
//! - **spatial** metadata (`base`, `bound`) catches out-of-bounds accesses;
//! - **temporal** metadata (`key`, `lock`) catches accesses through dangling pointers.
//!
//! # Architecture
//!
//! - [`runtime`] - symbols and signatures of the runtime ABI the inserted code calls
//! - [`metadata`] - [`PointerMetadata`] and the module-wide [`MetadataStore`]
//! - [`constants`] - metadata of constant pointers and seeding of global initializers
//! - [`shadow_stack`] - metadata transfer across calls
//! - [`gather`] - the two propagation passes and the coverage audit
//! - [`checks`] - check insertion with redundant check elimination
//! - [`pass`] - the [`FunctionPass`] trait and the [`PassContext`] passes share
//! - [`InstrumentEngine`] - runs everything over a module and returns an [`InstrumentReport`]
//!
//! # Pipeline
//!
//! ```text
//! declare runtime -> wrap library calls -> rename main -> seed globals
//!     for each defined function:
//!         gather (create) -> gather (resolve) -> coverage audit -> check insertion -> verify
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use softboundcets::prelude::*;
//!
//! # fn example(module: &mut Module) -> softboundcets::Result<()> {
//! let config = InstrumentConfig::spatial_only();
//! let report = InstrumentEngine::new(config).run(module)?;
//! println!("inserted {} checks", report.total_checks());
//! # Ok(())
//! # }
//! ```

pub mod checks;
mod config;
pub mod constants;
mod engine;
pub mod gather;
pub mod metadata;
pub mod pass;
mod report;
pub mod runtime;
pub mod shadow_stack;

#[cfg(test)]
mod test_support;

pub use checks::{CheckInsertionPass, EliminationTier};
pub use config::InstrumentConfig;
pub use engine::InstrumentEngine;
pub use gather::{CoverageAudit, GatherPass};
pub use metadata::{MetadataStore, PointerMetadata, SpatialMetadata, TemporalMetadata};
pub use pass::{FunctionPass, ModuleInfo, PassContext};
pub use report::{FunctionReport, InstrumentReport};
pub use runtime::{RuntimeDecls, RuntimeFn};
