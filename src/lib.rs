// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # softboundcets
//!
//! Compile-time memory-safety instrumentation for programs in SSA form, after the
//! SoftBound (spatial) and CETS (temporal) schemes.
//!
//! Every pointer value of the input program is shadowed by metadata: the bounds of the object
//! it may access and the key/lock pair of the allocation it came from. The instrumentation
//! propagates that metadata through the program, passes it across calls on a shadow stack,
//! keeps it alongside pointers written to memory, and inserts a check before each dereference.
//! The checks themselves, and the tables behind the metadata, live in a runtime library that
//! is linked with the instrumented program.
//!
//! ## Features
//!
//! - **Spatial safety** - out-of-bounds loads, stores and indirect calls are caught
//! - **Temporal safety** - use-after-free and use-after-return are caught
//! - **Redundancy elimination** - temporal checks are elided for stack and global objects, and
//!   when an earlier check on the same allocation dominates; spatial checks are elided for
//!   provably in-bounds constant indices
//! - **Self-contained IR** - a compact LLVM-shaped SSA [`ir`] with a builder and a verifier
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use softboundcets::prelude::*;
//!
//! let mut module = Module::new("demo", PointerWidth::Bits64);
//! let int_ptr = Type::ptr(Type::i32());
//! module.define_function("zero", FunctionType::new(Type::Void, vec![int_ptr]), |f| {
//!     let p = f.arg(0);
//!     f.block(0, |b| {
//!         b.store(Constant::i32(0), p);
//!         b.ret(None)
//!     });
//! })?;
//!
//! let report = InstrumentEngine::new(InstrumentConfig::default()).run(&mut module)?;
//! println!("{report}");
//! # Ok::<(), softboundcets::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]. Errors are fatal: a failed run leaves the
//! module partially rewritten, and it must be discarded. See [`Error`] for the categories.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] spans per module and per function and events for inserted and
//! elided checks. It never installs a subscriber.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use softboundcets::prelude::*;
///
/// let engine = InstrumentEngine::new(InstrumentConfig::spatial_only());
/// assert!(!engine.config().temporal_safety);
/// ```
pub mod prelude;

/// The SSA intermediate representation the instrumentation reads and rewrites.
///
/// # Key Types
///
/// - [`ir::Module`] - globals, functions and module constructors
/// - [`ir::Function`] - blocks of instructions over a value arena
/// - [`ir::FunctionBuilder`] / [`ir::Inserter`] - construction of input and instrumentation
/// - [`ir::verify_function`] - structural and dominance verification
pub mod ir;

/// The instrumentation itself.
///
/// # Key Types
///
/// - [`instrument::InstrumentEngine`] - entry point
/// - [`instrument::InstrumentConfig`] - switches and presets
/// - [`instrument::InstrumentReport`] - what was inserted and elided
pub mod instrument;

/// Graph infrastructure shared by the IR and the passes.
pub mod utils;

/// `softboundcets` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `softboundcets` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use softboundcets::{instrument::InstrumentEngine, ir::Module, Error};
///
/// fn run(module: &mut Module) {
///     match InstrumentEngine::default().run(module) {
///         Ok(report) => println!("{report}"),
///         Err(Error::MissingMetadata { function, value }) => {
///             eprintln!("{value} in {function} was never visited");
///         }
///         Err(e) => eprintln!("instrumentation failed: {e}"),
///     }
/// }
/// ```
pub use error::Error;

pub use instrument::{InstrumentConfig, InstrumentEngine, InstrumentReport};
