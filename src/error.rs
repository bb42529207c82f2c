use thiserror::Error;

use crate::ir::{FuncId, GlobalId, ValueId};

/// Builds an [`Error::Invariant`] carrying the source location of the failed invariant.
macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Invariant {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Invariant {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Almost every variant describes an *internal invariant violation*: a state the
/// instrumentation must never reach on well-formed input. These are unrecoverable; the engine
/// stops at the first one and hands it to the caller, because continuing would silently produce
/// an unsound binary. Run-time check failures of the instrumented program are not represented
/// here at all, they are the business of the runtime library.
///
/// # Error Categories
///
/// ## Invariant Violations
/// - [`Error::Invariant`] - Generic violated invariant with source location
/// - [`Error::MissingMetadata`] - A pointer value has no metadata when it is queried
/// - [`Error::MetadataType`] - A metadata component has the wrong IR type
/// - [`Error::PhiArity`] - A synthesized metadata phi does not mirror its original phi
///
/// ## Input Errors
/// - [`Error::InvalidIr`] - The input IR is malformed
/// - [`Error::Verification`] - The IR verifier rejected a function
/// - [`Error::UnknownFunction`] / [`Error::UnknownGlobal`] - Dangling handles
/// - [`Error::Configuration`] - The configuration enables nothing to instrument
#[derive(Error, Debug)]
pub enum Error {
    /// An internal invariant of the instrumentation does not hold.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the violated invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Invariant violated - {file}:{line}: {message}")]
    Invariant {
        /// The message describing the violated invariant
        message: String,
        /// The source file in which the violation was detected
        file: &'static str,
        /// The source line in which the violation was detected
        line: u32,
    },

    /// A pointer-typed value was queried for metadata it never received.
    ///
    /// Typically raised for dereferences in code the gather passes never walked (dead code),
    /// or when a forward reference could not be resolved by the second gather pass.
    #[error("Pointer value {value} in function '{function}' has no metadata")]
    MissingMetadata {
        /// Name of the function containing the value
        function: String,
        /// The offending value
        value: ValueId,
    },

    /// A metadata component was associated with an operand of the wrong type.
    #[error("Metadata {component} of {value} must be {expected}, found {found}")]
    MetadataType {
        /// The pointer value the metadata belongs to
        value: ValueId,
        /// Which component (`base`, `bound`, `key`, `lock`)
        component: &'static str,
        /// The expected type
        expected: String,
        /// The type that was supplied
        found: String,
    },

    /// A synthesized metadata phi ended up with a different edge count than its original.
    #[error("Metadata phi for {phi} in '{function}' has {found} incoming edges, expected {expected}")]
    PhiArity {
        /// Name of the function containing the phi
        function: String,
        /// The original phi
        phi: ValueId,
        /// Number of incoming edges of the original phi
        expected: usize,
        /// Number of incoming edges of the shadow phi
        found: usize,
    },

    /// The IR verifier rejected a function.
    #[error("Verification of '{function}' failed: {message}")]
    Verification {
        /// Name of the rejected function
        function: String,
        /// What was wrong
        message: String,
    },

    /// The input IR is malformed in a way the builder or the passes cannot handle.
    #[error("Invalid IR - {0}")]
    InvalidIr(String),

    /// A function handle does not refer to a function of the module.
    #[error("Unknown function - {0}")]
    UnknownFunction(FuncId),

    /// A global handle does not refer to a global of the module.
    #[error("Unknown global - {0}")]
    UnknownGlobal(GlobalId),

    /// The configuration is unusable.
    #[error("Invalid configuration - {0}")]
    Configuration(String),
}
