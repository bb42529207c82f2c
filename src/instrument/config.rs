//! Configuration for the instrumentation engine.
//!
//! The configuration is read once when the engine starts and is then threaded by reference
//! through every pass; no pass consults ambient state.

use crate::{Error, Result};

/// Configuration for the instrumentation engine.
///
/// Every switch defaults to enabled, which gives full spatial and temporal safety with all
/// redundancy elimination active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    /// Track base/bound metadata and emit spatial checks.
    pub spatial_safety: bool,

    /// Track key/lock metadata and emit temporal checks.
    pub temporal_safety: bool,

    /// Emit spatial checks before loads.
    pub load_checks: bool,

    /// Emit spatial checks before stores.
    pub store_checks: bool,

    /// Emit temporal checks before loads.
    pub temporal_load_checks: bool,

    /// Emit temporal checks before stores.
    pub temporal_store_checks: bool,

    /// Check the target of indirect calls against its metadata.
    pub call_checks: bool,

    /// Copy metadata alongside `memcpy`/`memmove`.
    pub memcpy_metadata: bool,

    /// Elide temporal checks covered by an earlier check in the same block.
    pub eliminate_bb_temporal: bool,

    /// Elide temporal checks covered by a dominating check elsewhere in the function.
    pub eliminate_function_temporal: bool,

    /// Elide temporal checks on pointers derived from a stack allocation.
    pub eliminate_stack_temporal: bool,

    /// Elide temporal checks on pointers derived from a global variable.
    pub eliminate_global_temporal: bool,

    /// Elide spatial checks proven in bounds by constant indices into a sized object.
    pub eliminate_constant_index_spatial: bool,

    /// Treat call instructions as invalidating all temporal facts, halting the block and
    /// function level elimination scans.
    pub opaque_calls: bool,

    /// Redirect calls to known library routines to their metadata-aware wrappers.
    pub wrap_library_calls: bool,

    /// Rename `main` so the runtime can provide its own entry point.
    pub rename_main: bool,

    /// Report the metadata of every pointer parameter to the runtime at function entry.
    pub introspect_metadata: bool,

    /// Run the IR verifier on every instrumented function.
    pub verify_output: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            spatial_safety: true,
            temporal_safety: true,
            load_checks: true,
            store_checks: true,
            temporal_load_checks: true,
            temporal_store_checks: true,
            call_checks: true,
            memcpy_metadata: true,
            eliminate_bb_temporal: true,
            eliminate_function_temporal: true,
            eliminate_stack_temporal: true,
            eliminate_global_temporal: true,
            eliminate_constant_index_spatial: true,
            opaque_calls: true,
            wrap_library_calls: true,
            rename_main: true,
            introspect_metadata: false,
            verify_output: true,
        }
    }
}

impl InstrumentConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spatial safety only: no key/lock tracking, no temporal checks.
    #[must_use]
    pub fn spatial_only() -> Self {
        Self {
            temporal_safety: false,
            ..Self::default()
        }
    }

    /// Temporal safety only: no base/bound tracking, no spatial checks.
    #[must_use]
    pub fn temporal_only() -> Self {
        Self {
            spatial_safety: false,
            ..Self::default()
        }
    }

    /// Full safety with every redundancy elimination tier disabled.
    #[must_use]
    pub fn no_elimination() -> Self {
        Self {
            eliminate_bb_temporal: false,
            eliminate_function_temporal: false,
            eliminate_stack_temporal: false,
            eliminate_global_temporal: false,
            eliminate_constant_index_spatial: false,
            ..Self::default()
        }
    }

    /// Returns true if any spatial check kind is enabled.
    #[must_use]
    pub fn spatial_checks_enabled(&self) -> bool {
        self.spatial_safety && (self.load_checks || self.store_checks || self.call_checks)
    }

    /// Returns true if any temporal check kind is enabled.
    #[must_use]
    pub fn temporal_checks_enabled(&self) -> bool {
        self.temporal_safety && (self.temporal_load_checks || self.temporal_store_checks)
    }

    /// Returns true if any redundancy elimination tier is enabled.
    #[must_use]
    pub fn any_elimination_enabled(&self) -> bool {
        self.eliminate_bb_temporal
            || self.eliminate_function_temporal
            || self.eliminate_stack_temporal
            || self.eliminate_global_temporal
            || self.eliminate_constant_index_spatial
    }

    /// Sets whether calls halt redundancy elimination.
    #[must_use]
    pub fn with_opaque_calls(mut self, opaque: bool) -> Self {
        self.opaque_calls = opaque;
        self
    }

    /// Sets whether the output is verified.
    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_output = verify;
        self
    }

    /// Checks that the configuration instruments anything at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if neither spatial nor temporal safety is enabled.
    pub fn validate(&self) -> Result<()> {
        if !self.spatial_safety && !self.temporal_safety {
            return Err(Error::Configuration(
                "neither spatial nor temporal safety is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
