//! Statistics of an instrumentation run.

use std::fmt;

/// Counters for one instrumented function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionReport {
    /// Name of the function (after entry-point renaming)
    pub function: String,
    /// Spatial dereference checks inserted before loads and stores
    pub spatial_checks: usize,
    /// Temporal dereference checks inserted before loads and stores
    pub temporal_checks: usize,
    /// Spatial checks on indirect call targets
    pub call_checks: usize,
    /// Spatial checks proven unnecessary by constant indices
    pub spatial_eliminated_constant_index: usize,
    /// Temporal checks elided because the pointer derives from a stack or global object
    pub temporal_eliminated_trivial: usize,
    /// Temporal checks elided by an earlier check in the same block
    pub temporal_eliminated_block: usize,
    /// Temporal checks elided by a dominating check in another block
    pub temporal_eliminated_function: usize,
    /// Metadata copies inserted after `memcpy`-like calls
    pub metadata_copies: usize,
    /// Shadow stack frames set up around calls
    pub shadow_stack_frames: usize,
    /// Placeholder phis created for pointer phis
    pub placeholder_phis: usize,
    /// Instructions whose propagation had to wait for the second gather pass
    pub deferred: usize,
    /// Stack allocations given metadata (all share the frame key)
    pub stack_allocations: usize,
    /// Metadata loads inserted after pointer loads
    pub metadata_loads: usize,
    /// Metadata stores inserted after pointer stores
    pub metadata_stores: usize,
}

impl FunctionReport {
    /// Creates an empty report for `function`.
    #[must_use]
    pub fn new(function: impl Into<String>) -> Self {
        FunctionReport {
            function: function.into(),
            ..Self::default()
        }
    }

    /// All inserted checks.
    #[must_use]
    pub const fn total_checks(&self) -> usize {
        self.spatial_checks + self.temporal_checks + self.call_checks
    }

    /// All temporal checks that were elided.
    #[must_use]
    pub const fn temporal_eliminated(&self) -> usize {
        self.temporal_eliminated_trivial
            + self.temporal_eliminated_block
            + self.temporal_eliminated_function
    }
}

/// Counters for a whole module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentReport {
    /// Per-function counters in processing order
    pub functions: Vec<FunctionReport>,
    /// Pointer fields of globals seeded by the module constructor
    pub seeded_global_fields: usize,
    /// Uses of library routines redirected to their wrappers
    pub wrapped_calls: usize,
    /// Whether `main` was renamed
    pub renamed_main: bool,
}

impl InstrumentReport {
    /// The report of a function, by name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionReport> {
        self.functions.iter().find(|r| r.function == name)
    }

    /// Checks inserted across the module.
    #[must_use]
    pub fn total_checks(&self) -> usize {
        self.functions.iter().map(FunctionReport::total_checks).sum()
    }

    /// Spatial load/store checks across the module.
    #[must_use]
    pub fn spatial_checks(&self) -> usize {
        self.functions.iter().map(|r| r.spatial_checks).sum()
    }

    /// Temporal load/store checks across the module.
    #[must_use]
    pub fn temporal_checks(&self) -> usize {
        self.functions.iter().map(|r| r.temporal_checks).sum()
    }

    /// Elided temporal checks across the module.
    #[must_use]
    pub fn temporal_eliminated(&self) -> usize {
        self.functions
            .iter()
            .map(FunctionReport::temporal_eliminated)
            .sum()
    }
}

impl fmt::Display for InstrumentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} functions, {} checks ({} spatial, {} temporal), {} temporal elided",
            self.functions.len(),
            self.total_checks(),
            self.spatial_checks(),
            self.temporal_checks(),
            self.temporal_eliminated()
        )?;
        for r in &self.functions {
            writeln!(
                f,
                "  {}: {} spatial, {} temporal, {} call, {} frames, {} phis",
                r.function,
                r.spatial_checks,
                r.temporal_checks,
                r.call_checks,
                r.shadow_stack_frames,
                r.placeholder_phis
            )?;
        }
        Ok(())
    }
}
