//! Instrumentation engine.
//!
//! The engine owns the configuration and drives a module through the instrumentation:
//!
//! 1. **Module preparation**: declare the runtime, redirect library calls to their wrappers,
//!    rename `main`, seed the metadata of pointers stored in global initializers.
//! 2. **Per-function pipeline**: for every function defined by the input program, in
//!    declaration order: gather pass 1, gather pass 2, coverage audit, check insertion, and
//!    optionally the verifier.
//!
//! Module preparation completes before any function is processed, so every function sees the
//! final set of declarations and the seeded globals.

use std::collections::HashMap;

use crate::{
    instrument::{
        checks::CheckInsertionPass,
        constants::seed_globals,
        gather::{CoverageAudit, GatherPass},
        metadata::MetadataStore,
        pass::{FunctionPass, ModuleInfo, PassContext},
        report::{FunctionReport, InstrumentReport},
        runtime::{wrapper_symbol, RuntimeDecls, PSEUDO_MAIN, WRAPPED_LIBRARY_FUNCTIONS},
        InstrumentConfig,
    },
    ir::{verify_function, FuncId, Function, FunctionFlags, Module, Operand, ValueId},
    utils::graph::algorithms::compute_dominators,
    Error, Result,
};

/// Drives the instrumentation of whole modules.
///
/// # Example
///
/// ```rust,no_run
/// use softboundcets::prelude::*;
///
/// # fn example(module: &mut Module) -> softboundcets::Result<()> {
/// let engine = InstrumentEngine::new(InstrumentConfig::default());
/// let report = engine.run(module)?;
/// println!("{report}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InstrumentEngine {
    config: InstrumentConfig,
}

impl InstrumentEngine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: InstrumentConfig) -> Self {
        Self { config }
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Builds the per-function pass pipeline for the configuration.
    ///
    /// Check insertion is left out when the configuration enables no check and no metadata
    /// copying.
    #[must_use]
    pub fn build_pipeline(&self) -> Vec<Box<dyn FunctionPass>> {
        let mut passes: Vec<Box<dyn FunctionPass>> = vec![
            Box::new(GatherPass::first()),
            Box::new(GatherPass::second()),
            Box::new(CoverageAudit),
        ];
        if self.config.spatial_checks_enabled()
            || self.config.temporal_checks_enabled()
            || self.config.memcpy_metadata
        {
            passes.push(Box::new(CheckInsertionPass::new()));
        }
        passes
    }

    /// Instruments every function the module defines.
    ///
    /// # Arguments
    ///
    /// * `module` - The module to rewrite in place.
    ///
    /// # Returns
    ///
    /// Counters describing what was inserted and what was elided.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unusable configuration,
    /// [`Error::InvalidIr`] for malformed input, and any invariant violation detected by the
    /// passes or the verifier. The module is partially rewritten in that case and must be
    /// discarded.
    pub fn run(&self, module: &mut Module) -> Result<InstrumentReport> {
        self.config.validate()?;
        let _span = tracing::debug_span!("instrument_module", module = module.name()).entered();

        let targets: Vec<FuncId> = module
            .functions()
            .iter()
            .filter(|f| is_program_function(f))
            .map(Function::id)
            .collect();

        let runtime = RuntimeDecls::declare(module)?;
        tracing::debug!(targets = targets.len(), "runtime declared");

        let mut report = InstrumentReport::default();
        if self.config.wrap_library_calls {
            report.wrapped_calls = wrap_library_calls(module, &targets)?;
        }
        if self.config.rename_main {
            report.renamed_main = rename_main(module)?;
        }
        report.seeded_global_fields = seed_globals(module, &runtime, &self.config)?;

        let info = ModuleInfo::capture(module);
        let mut store = MetadataStore::new(module.pointer_width());
        let mut passes = self.build_pipeline();

        for id in targets {
            let func = module.function_mut(id)?;
            let function_report =
                self.run_function(func, &info, &runtime, &mut store, &mut passes)?;
            report.functions.push(function_report);
        }

        tracing::debug!(
            functions = report.functions.len(),
            checks = report.total_checks(),
            "module instrumented"
        );
        Ok(report)
    }

    fn run_function(
        &self,
        func: &mut Function,
        info: &ModuleInfo,
        runtime: &RuntimeDecls,
        store: &mut MetadataStore,
        passes: &mut [Box<dyn FunctionPass>],
    ) -> Result<FunctionReport> {
        let name = func.name().to_string();
        let _span = tracing::debug_span!("instrument_function", function = %name).entered();

        check_entry(func)?;
        let dominators = compute_dominators(&*func);
        let mut report = FunctionReport::new(name);

        {
            let mut ctx =
                PassContext::new(&self.config, info, runtime, store, &dominators, &mut report);
            for pass in passes.iter_mut() {
                if !pass.should_run(func) {
                    continue;
                }
                let changed = pass.run_on_function(func, &mut ctx)?;
                tracing::trace!(pass = pass.name(), changed, "pass finished");
            }
        }

        if self.config.verify_output {
            verify_function(func)?;
        }
        tracing::debug!(
            spatial = report.spatial_checks,
            temporal = report.temporal_checks,
            elided = report.temporal_eliminated(),
            "function instrumented"
        );
        Ok(report)
    }
}

/// Returns `true` for functions with a body that came from the input program.
fn is_program_function(func: &Function) -> bool {
    !func.is_declaration()
        && !func.flags().intersects(
            FunctionFlags::RUNTIME | FunctionFlags::SYNTHETIC | FunctionFlags::WRAPPER,
        )
}

/// The entry block must not be a branch target, so the prologue runs exactly once.
fn check_entry(func: &Function) -> Result<()> {
    let entry = func
        .entry_block()
        .ok_or_else(|| Error::InvalidIr(format!("'{}' has no entry block", func.name())))?;
    if !func.block_predecessors(entry).is_empty() {
        return Err(Error::InvalidIr(format!(
            "entry block of '{}' has predecessors",
            func.name()
        )));
    }
    Ok(())
}

/// Redirects every use of a known library routine to its runtime wrapper.
///
/// Call sites, address-taken uses in instruction operands and function addresses stored in
/// global initializers are all rewritten, so an indirect call through a stored `malloc`
/// reaches the wrapper and receives metadata like a direct one.
///
/// Returns the number of rewritten uses.
fn wrap_library_calls(module: &mut Module, targets: &[FuncId]) -> Result<usize> {
    let libraries: Vec<(FuncId, String)> = module
        .functions()
        .iter()
        .filter(|f| {
            f.is_declaration()
                && f.flags().is_empty()
                && WRAPPED_LIBRARY_FUNCTIONS.contains(&f.name())
        })
        .map(|f| (f.id(), f.name().to_string()))
        .collect();
    if libraries.is_empty() {
        return Ok(0);
    }

    let mut redirect: HashMap<FuncId, FuncId> = HashMap::new();
    for (id, name) in libraries {
        let signature = module.function(id)?.signature().clone();
        let wrapper = module.declare_function(wrapper_symbol(&name), signature)?;
        module.function_mut(wrapper)?.add_flags(FunctionFlags::WRAPPER);
        redirect.insert(id, wrapper);
    }
    let map = |id: FuncId| redirect.get(&id).copied();

    let mut rewritten = 0;
    for &id in targets {
        let func = module.function_mut(id)?;
        let values: Vec<ValueId> = func.instructions().map(|(value, _)| value).collect();
        for value in values {
            let Some(inst) = func.instruction_mut(value) else {
                continue;
            };
            for operand in inst.kind.operands_mut() {
                if let Operand::Const(constant) = operand {
                    rewritten += constant.replace_functions(&map);
                }
            }
        }
    }

    let mut initializers = 0;
    for initializer in module.initializers_mut() {
        initializers += initializer.replace_functions(&map);
    }

    tracing::debug!(rewritten, initializers, "library uses wrapped");
    Ok(rewritten + initializers)
}

fn rename_main(module: &mut Module) -> Result<bool> {
    match module.function_by_name("main") {
        Some(id) if !module.function(id)?.is_declaration() => {
            module.rename_function(id, PSEUDO_MAIN)?;
            tracing::debug!("main renamed to {}", PSEUDO_MAIN);
            Ok(true)
        }
        _ => Ok(false),
    }
}
