//! Shared fixtures for the unit tests of the per-function passes.

use crate::{
    instrument::{
        metadata::MetadataStore,
        pass::{FunctionPass, ModuleInfo, PassContext},
        report::FunctionReport,
        runtime::{RuntimeDecls, RuntimeFn},
        InstrumentConfig,
    },
    ir::{Function, InstKind, Module, Operand, ValueId},
    utils::graph::algorithms::compute_dominators,
    Result,
};

/// A module prepared for running passes on one function at a time.
pub(crate) struct Harness {
    pub module: Module,
    pub runtime: RuntimeDecls,
    pub info: ModuleInfo,
    pub store: MetadataStore,
    pub config: InstrumentConfig,
}

impl Harness {
    pub fn new(mut module: Module, config: InstrumentConfig) -> Self {
        let runtime = RuntimeDecls::declare(&mut module).unwrap();
        let info = ModuleInfo::capture(&module);
        let store = MetadataStore::new(module.pointer_width());
        Harness {
            module,
            runtime,
            info,
            store,
            config,
        }
    }

    /// Runs `passes` in order on the function called `name`.
    pub fn run(
        &mut self,
        name: &str,
        passes: Vec<Box<dyn FunctionPass>>,
    ) -> Result<FunctionReport> {
        let id = self.module.function_by_name(name).unwrap();
        let func = self.module.function_mut(id)?;
        let dominators = compute_dominators(&*func);
        let mut report = FunctionReport::new(name);
        {
            let mut ctx = PassContext::new(
                &self.config,
                &self.info,
                &self.runtime,
                &mut self.store,
                &dominators,
                &mut report,
            );
            for mut pass in passes {
                pass.run_on_function(func, &mut ctx)?;
            }
        }
        Ok(report)
    }

    pub fn function(&self, name: &str) -> &Function {
        let id = self.module.function_by_name(name).unwrap();
        self.module.function(id).unwrap()
    }

    /// Calls to `routine` in `name`, in layout order.
    pub fn calls_to(&self, name: &str, routine: RuntimeFn) -> Vec<ValueId> {
        let func = self.function(name);
        let callee = self.runtime.callee(routine);
        func.blocks()
            .iter()
            .flat_map(|b| b.instructions().iter().copied())
            .filter(|v| {
                matches!(
                    func.instruction(*v).map(|i| &i.kind),
                    Some(InstKind::Call { callee: c, .. }) if *c == callee
                )
            })
            .collect()
    }

    /// Arguments of a call instruction.
    pub fn call_args(&self, name: &str, call: ValueId) -> Vec<Operand> {
        match self.function(name).instruction(call).map(|i| &i.kind) {
            Some(InstKind::Call { args, .. }) => args.clone(),
            _ => panic!("{call} is not a call"),
        }
    }
}
