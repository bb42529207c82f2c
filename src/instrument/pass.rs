//! Pass trait and the context shared by the per-function passes.
//!
//! Every per-function stage of the engine (both gather passes, the coverage audit and check
//! insertion) implements [`FunctionPass`]. Passes receive the function mutably and everything
//! else through a [`PassContext`]: the immutable configuration, a snapshot of module-level
//! facts ([`ModuleInfo`]), the runtime declarations, the module-wide [`MetadataStore`], the
//! function's dominator tree and its report.
//!
//! The module itself is not reachable from a pass. A pass that needs to know something about
//! another function or a global asks the [`ModuleInfo`] snapshot, which is taken once after
//! all module-level rewriting (runtime declarations, wrapper redirection, renaming, seeding)
//! is done.

use crate::{
    instrument::{
        constants::{fold_constant, FoldedMetadata},
        metadata::{MetadataStore, PointerMetadata, TemporalMetadata},
        report::FunctionReport,
        runtime::{
            is_intrinsic, RuntimeDecls, RuntimeFn, ALLOCATION_KEY_FIELD, ALLOCATION_LOCK_FIELD,
        },
        InstrumentConfig,
    },
    ir::{
        BlockId, ConstExpr, Constant, DataLayout, FuncId, Function, FunctionFlags, FunctionType,
        GlobalId, InsertPoint, Inserter, Module, Operand, PointerWidth, Type, ValueId,
    },
    utils::graph::{algorithms::DominatorTree, NodeId},
    Error, Result,
};

/// A transformation applied to one function at a time.
///
/// Passes must be `Send` so a configured pipeline can be moved between threads; a single run
/// is strictly sequential.
pub trait FunctionPass: Send {
    /// Unique name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Should this pass run on the given function?
    ///
    /// The default skips declarations.
    fn should_run(&self, func: &Function) -> bool {
        !func.is_declaration()
    }

    /// Runs the pass on a single function.
    ///
    /// Returns `true` if the function was modified.
    ///
    /// # Errors
    ///
    /// Returns an error if an instrumentation invariant does not hold. Errors are fatal for the
    /// whole run.
    fn run_on_function(&mut self, func: &mut Function, ctx: &mut PassContext<'_>) -> Result<bool>;

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}

/// What the passes know about a callee.
#[derive(Debug, Clone)]
pub struct CalleeInfo {
    /// Symbol name
    pub name: String,
    /// Signature
    pub signature: FunctionType,
    /// Instrumentation flags
    pub flags: FunctionFlags,
    /// Whether the function has no body in this module
    pub is_declaration: bool,
}

impl CalleeInfo {
    /// Returns `true` if calls to this function pass metadata through the shadow stack.
    ///
    /// Defined functions and runtime wrappers do; runtime routines, intrinsics and plain
    /// external declarations do not.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        if self.flags.contains(FunctionFlags::RUNTIME) {
            return false;
        }
        if self.flags.contains(FunctionFlags::WRAPPER) {
            return true;
        }
        !self.is_declaration && !is_intrinsic(&self.name)
    }
}

/// What the passes know about a global variable.
#[derive(Debug, Clone)]
pub struct GlobalInfo {
    /// Symbol name
    pub name: String,
    /// Type of the global's value
    pub value_type: Type,
    /// Whether the global is defined outside the module
    pub external: bool,
}

/// Module-level facts available to per-function passes.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pointer_width: PointerWidth,
    functions: Vec<CalleeInfo>,
    globals: Vec<GlobalInfo>,
}

impl ModuleInfo {
    /// Takes a snapshot of `module`.
    #[must_use]
    pub fn capture(module: &Module) -> Self {
        ModuleInfo {
            pointer_width: module.pointer_width(),
            functions: module
                .functions()
                .iter()
                .map(|f| CalleeInfo {
                    name: f.name().to_string(),
                    signature: f.signature().clone(),
                    flags: f.flags(),
                    is_declaration: f.is_declaration(),
                })
                .collect(),
            globals: module
                .globals()
                .iter()
                .map(|g| GlobalInfo {
                    name: g.name().to_string(),
                    value_type: g.value_type().clone(),
                    external: g.is_external(),
                })
                .collect(),
        }
    }

    /// The module's pointer width.
    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    /// Layout rules of the module's target.
    #[must_use]
    pub const fn layout(&self) -> DataLayout {
        DataLayout::new(self.pointer_width)
    }

    /// Looks up a function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFunction`] for a dangling handle.
    pub fn callee(&self, id: FuncId) -> Result<&CalleeInfo> {
        self.functions.get(id.index()).ok_or(Error::UnknownFunction(id))
    }

    /// Looks up a global.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownGlobal`] for a dangling handle.
    pub fn global(&self, id: GlobalId) -> Result<&GlobalInfo> {
        self.globals.get(id.index()).ok_or(Error::UnknownGlobal(id))
    }

    /// The name of a direct callee.
    #[must_use]
    pub fn callee_name(&self, callee: &Operand) -> Option<&str> {
        direct_callee(callee)
            .and_then(|id| self.functions.get(id.index()))
            .map(|info| info.name.as_str())
    }

    /// Returns `true` if a call through `callee` follows the shadow stack convention.
    ///
    /// Indirect calls through SSA values are assumed to reach instrumented code. Calls through
    /// other constants (an `inttoptr` address, `undef`) are opaque.
    #[must_use]
    pub fn is_instrumented_call(&self, callee: &Operand) -> bool {
        match direct_callee(callee) {
            Some(id) => self
                .functions
                .get(id.index())
                .is_some_and(CalleeInfo::is_instrumented),
            None => callee.as_value().is_some(),
        }
    }
}

/// Returns the function a callee operand names directly, looking through constant bitcasts.
#[must_use]
pub fn direct_callee(callee: &Operand) -> Option<FuncId> {
    let mut constant = callee.as_const()?;
    loop {
        match constant {
            Constant::Function { id, .. } => return Some(*id),
            Constant::Expr(expr) => match expr.as_ref() {
                ConstExpr::BitCast { value, .. } => constant = value,
                _ => return None,
            },
            _ => return None,
        }
    }
}

/// Shadow phis standing in for the metadata of an original pointer phi.
#[derive(Debug, Clone)]
pub(crate) struct Placeholder {
    pub phi: ValueId,
    pub base: Option<ValueId>,
    pub bound: Option<ValueId>,
    pub key: Option<ValueId>,
    pub lock: Option<ValueId>,
}

/// Per-function state carried from the first gather pass to the second.
#[derive(Debug, Default)]
pub struct FunctionState {
    pub(crate) global_lock: Option<Operand>,
    pub(crate) frame_key: Option<TemporalMetadata>,
    pub(crate) placeholders: Vec<Placeholder>,
    pub(crate) deferred: Vec<ValueId>,
}

/// Everything a [`FunctionPass`] may use besides the function itself.
pub struct PassContext<'a> {
    /// The run's configuration
    pub config: &'a InstrumentConfig,
    /// Snapshot of module-level facts
    pub module: &'a ModuleInfo,
    /// Declared runtime routines
    pub runtime: &'a RuntimeDecls,
    /// Module-wide metadata store
    pub metadata: &'a mut MetadataStore,
    /// Dominator tree of the function being processed
    pub dominators: &'a DominatorTree,
    /// Counters of the function being processed
    pub report: &'a mut FunctionReport,
    pub(crate) state: FunctionState,
}

impl<'a> PassContext<'a> {
    /// Creates the context for one function.
    pub fn new(
        config: &'a InstrumentConfig,
        module: &'a ModuleInfo,
        runtime: &'a RuntimeDecls,
        metadata: &'a mut MetadataStore,
        dominators: &'a DominatorTree,
        report: &'a mut FunctionReport,
    ) -> Self {
        PassContext {
            config,
            module,
            runtime,
            metadata,
            dominators,
            report,
            state: FunctionState::default(),
        }
    }

    /// The module's pointer width.
    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        self.module.pointer_width()
    }

    /// Returns `true` if `block` is reachable from the entry.
    #[must_use]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.dominators.is_reachable(NodeId::from(block))
    }

    /// Null metadata restricted to the enabled safety kinds.
    #[must_use]
    pub fn null_metadata(&self) -> PointerMetadata {
        PointerMetadata::null(
            self.pointer_width(),
            self.config.spatial_safety,
            self.config.temporal_safety,
        )
    }

    /// The function's global lock, obtained from the runtime at the top of the entry block on
    /// first use.
    ///
    /// # Errors
    ///
    /// Propagates insertion failures.
    pub fn global_lock(&mut self, func: &mut Function) -> Result<Operand> {
        if let Some(lock) = &self.state.global_lock {
            return Ok(lock.clone());
        }

        let mut inserter = Inserter::new(func, InsertPoint::Prologue)?;
        let lock: Operand = self
            .runtime
            .call(&mut inserter, RuntimeFn::GetGlobalLock, vec![])?
            .into();
        tracing::trace!(function = func.name(), "global lock requested");
        self.state.global_lock = Some(lock.clone());
        Ok(lock)
    }

    /// The key and lock shared by every stack allocation of the function, obtained from the
    /// runtime at the top of the entry block on first use.
    ///
    /// Being defined in the prologue, the pair dominates every return of the function.
    ///
    /// # Errors
    ///
    /// Propagates insertion failures.
    pub fn frame_key(&mut self, func: &mut Function) -> Result<TemporalMetadata> {
        if let Some(frame_key) = &self.state.frame_key {
            return Ok(frame_key.clone());
        }

        let mut inserter = Inserter::new(func, InsertPoint::Prologue)?;
        let pair: Operand = self
            .runtime
            .call(&mut inserter, RuntimeFn::StackMemoryAllocation, vec![])?
            .into();
        let lock = inserter.extract_value(pair.clone(), ALLOCATION_LOCK_FIELD)?;
        let key = inserter.extract_value(pair, ALLOCATION_KEY_FIELD)?;
        let frame_key = TemporalMetadata {
            key: key.into(),
            lock: lock.into(),
        };
        tracing::trace!(function = func.name(), "frame key requested");
        self.state.frame_key = Some(frame_key.clone());
        Ok(frame_key)
    }

    /// Turns folded constant metadata into operands, requesting the global lock if needed.
    ///
    /// # Errors
    ///
    /// Propagates insertion failures.
    pub fn materialize(
        &mut self,
        func: &mut Function,
        folded: &FoldedMetadata,
    ) -> Result<PointerMetadata> {
        let lock = if self.config.temporal_safety && folded.needs_global_lock() {
            self.global_lock(func)?
        } else {
            Constant::null_void_ptr().into()
        };
        Ok(folded.materialize(
            self.pointer_width(),
            self.config.spatial_safety,
            self.config.temporal_safety,
            lock,
        ))
    }

    /// The metadata of an operand, or `None` for a value that has none yet.
    ///
    /// Constants are folded on every query instead of being stored.
    ///
    /// # Errors
    ///
    /// Returns an error if a constant cannot be folded (it is not a pointer) or if the global
    /// lock cannot be inserted.
    pub fn try_resolve(
        &mut self,
        func: &mut Function,
        operand: &Operand,
    ) -> Result<Option<PointerMetadata>> {
        match operand {
            Operand::Const(constant) => {
                let folded = fold_constant(constant, self.module)?;
                Ok(Some(self.materialize(func, &folded)?))
            }
            Operand::Value(value) => Ok(self.metadata.lookup(*value)),
        }
    }

    /// The metadata of an operand, which must exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMetadata`] for a value without metadata, or any error of
    /// [`PassContext::try_resolve`].
    pub fn resolve(&mut self, func: &mut Function, operand: &Operand) -> Result<PointerMetadata> {
        match self.try_resolve(func, operand)? {
            Some(metadata) => Ok(metadata),
            None => Err(Error::MissingMetadata {
                function: func.name().to_string(),
                value: operand
                    .as_value()
                    .ok_or_else(|| invariant_error!("constant {} did not fold", operand))?,
            }),
        }
    }

    /// Associates metadata with a value of `func`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetadataType`] for mistyped components.
    pub fn associate(
        &mut self,
        func: &Function,
        value: ValueId,
        metadata: PointerMetadata,
    ) -> Result<()> {
        self.metadata.associate(func, value, metadata)
    }
}
