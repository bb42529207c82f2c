//! Metadata propagation.
//!
//! Propagation runs as two passes over each function, both visiting blocks in breadth-first
//! order from the entry and only the *original* instructions of each block:
//!
//! 1. [`GatherPass::first`] creates metadata for everything it can see: parameters (from the
//!    shadow stack), stack allocations, pointer loads, derived pointers, selects, call results.
//!    Pointer phis get empty *placeholder* phis, one per enabled metadata component. An
//!    instruction whose pointer operand has no metadata yet (a forward reference around a back
//!    edge) is deferred. Stack allocations share one key per frame, requested in the prologue,
//!    which is released before every return.
//! 2. [`GatherPass::second`] retries the deferred instructions until nothing changes, fills in
//!    the placeholder phis edge by edge and records the metadata of every pointer written to
//!    memory.
//!
//! [`CoverageAudit`] runs afterwards and rejects a function in which a reachable pointer value
//! was left without metadata.

use crate::{
    instrument::{
        metadata::{PointerMetadata, SpatialMetadata, TemporalMetadata},
        pass::{FunctionPass, PassContext, Placeholder},
        runtime::{
            RuntimeFn, LOADED_BASE_FIELD, LOADED_BOUND_FIELD, LOADED_KEY_FIELD, LOADED_LOCK_FIELD,
        },
        shadow_stack::{load_parameters, marshal_call, marshal_return, FrameLayout},
    },
    ir::{
        BlockId, Constant, Function, InsertPoint, Inserter, InstKind, Operand, Type, ValueId,
    },
    utils::graph::{algorithms::bfs, NodeId},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GatherPhase {
    /// Create metadata, placeholders and deferrals
    Create,
    /// Resolve deferrals, fill placeholders, record stored pointers
    Resolve,
}

/// One of the two metadata propagation passes.
#[derive(Debug, Clone, Copy)]
pub struct GatherPass {
    phase: GatherPhase,
}

impl GatherPass {
    /// The first pass.
    #[must_use]
    pub const fn first() -> Self {
        GatherPass {
            phase: GatherPhase::Create,
        }
    }

    /// The second pass.
    #[must_use]
    pub const fn second() -> Self {
        GatherPass {
            phase: GatherPhase::Resolve,
        }
    }
}

impl FunctionPass for GatherPass {
    fn name(&self) -> &'static str {
        match self.phase {
            GatherPhase::Create => "gather-create",
            GatherPhase::Resolve => "gather-resolve",
        }
    }

    fn run_on_function(&mut self, func: &mut Function, ctx: &mut PassContext<'_>) -> Result<bool> {
        match self.phase {
            GatherPhase::Create => create(func, ctx)?,
            GatherPhase::Resolve => resolve(func, ctx)?,
        }
        Ok(true)
    }

    fn description(&self) -> &'static str {
        match self.phase {
            GatherPhase::Create => "Creates pointer metadata and placeholder phis",
            GatherPhase::Resolve => {
                "Resolves forward references, fills placeholder phis and stores metadata"
            }
        }
    }
}

/// Rejects functions with reachable pointer values that have no metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageAudit;

impl FunctionPass for CoverageAudit {
    fn name(&self) -> &'static str {
        "coverage-audit"
    }

    fn run_on_function(&mut self, func: &mut Function, ctx: &mut PassContext<'_>) -> Result<bool> {
        audit_coverage(func, ctx)?;
        Ok(false)
    }

    fn description(&self) -> &'static str {
        "Verifies that every reachable pointer value has metadata"
    }
}

/// Checks that every pointer parameter and every pointer-typed original instruction in a
/// reachable block has metadata.
///
/// # Errors
///
/// Returns [`Error::MissingMetadata`] naming the first uncovered value.
pub fn audit_coverage(func: &Function, ctx: &PassContext<'_>) -> Result<()> {
    let missing = |value: ValueId| Error::MissingMetadata {
        function: func.name().to_string(),
        value,
    };

    for &param in func.params() {
        if func.value_type(param).is_some_and(Type::is_pointer) && !ctx.metadata.has(param) {
            return Err(missing(param));
        }
    }
    for block in func.blocks() {
        if !ctx.is_reachable(block.id()) {
            continue;
        }
        for value in func.original_instructions(block.id()) {
            if func.value_type(value).is_some_and(Type::is_pointer) && !ctx.metadata.has(value) {
                return Err(missing(value));
            }
        }
    }
    Ok(())
}

/// Blocks reachable from the entry, in breadth-first order.
pub(crate) fn bfs_blocks(func: &Function) -> Vec<BlockId> {
    match func.entry_block() {
        Some(entry) => bfs(func, NodeId::from(entry)).map(BlockId::from).collect(),
        None => Vec::new(),
    }
}

fn create(func: &mut Function, ctx: &mut PassContext<'_>) -> Result<()> {
    load_parameters(ctx, func)?;

    for block in bfs_blocks(func) {
        for value in func.original_instructions(block) {
            if !propagate(func, ctx, value)? {
                tracing::trace!(value = %value, "deferred");
                ctx.state.deferred.push(value);
                ctx.report.deferred += 1;
            }
        }
    }

    release_frame_key(func, ctx)
}

fn resolve(func: &mut Function, ctx: &mut PassContext<'_>) -> Result<()> {
    resolve_deferred(func, ctx)?;
    fill_placeholders(func, ctx)?;

    for block in bfs_blocks(func) {
        for value in func.original_instructions(block) {
            let kind = func.instruction(value).map(|i| i.kind.clone());
            if let Some(InstKind::Store { value: stored, ptr }) = kind {
                store_metadata(func, ctx, value, &stored, &ptr)?;
            }
        }
    }
    Ok(())
}

/// Creates the metadata of one original instruction.
///
/// Returns `false` if an operand has no metadata yet. Nothing is inserted in that case, so
/// the instruction can simply be retried later.
fn propagate(func: &mut Function, ctx: &mut PassContext<'_>, value: ValueId) -> Result<bool> {
    let kind = func
        .instruction(value)
        .map(|i| i.kind.clone())
        .ok_or_else(|| invariant_error!("{} is not an instruction of '{}'", value, func.name()))?;
    let returns_pointer = func.value_type(value).is_some_and(Type::is_pointer);

    match kind {
        InstKind::Alloca { count, .. } => {
            stack_allocation(func, ctx, value, count)?;
            Ok(true)
        }
        InstKind::Load { ptr } if returns_pointer => {
            load_metadata(func, ctx, value, ptr)?;
            Ok(true)
        }
        InstKind::GetElementPtr { base: source, .. } | InstKind::BitCast { value: source }
            if returns_pointer =>
        {
            match ctx.try_resolve(func, &source)? {
                Some(metadata) => {
                    ctx.associate(func, value, metadata)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        InstKind::Select {
            cond,
            if_true,
            if_false,
        } if returns_pointer => select_metadata(func, ctx, value, cond, &if_true, &if_false),
        InstKind::Phi { .. } if returns_pointer => {
            create_placeholders(func, ctx, value)?;
            Ok(true)
        }
        InstKind::Call { callee, args, .. } => call_metadata(func, ctx, value, &callee, &args),
        InstKind::IntToPtr { .. } | InstKind::ExtractValue { .. } if returns_pointer => {
            let null = ctx.null_metadata();
            ctx.associate(func, value, null)?;
            Ok(true)
        }
        InstKind::Return {
            value: Some(returned),
        } => {
            if !func.operand_type(&returned)?.is_pointer() {
                return Ok(true);
            }
            match ctx.try_resolve(func, &returned)? {
                Some(metadata) => {
                    marshal_return(ctx, func, value, &metadata)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        _ => Ok(true),
    }
}

fn stack_allocation(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    alloca: ValueId,
    count: Option<Operand>,
) -> Result<()> {
    let width = ctx.pointer_width();
    let ty = func
        .value_type(alloca)
        .cloned()
        .ok_or_else(|| invariant_error!("alloca {} has no type", alloca))?;

    let temporal = if ctx.config.temporal_safety {
        Some(ctx.frame_key(func)?)
    } else {
        None
    };

    let spatial = if ctx.config.spatial_safety {
        let mut inserter = Inserter::new(func, InsertPoint::After(alloca))?;
        let base = inserter.cast_to_void_ptr(alloca.into())?;
        let count = count.unwrap_or_else(|| Constant::int(width.bits(), 1).into());
        let end = inserter.gep(alloca.into(), vec![count], ty)?;
        Some(SpatialMetadata {
            base,
            bound: inserter.cast_to_void_ptr(end.into())?,
        })
    } else {
        None
    };

    ctx.report.stack_allocations += 1;
    ctx.associate(func, alloca, PointerMetadata { spatial, temporal })
}

fn load_metadata(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    load: ValueId,
    ptr: Operand,
) -> Result<()> {
    let runtime = ctx.runtime;

    let metadata = {
        let mut inserter = Inserter::new(func, InsertPoint::After(load))?;
        let address = inserter.cast_to_void_ptr(ptr)?;
        let record: Operand = runtime
            .call(&mut inserter, RuntimeFn::MetadataLoad, vec![address])?
            .into();

        let spatial = if ctx.config.spatial_safety {
            Some(SpatialMetadata {
                base: inserter.extract_value(record.clone(), LOADED_BASE_FIELD)?.into(),
                bound: inserter.extract_value(record.clone(), LOADED_BOUND_FIELD)?.into(),
            })
        } else {
            None
        };
        let temporal = if ctx.config.temporal_safety {
            Some(TemporalMetadata {
                key: inserter.extract_value(record.clone(), LOADED_KEY_FIELD)?.into(),
                lock: inserter.extract_value(record, LOADED_LOCK_FIELD)?.into(),
            })
        } else {
            None
        };
        PointerMetadata { spatial, temporal }
    };

    ctx.report.metadata_loads += 1;
    ctx.associate(func, load, metadata)
}

fn select_metadata(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    select: ValueId,
    cond: Operand,
    if_true: &Operand,
    if_false: &Operand,
) -> Result<bool> {
    let (Some(on_true), Some(on_false)) = (
        ctx.try_resolve(func, if_true)?,
        ctx.try_resolve(func, if_false)?,
    ) else {
        return Ok(false);
    };

    let metadata = {
        let mut inserter = Inserter::new(func, InsertPoint::After(select))?;
        let spatial = match (on_true.spatial, on_false.spatial) {
            (Some(t), Some(f)) => Some(SpatialMetadata {
                base: inserter.select(cond.clone(), t.base, f.base)?.into(),
                bound: inserter.select(cond.clone(), t.bound, f.bound)?.into(),
            }),
            _ => None,
        };
        let temporal = match (on_true.temporal, on_false.temporal) {
            (Some(t), Some(f)) => Some(TemporalMetadata {
                key: inserter.select(cond.clone(), t.key, f.key)?.into(),
                lock: inserter.select(cond, t.lock, f.lock)?.into(),
            }),
            _ => None,
        };
        PointerMetadata { spatial, temporal }
    };

    ctx.associate(func, select, metadata)?;
    Ok(true)
}

fn create_placeholders(func: &mut Function, ctx: &mut PassContext<'_>, phi: ValueId) -> Result<()> {
    let key_type = ctx.pointer_width().key_type();
    let (spatial, temporal) = (ctx.config.spatial_safety, ctx.config.temporal_safety);

    let placeholder = {
        let mut inserter = Inserter::new(func, InsertPoint::After(phi))?;
        let (base, bound) = if spatial {
            (
                Some(inserter.phi(Type::void_ptr())?),
                Some(inserter.phi(Type::void_ptr())?),
            )
        } else {
            (None, None)
        };
        let (key, lock) = if temporal {
            (
                Some(inserter.phi(key_type)?),
                Some(inserter.phi(Type::void_ptr())?),
            )
        } else {
            (None, None)
        };
        Placeholder {
            phi,
            base,
            bound,
            key,
            lock,
        }
    };

    let metadata = PointerMetadata {
        spatial: placeholder
            .base
            .zip(placeholder.bound)
            .map(|(base, bound)| SpatialMetadata {
                base: base.into(),
                bound: bound.into(),
            }),
        temporal: placeholder
            .key
            .zip(placeholder.lock)
            .map(|(key, lock)| TemporalMetadata {
                key: key.into(),
                lock: lock.into(),
            }),
    };
    ctx.associate(func, phi, metadata)?;
    ctx.state.placeholders.push(placeholder);
    ctx.report.placeholder_phis += 1;
    Ok(())
}

fn call_metadata(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    call: ValueId,
    callee: &Operand,
    args: &[Operand],
) -> Result<bool> {
    let ret = func.value_type(call).cloned().unwrap_or(Type::Void);

    if !ctx.module.is_instrumented_call(callee) {
        if ret.is_pointer() {
            let null = ctx.null_metadata();
            ctx.associate(func, call, null)?;
        }
        return Ok(true);
    }

    let layout = FrameLayout::for_call(func, args, &ret)?;
    let mut metadata = Vec::with_capacity(layout.pointer_args.len());
    for &position in &layout.pointer_args {
        match ctx.try_resolve(func, &args[position])? {
            Some(arg) => metadata.push(arg),
            None => return Ok(false),
        }
    }

    marshal_call(ctx, func, call, &layout, &metadata)?;
    Ok(true)
}

/// Releases the frame key before every reachable return.
fn release_frame_key(func: &mut Function, ctx: &mut PassContext<'_>) -> Result<()> {
    let Some(frame_key) = ctx.state.frame_key.clone() else {
        return Ok(());
    };
    let runtime = ctx.runtime;

    let returns: Vec<ValueId> = func
        .blocks()
        .iter()
        .filter(|b| ctx.is_reachable(b.id()))
        .filter_map(|b| {
            let terminator = func.terminator(b.id())?;
            matches!(
                func.instruction(terminator).map(|i| &i.kind),
                Some(InstKind::Return { .. })
            )
            .then_some(terminator)
        })
        .collect();

    for ret in returns {
        let mut inserter = Inserter::new(func, InsertPoint::Before(ret))?;
        runtime.call(
            &mut inserter,
            RuntimeFn::StackMemoryDeallocation,
            vec![frame_key.key.clone()],
        )?;
    }
    Ok(())
}

fn resolve_deferred(func: &mut Function, ctx: &mut PassContext<'_>) -> Result<()> {
    let mut pending = std::mem::take(&mut ctx.state.deferred);

    while !pending.is_empty() {
        let before = pending.len();
        let mut unresolved = Vec::new();
        for value in pending {
            if !propagate(func, ctx, value)? {
                unresolved.push(value);
            }
        }

        if unresolved.len() == before {
            let value = first_unresolved_operand(func, ctx, unresolved[0]);
            return Err(Error::MissingMetadata {
                function: func.name().to_string(),
                value,
            });
        }
        pending = unresolved;
    }
    Ok(())
}

/// The first pointer operand of `value` that still has no metadata, or `value` itself.
fn first_unresolved_operand(func: &Function, ctx: &PassContext<'_>, value: ValueId) -> ValueId {
    func.instruction(value)
        .and_then(|inst| {
            inst.kind
                .operands()
                .into_iter()
                .filter_map(Operand::as_value)
                .find(|v| func.value_type(*v).is_some_and(Type::is_pointer) && !ctx.metadata.has(*v))
        })
        .unwrap_or(value)
}

fn fill_placeholders(func: &mut Function, ctx: &mut PassContext<'_>) -> Result<()> {
    let placeholders = std::mem::take(&mut ctx.state.placeholders);
    let width = ctx.pointer_width();

    for placeholder in &placeholders {
        let incoming = match func.instruction(placeholder.phi).map(|i| &i.kind) {
            Some(InstKind::Phi { incoming }) => incoming.clone(),
            _ => return Err(invariant_error!("placeholder for non-phi {}", placeholder.phi)),
        };
        let expected = incoming.len();

        for (filled, (operand, pred)) in incoming.iter().enumerate() {
            let metadata = if ctx.is_reachable(*pred) {
                match ctx.try_resolve(func, operand)? {
                    Some(metadata) => metadata,
                    None => {
                        return Err(Error::PhiArity {
                            function: func.name().to_string(),
                            phi: placeholder.phi,
                            expected,
                            found: filled,
                        })
                    }
                }
            } else {
                ctx.null_metadata()
            };

            let edges = [
                (placeholder.base, metadata.base_or_null()),
                (placeholder.bound, metadata.bound_or_null()),
                (placeholder.key, metadata.key_or_zero(width)),
                (placeholder.lock, metadata.lock_or_null()),
            ];
            for (shadow, component) in edges {
                if let Some(shadow) = shadow {
                    func.add_phi_incoming(shadow, component, *pred)?;
                }
            }
        }

        let shadows = [
            placeholder.base,
            placeholder.bound,
            placeholder.key,
            placeholder.lock,
        ];
        for shadow in shadows.into_iter().flatten() {
            let found = func.phi_arity(shadow).unwrap_or(0);
            if found != expected {
                return Err(Error::PhiArity {
                    function: func.name().to_string(),
                    phi: placeholder.phi,
                    expected,
                    found,
                });
            }
        }
        tracing::trace!(phi = %placeholder.phi, edges = expected, "placeholder filled");
    }
    Ok(())
}

fn store_metadata(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    store: ValueId,
    stored: &Operand,
    ptr: &Operand,
) -> Result<()> {
    if !func.operand_type(stored)?.is_pointer() {
        return Ok(());
    }
    let metadata = ctx.resolve(func, stored)?;
    let width = ctx.pointer_width();
    let runtime = ctx.runtime;

    let mut inserter = Inserter::new(func, InsertPoint::After(store))?;
    let address = inserter.cast_to_void_ptr(ptr.clone())?;
    runtime.call(
        &mut inserter,
        RuntimeFn::MetadataStore,
        vec![
            address,
            metadata.base_or_null(),
            metadata.bound_or_null(),
            metadata.key_or_zero(width),
            metadata.lock_or_null(),
        ],
    )?;
    ctx.report.metadata_stores += 1;
    Ok(())
}
