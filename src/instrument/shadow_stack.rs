//! Shadow stack calling convention.
//!
//! Pointer metadata crosses call boundaries through a runtime-managed stack of frames instead
//! of extra arguments. For a call with `k` pointer arguments:
//!
//! ```text
//! allocate_shadow_stack_space(k + 1)     ; only if k > 0 or the result is a pointer
//! store_{base,bound,key,lock}_shadow_stack(md(arg_i), i)   for i in 1..=k
//! %r = call @f(...)
//! load_{base,bound,key,lock}_shadow_stack(0)               ; only for pointer results
//! deallocate_shadow_stack_space()
//! ```
//!
//! The callee reads the metadata of its `n`-th pointer parameter from slot `n` at entry and
//! writes the metadata of a returned pointer to slot 0 before each `ret`.
//!
//! Only the components of enabled safety kinds are transferred.

use crate::{
    instrument::{
        constants::FoldedMetadata,
        metadata::{PointerMetadata, SpatialMetadata, TemporalMetadata},
        pass::PassContext,
        runtime::{RuntimeDecls, RuntimeFn},
    },
    ir::{
        Constant, Function, InsertPoint, Inserter, Operand, ParamAttributes, Type, ValueId,
    },
    Result,
};

/// Slot receiving the metadata of a returned pointer.
pub const RETURN_SLOT: i64 = 0;

/// Shape of the shadow stack frame of one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Positions of the pointer-typed actual arguments, in order; the `n`-th uses slot `n + 1`
    pub pointer_args: Vec<usize>,
    /// Whether the call produces a pointer
    pub returns_pointer: bool,
}

impl FrameLayout {
    /// Computes the frame layout of a call.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidIr`] if an argument is not a value of `func`.
    pub fn for_call(func: &Function, args: &[Operand], ret: &Type) -> Result<Self> {
        let mut pointer_args = Vec::new();
        for (position, arg) in args.iter().enumerate() {
            if func.operand_type(arg)?.is_pointer() {
                pointer_args.push(position);
            }
        }
        Ok(FrameLayout {
            pointer_args,
            returns_pointer: ret.is_pointer(),
        })
    }

    /// Number of slots to allocate; 0 means no frame at all.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        if self.pointer_args.is_empty() && !self.returns_pointer {
            0
        } else {
            self.pointer_args.len() + 1
        }
    }

    /// Returns `true` if the call needs a frame.
    #[must_use]
    pub fn has_frame(&self) -> bool {
        self.slot_count() > 0
    }
}

fn slot_operand(slot: i64) -> Operand {
    Constant::i32(slot).into()
}

fn store_slot(
    runtime: &RuntimeDecls,
    inserter: &mut Inserter<'_>,
    metadata: &PointerMetadata,
    slot: i64,
) -> Result<()> {
    if let Some(SpatialMetadata { base, bound }) = &metadata.spatial {
        runtime.call(
            inserter,
            RuntimeFn::StoreBaseShadowStack,
            vec![base.clone(), slot_operand(slot)],
        )?;
        runtime.call(
            inserter,
            RuntimeFn::StoreBoundShadowStack,
            vec![bound.clone(), slot_operand(slot)],
        )?;
    }
    if let Some(TemporalMetadata { key, lock }) = &metadata.temporal {
        runtime.call(
            inserter,
            RuntimeFn::StoreKeyShadowStack,
            vec![key.clone(), slot_operand(slot)],
        )?;
        runtime.call(
            inserter,
            RuntimeFn::StoreLockShadowStack,
            vec![lock.clone(), slot_operand(slot)],
        )?;
    }
    Ok(())
}

fn load_slot(
    runtime: &RuntimeDecls,
    inserter: &mut Inserter<'_>,
    slot: i64,
    spatial: bool,
    temporal: bool,
) -> Result<PointerMetadata> {
    let mut load = |routine| -> Result<Operand> {
        Ok(runtime
            .call(inserter, routine, vec![slot_operand(slot)])?
            .into())
    };

    let spatial = if spatial {
        Some(SpatialMetadata {
            base: load(RuntimeFn::LoadBaseShadowStack)?,
            bound: load(RuntimeFn::LoadBoundShadowStack)?,
        })
    } else {
        None
    };
    let temporal = if temporal {
        Some(TemporalMetadata {
            key: load(RuntimeFn::LoadKeyShadowStack)?,
            lock: load(RuntimeFn::LoadLockShadowStack)?,
        })
    } else {
        None
    };

    Ok(PointerMetadata { spatial, temporal })
}

/// Wraps an instrumented call in a shadow stack frame.
///
/// `args` holds the metadata of the pointer arguments in the order of
/// [`FrameLayout::pointer_args`]. A pointer result is associated with the metadata read back
/// from the return slot.
///
/// # Errors
///
/// Propagates insertion and association failures.
pub fn marshal_call(
    ctx: &mut PassContext<'_>,
    func: &mut Function,
    call: ValueId,
    layout: &FrameLayout,
    args: &[PointerMetadata],
) -> Result<()> {
    if !layout.has_frame() {
        return Ok(());
    }
    let runtime = ctx.runtime;
    let slots = i64::try_from(layout.slot_count())
        .map_err(|_| invariant_error!("frame of {} slots", layout.slot_count()))?;

    {
        let mut inserter = Inserter::new(func, InsertPoint::Before(call))?;
        runtime.call(
            &mut inserter,
            RuntimeFn::AllocateShadowStackSpace,
            vec![slot_operand(slots)],
        )?;
        for (slot, metadata) in (1..).zip(args) {
            store_slot(runtime, &mut inserter, metadata, slot)?;
        }
    }

    let result = {
        let mut inserter = Inserter::new(func, InsertPoint::After(call))?;
        let result = if layout.returns_pointer {
            Some(load_slot(
                runtime,
                &mut inserter,
                RETURN_SLOT,
                ctx.config.spatial_safety,
                ctx.config.temporal_safety,
            )?)
        } else {
            None
        };
        runtime.call(&mut inserter, RuntimeFn::DeallocateShadowStackSpace, vec![])?;
        result
    };

    if let Some(metadata) = result {
        ctx.associate(func, call, metadata)?;
    }
    ctx.report.shadow_stack_frames += 1;
    tracing::trace!(call = %call, slots, "shadow stack frame");
    Ok(())
}

/// Writes the metadata of a returned pointer into the return slot before `ret`.
///
/// # Errors
///
/// Propagates insertion failures.
pub fn marshal_return(
    ctx: &mut PassContext<'_>,
    func: &mut Function,
    ret: ValueId,
    metadata: &PointerMetadata,
) -> Result<()> {
    let mut inserter = Inserter::new(func, InsertPoint::Before(ret))?;
    store_slot(ctx.runtime, &mut inserter, metadata, RETURN_SLOT)
}

/// Associates every pointer parameter with the metadata the caller left in its frame.
///
/// `byval` parameters are private copies and get unbounded metadata instead. They still
/// occupy a slot.
///
/// # Errors
///
/// Propagates insertion and association failures.
pub fn load_parameters(ctx: &mut PassContext<'_>, func: &mut Function) -> Result<()> {
    let runtime = ctx.runtime;
    let width = ctx.pointer_width();
    let params: Vec<(usize, ValueId)> = func.params().iter().copied().enumerate().collect();

    let mut slot = 0i64;
    for (position, param) in params {
        if !func.value_type(param).is_some_and(Type::is_pointer) {
            continue;
        }
        slot += 1;

        let metadata = if func.param_attributes(position).contains(ParamAttributes::BYVAL) {
            ctx.materialize(func, &FoldedMetadata::unbounded(width))?
        } else {
            let mut inserter = Inserter::new(func, InsertPoint::Prologue)?;
            let metadata = load_slot(
                runtime,
                &mut inserter,
                slot,
                ctx.config.spatial_safety,
                ctx.config.temporal_safety,
            )?;

            if ctx.config.introspect_metadata {
                if let Some(spatial) = &metadata.spatial {
                    let ptr = inserter.cast_to_void_ptr(param.into())?;
                    runtime.call(
                        &mut inserter,
                        RuntimeFn::IntrospectMetadata,
                        vec![
                            ptr,
                            spatial.base.clone(),
                            spatial.bound.clone(),
                            slot_operand(slot),
                        ],
                    )?;
                }
            }
            metadata
        };

        ctx.associate(func, param, metadata)?;
    }

    Ok(())
}
