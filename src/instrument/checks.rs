//! Dereference check insertion and redundant check elimination.
//!
//! Runs after propagation, when every reachable pointer has metadata. Blocks are visited in
//! breadth-first order from the entry, so a block is always processed after the blocks that
//! dominate it; unreachable blocks follow in layout order.
//!
//! # Spatial checks
//!
//! Every load and store gets `spatial_{load,store}_dereference_check(base, bound, ptr, size)`
//! unless the address is a chain of constant-index GEPs and bitcasts rooted at a fixed-size
//! stack allocation or a defined global, and the accessed bytes provably lie inside it.
//!
//! # Temporal checks
//!
//! A temporal check on a pointer is redundant when another check already vouched for the same
//! allocation and nothing could have freed it since. Pointers are compared by their *ultimate
//! source*: the value left after peeling GEPs and bitcasts. Derived pointers share the metadata
//! of their source, so one check covers all of them. Elimination happens in three tiers:
//!
//! 1. **Trivial**: the source is a stack allocation or a global, which cannot be freed while
//!    the function runs.
//! 2. **Block**: a later access in the same block as an emitted check, with no call in
//!    between.
//! 3. **Function**: an access in a block strictly dominated by an emitted check, where no path
//!    from the check reaches the access through a call.
//!
//! When [`InstrumentConfig::opaque_calls`](crate::instrument::InstrumentConfig) is off, calls
//! do not end the scans.

use std::collections::HashMap;

use crate::{
    instrument::{
        gather::bfs_blocks,
        pass::{FunctionPass, ModuleInfo, PassContext},
        runtime::{is_memory_copy, RuntimeFn},
    },
    ir::{
        BlockId, ConstExpr, Constant, Function, InsertPoint, Inserter, InstKind, Operand, Type,
        ValueId,
    },
    utils::graph::{algorithms::bfs, NodeId},
    Result,
};

/// Why a temporal check was elided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EliminationTier {
    /// The pointer derives from a stack allocation or a global
    Trivial,
    /// An earlier check in the same block covers it
    Block,
    /// A dominating check in another block covers it
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Load,
    Store,
}

/// Inserts spatial and temporal dereference checks, indirect call checks and metadata copies.
#[derive(Debug, Default)]
pub struct CheckInsertionPass {
    covered: HashMap<ValueId, EliminationTier>,
}

impl CheckInsertionPass {
    /// Creates the pass.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn visit(&mut self, func: &mut Function, ctx: &mut PassContext<'_>, value: ValueId) -> Result<()> {
        let Some(kind) = func.instruction(value).map(|i| i.kind.clone()) else {
            return Ok(());
        };

        match kind {
            InstKind::Load { ptr } => {
                let ty = func.value_type(value).cloned().unwrap_or(Type::Void);
                self.check_access(func, ctx, value, &ptr, &ty, Access::Load)
            }
            InstKind::Store { value: stored, ptr } => {
                let ty = func.operand_type(&stored)?;
                self.check_access(func, ctx, value, &ptr, &ty, Access::Store)
            }
            InstKind::Call { callee, args, .. } => {
                check_call_target(func, ctx, value, &callee)?;
                copy_metadata(func, ctx, value, &callee, &args)
            }
            _ => Ok(()),
        }
    }

    fn check_access(
        &mut self,
        func: &mut Function,
        ctx: &mut PassContext<'_>,
        access: ValueId,
        ptr: &Operand,
        ty: &Type,
        kind: Access,
    ) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let config = ctx.config;
        let spatial_wanted = config.spatial_safety
            && match kind {
                Access::Load => config.load_checks,
                Access::Store => config.store_checks,
            };
        let temporal_wanted = config.temporal_safety
            && match kind {
                Access::Load => config.temporal_load_checks,
                Access::Store => config.temporal_store_checks,
            };
        if !spatial_wanted && !temporal_wanted {
            return Ok(());
        }
        let size = ctx.module.layout().size_of(ty);

        let emit_spatial = spatial_wanted
            && !(config.eliminate_constant_index_spatial
                && proven_in_bounds(func, ctx.module, ptr, size));
        if spatial_wanted && !emit_spatial {
            ctx.report.spatial_eliminated_constant_index += 1;
            tracing::trace!(access = %access, "spatial check proven in bounds");
        }

        let source = ultimate_source(func, ptr);
        let emit_temporal = temporal_wanted && !self.elide_temporal(func, ctx, access, &source);

        if !emit_spatial && !emit_temporal {
            return Ok(());
        }

        let metadata = ctx.resolve(func, ptr)?;
        let width = ctx.pointer_width();
        let runtime = ctx.runtime;
        {
            let mut inserter = Inserter::new(func, InsertPoint::Before(access))?;
            if emit_spatial {
                let raw = inserter.cast_to_void_ptr(ptr.clone())?;
                let size = i64::try_from(size)
                    .map_err(|_| invariant_error!("access of {} bytes", size))?;
                let routine = match kind {
                    Access::Load => RuntimeFn::SpatialLoadDereferenceCheck,
                    Access::Store => RuntimeFn::SpatialStoreDereferenceCheck,
                };
                runtime.call(
                    &mut inserter,
                    routine,
                    vec![
                        metadata.base_or_null(),
                        metadata.bound_or_null(),
                        raw,
                        Constant::int(width.bits(), size).into(),
                    ],
                )?;
            }
            if emit_temporal {
                let routine = match kind {
                    Access::Load => RuntimeFn::TemporalLoadDereferenceCheck,
                    Access::Store => RuntimeFn::TemporalStoreDereferenceCheck,
                };
                runtime.call(
                    &mut inserter,
                    routine,
                    vec![
                        metadata.lock_or_null(),
                        metadata.key_or_zero(width),
                        metadata.base_or_null(),
                        metadata.bound_or_null(),
                    ],
                )?;
            }
        }

        if emit_spatial {
            ctx.report.spatial_checks += 1;
        }
        if emit_temporal {
            ctx.report.temporal_checks += 1;
            if config.eliminate_bb_temporal {
                self.cover_block(func, ctx, access, &source);
            }
            if config.eliminate_function_temporal {
                self.cover_dominated(func, ctx, access, &source);
            }
        }
        Ok(())
    }

    /// Decides whether the temporal check of `access` can be skipped, and counts it if so.
    fn elide_temporal(
        &self,
        func: &Function,
        ctx: &mut PassContext<'_>,
        access: ValueId,
        source: &Operand,
    ) -> bool {
        let tier = self.covered.get(&access).copied().or_else(|| {
            is_trivially_live(func, ctx, source).then_some(EliminationTier::Trivial)
        });
        let Some(tier) = tier else {
            return false;
        };

        match tier {
            EliminationTier::Trivial => ctx.report.temporal_eliminated_trivial += 1,
            EliminationTier::Block => ctx.report.temporal_eliminated_block += 1,
            EliminationTier::Function => ctx.report.temporal_eliminated_function += 1,
        }
        tracing::trace!(access = %access, ?tier, "temporal check elided");
        true
    }

    /// Marks later accesses to `source` in the block of `check` as covered, up to the first
    /// call.
    fn cover_block(
        &mut self,
        func: &Function,
        ctx: &PassContext<'_>,
        check: ValueId,
        source: &Operand,
    ) {
        let Some(block) = func.instruction(check).map(|i| i.block) else {
            return;
        };
        let originals = func.original_instructions(block);
        let Some(start) = originals.iter().position(|v| *v == check) else {
            return;
        };

        for &next in &originals[start + 1..] {
            let Some(kind) = func.instruction(next).map(|i| &i.kind) else {
                continue;
            };
            if kind.is_call() && ctx.config.opaque_calls {
                break;
            }
            if accesses_source(func, kind, source) {
                self.covered.entry(next).or_insert(EliminationTier::Block);
            }
        }
    }

    /// Marks accesses to `source` in blocks strictly dominated by the block of `check` as
    /// covered, when no path from the check to them passes a call.
    fn cover_dominated(
        &mut self,
        func: &Function,
        ctx: &PassContext<'_>,
        check: ValueId,
        source: &Operand,
    ) {
        let Some(origin) = func.instruction(check).map(|i| i.block) else {
            return;
        };
        let origin_node = NodeId::from(origin);
        let region: Vec<BlockId> = bfs(func, origin_node)
            .filter(|n| ctx.dominators.strictly_dominates(origin_node, *n))
            .map(BlockId::from)
            .collect();
        if region.is_empty() {
            return;
        }

        let opaque = ctx.config.opaque_calls;
        let origin_dirty = opaque && {
            let originals = func.original_instructions(origin);
            originals
                .iter()
                .skip_while(|v| **v != check)
                .skip(1)
                .any(|v| is_call(func, *v))
        };
        let mut dirty_entry: HashMap<BlockId, bool> = region.iter().map(|b| (*b, false)).collect();
        let mut dirty_exit = dirty_entry.clone();

        // dirtiness only grows, so this terminates
        let mut changed = true;
        while changed {
            changed = false;
            for &block in &region {
                let entry = func.block_predecessors(block).iter().any(|pred| {
                    if *pred == origin {
                        origin_dirty
                    } else {
                        dirty_exit
                            .get(pred)
                            .copied()
                            .unwrap_or_else(|| ctx.is_reachable(*pred))
                    }
                });
                let exit = entry
                    || (opaque
                        && func
                            .original_instructions(block)
                            .iter()
                            .any(|v| is_call(func, *v)));

                let entry_changed = dirty_entry.insert(block, entry) != Some(entry);
                let exit_changed = dirty_exit.insert(block, exit) != Some(exit);
                changed |= entry_changed || exit_changed;
            }
        }

        for &block in &region {
            if dirty_entry.get(&block).copied().unwrap_or(true) {
                continue;
            }
            for next in func.original_instructions(block) {
                let Some(kind) = func.instruction(next).map(|i| &i.kind) else {
                    continue;
                };
                if kind.is_call() && opaque {
                    break;
                }
                if accesses_source(func, kind, source) {
                    self.covered.entry(next).or_insert(EliminationTier::Function);
                }
            }
        }
    }
}

impl FunctionPass for CheckInsertionPass {
    fn name(&self) -> &'static str {
        "check-insertion"
    }

    fn run_on_function(&mut self, func: &mut Function, ctx: &mut PassContext<'_>) -> Result<bool> {
        self.covered.clear();
        let checks_before = ctx.report.total_checks();

        for block in check_order(func) {
            for value in func.original_instructions(block) {
                self.visit(func, ctx, value)?;
            }
        }

        Ok(ctx.report.total_checks() != checks_before || ctx.report.metadata_copies > 0)
    }

    fn description(&self) -> &'static str {
        "Inserts dereference checks and elides redundant temporal checks"
    }
}

/// Reachable blocks in breadth-first order, then unreachable blocks in layout order.
fn check_order(func: &Function) -> Vec<BlockId> {
    let mut order = bfs_blocks(func);
    let mut seen = vec![false; func.blocks().len()];
    for block in &order {
        seen[block.index()] = true;
    }
    for block in func.blocks() {
        if !seen[block.id().index()] {
            order.push(block.id());
        }
    }
    order
}

fn is_call(func: &Function, value: ValueId) -> bool {
    func.instruction(value).is_some_and(|i| i.kind.is_call())
}

fn accesses_source(func: &Function, kind: &InstKind, source: &Operand) -> bool {
    kind.accessed_pointer()
        .is_some_and(|ptr| !ptr.is_null() && ultimate_source(func, ptr) == *source)
}

fn is_trivially_live(func: &Function, ctx: &PassContext<'_>, source: &Operand) -> bool {
    match source {
        Operand::Value(value) => {
            ctx.config.eliminate_stack_temporal
                && matches!(
                    func.instruction(*value).map(|i| &i.kind),
                    Some(InstKind::Alloca { .. })
                )
        }
        Operand::Const(Constant::Global { .. }) => ctx.config.eliminate_global_temporal,
        Operand::Const(_) => false,
    }
}

/// The operand left after peeling GEPs and bitcasts, instructions and constant expressions
/// alike.
#[must_use]
pub fn ultimate_source(func: &Function, ptr: &Operand) -> Operand {
    let mut current = ptr.clone();
    loop {
        let next = match &current {
            Operand::Value(value) => match func.instruction(*value).map(|i| &i.kind) {
                Some(InstKind::GetElementPtr { base, .. }) => Some(base.clone()),
                Some(InstKind::BitCast { value }) => Some(value.clone()),
                _ => None,
            },
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::GetElementPtr { base, .. } => Some(Operand::Const(base.clone())),
                ConstExpr::BitCast { value, .. } => Some(Operand::Const(value.clone())),
                _ => None,
            },
            Operand::Const(_) => None,
        };
        match next {
            Some(next) => current = next,
            None => return current,
        }
    }
}

/// Returns `true` if an access of `size` bytes through `ptr` provably stays inside a
/// fixed-size stack allocation or defined global.
#[must_use]
pub fn proven_in_bounds(func: &Function, module: &ModuleInfo, ptr: &Operand, size: u64) -> bool {
    constant_extent(func, module, ptr).is_some_and(|(object, offset)| {
        u64::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(size))
            .is_some_and(|end| end <= object)
    })
}

/// Size of the object `ptr` points into and the constant offset of `ptr` from its start.
fn constant_extent(func: &Function, module: &ModuleInfo, ptr: &Operand) -> Option<(u64, i64)> {
    let layout = module.layout();
    let mut offset = 0i64;
    let mut current = ptr.clone();

    loop {
        let (next, delta) = match &current {
            Operand::Value(value) => match &func.instruction(*value)?.kind {
                InstKind::GetElementPtr { base, indices } => {
                    let indices: Vec<i64> = indices
                        .iter()
                        .map(|i| i.as_const().and_then(Constant::as_int))
                        .collect::<Option<_>>()?;
                    let base_ty = func.operand_type(base).ok()?;
                    let delta = layout.gep_offset(base_ty.pointee()?, &indices)?;
                    (base.clone(), delta)
                }
                InstKind::BitCast { value } => (value.clone(), 0),
                InstKind::Alloca { allocated, count } => {
                    let count = match count {
                        None => 1,
                        Some(count) => u64::try_from(count.as_const()?.as_int()?).ok()?,
                    };
                    return Some((layout.size_of(allocated).checked_mul(count)?, offset));
                }
                _ => return None,
            },
            Operand::Const(Constant::Global { id, .. }) => {
                let global = module.global(*id).ok()?;
                if global.external {
                    return None;
                }
                return Some((layout.size_of(&global.value_type), offset));
            }
            Operand::Const(Constant::Expr(expr)) => match expr.as_ref() {
                ConstExpr::GetElementPtr { base, indices, .. } => {
                    let indices: Vec<i64> = indices
                        .iter()
                        .map(Constant::as_int)
                        .collect::<Option<_>>()?;
                    let base_ty = base.ty();
                    let delta = layout.gep_offset(base_ty.pointee()?, &indices)?;
                    (Operand::Const(base.clone()), delta)
                }
                ConstExpr::BitCast { value, .. } => (Operand::Const(value.clone()), 0),
                _ => return None,
            },
            Operand::Const(_) => return None,
        };
        offset = offset.checked_add(delta)?;
        current = next;
    }
}

/// Checks the target of an indirect call against its metadata.
fn check_call_target(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    call: ValueId,
    callee: &Operand,
) -> Result<()> {
    if !(ctx.config.call_checks && ctx.config.spatial_safety) || callee.as_value().is_none() {
        return Ok(());
    }
    let metadata = ctx.resolve(func, callee)?;
    let runtime = ctx.runtime;

    let mut inserter = Inserter::new(func, InsertPoint::Before(call))?;
    let target = inserter.cast_to_void_ptr(callee.clone())?;
    runtime.call(
        &mut inserter,
        RuntimeFn::SpatialCallDereferenceCheck,
        vec![metadata.base_or_null(), metadata.bound_or_null(), target],
    )?;
    ctx.report.call_checks += 1;
    Ok(())
}

/// Copies the metadata of the copied range after `memcpy`-like calls.
fn copy_metadata(
    func: &mut Function,
    ctx: &mut PassContext<'_>,
    call: ValueId,
    callee: &Operand,
    args: &[Operand],
) -> Result<()> {
    if !ctx.config.memcpy_metadata || !ctx.module.callee_name(callee).is_some_and(is_memory_copy) {
        return Ok(());
    }
    let [dst, src, size, ..] = args else {
        return Ok(());
    };
    if !func.operand_type(dst)?.is_pointer() || !func.operand_type(src)?.is_pointer() {
        return Ok(());
    }
    let runtime = ctx.runtime;

    let mut inserter = Inserter::new(func, InsertPoint::After(call))?;
    let dst = inserter.cast_to_void_ptr(dst.clone())?;
    let src = inserter.cast_to_void_ptr(src.clone())?;
    runtime.call(
        &mut inserter,
        RuntimeFn::CopyMetadata,
        vec![dst, src, size.clone()],
    )?;
    ctx.report.metadata_copies += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instrument::{
            gather::{CoverageAudit, GatherPass},
            test_support::Harness,
            InstrumentConfig,
        },
        ir::{FunctionType, Module, PointerWidth},
    };

    fn pipeline() -> Vec<Box<dyn FunctionPass>> {
        vec![
            Box::new(GatherPass::first()),
            Box::new(GatherPass::second()),
            Box::new(CoverageAudit),
            Box::new(CheckInsertionPass::new()),
        ]
    }

    /// `a[i] = 0; a[i + 1] = 0;` on a parameter.
    fn adjacent_stores(module: &mut Module) {
        let int_ptr = Type::ptr(Type::i32());
        let sig = FunctionType::new(Type::Void, vec![int_ptr, Type::i64()]);
        module
            .define_function("adjacent", sig, |f| {
                let (a, i) = (f.arg(0), f.arg(1));
                f.block(0, |b| {
                    let first = b.gep(a, [i]);
                    b.store(Constant::i32(0), first);
                    let j = b.add(i, Constant::i64(1));
                    let second = b.gep(a, [j]);
                    b.store(Constant::i32(0), second);
                    b.ret(None)
                });
            })
            .unwrap();
    }

    #[test]
    fn test_block_elimination() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        adjacent_stores(&mut module);
        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("adjacent", pipeline()).unwrap();

        assert_eq!(report.spatial_checks, 2);
        assert_eq!(report.temporal_checks, 1);
        assert_eq!(report.temporal_eliminated_block, 1);
    }

    #[test]
    fn test_no_elimination_checks_everything() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        adjacent_stores(&mut module);
        let mut harness = Harness::new(module, InstrumentConfig::no_elimination());
        let report = harness.run("adjacent", pipeline()).unwrap();

        assert_eq!(report.spatial_checks, 2);
        assert_eq!(report.temporal_checks, 2);
        assert_eq!(report.temporal_eliminated(), 0);
        assert_eq!(
            harness
                .calls_to("adjacent", RuntimeFn::TemporalStoreDereferenceCheck)
                .len(),
            2
        );
    }

    #[test]
    fn test_call_ends_block_elimination() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let opaque = module
            .declare_function("opaque", FunctionType::new(Type::Void, vec![]))
            .unwrap();
        let int_ptr = Type::ptr(Type::i32());
        module
            .define_function("f", FunctionType::new(Type::Void, vec![int_ptr]), |f| {
                let p = f.arg(0);
                f.block(0, |b| {
                    b.store(Constant::i32(0), p);
                    b.call(opaque, vec![]);
                    b.store(Constant::i32(1), p);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module.clone(), InstrumentConfig::default());
        let report = harness.run("f", pipeline()).unwrap();
        assert_eq!(report.temporal_checks, 2);

        let transparent = InstrumentConfig::default().with_opaque_calls(false);
        let mut harness = Harness::new(module, transparent);
        let report = harness.run("f", pipeline()).unwrap();
        assert_eq!(report.temporal_checks, 1);
        assert_eq!(report.temporal_eliminated_block, 1);
    }

    #[test]
    fn test_dominator_elimination() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let int_ptr = Type::ptr(Type::i32());
        let sig = FunctionType::new(Type::Void, vec![int_ptr, Type::i1()]);
        module
            .define_function("f", sig, |f| {
                let (p, c) = (f.arg(0), f.arg(1));
                f.block(0, |b| {
                    b.store(Constant::i32(0), p);
                    b.branch(c, 1, 2)
                });
                f.block(1, |b| {
                    b.store(Constant::i32(1), p);
                    b.jump(2)
                });
                f.block(2, |b| {
                    b.load(p);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("f", pipeline()).unwrap();

        assert_eq!(report.temporal_checks, 1);
        assert_eq!(report.temporal_eliminated_function, 2);
    }

    #[test]
    fn test_call_on_path_blocks_dominator_elimination() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let opaque = module
            .declare_function("opaque", FunctionType::new(Type::Void, vec![]))
            .unwrap();
        let int_ptr = Type::ptr(Type::i32());
        let sig = FunctionType::new(Type::Void, vec![int_ptr, Type::i1()]);
        module
            .define_function("f", sig, |f| {
                let (p, c) = (f.arg(0), f.arg(1));
                f.block(0, |b| {
                    b.store(Constant::i32(0), p);
                    b.branch(c, 1, 2)
                });
                f.block(1, |b| {
                    b.call(opaque, vec![]);
                    b.jump(2)
                });
                f.block(2, |b| {
                    b.load(p);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("f", pipeline()).unwrap();

        // block 2 can be entered through the call in block 1
        assert_eq!(report.temporal_checks, 2);
        assert_eq!(report.temporal_eliminated_function, 0);
    }

    #[test]
    fn test_constant_index_into_stack_array() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        module
            .define_function("f", FunctionType::new(Type::Void, vec![]), |f| {
                f.block(0, |b| {
                    let buf = b.alloca(Type::array(Type::i32(), 4));
                    let inside = b.gep(buf, [Constant::i64(0), Constant::i64(3)]);
                    b.store(Constant::i32(0), inside);
                    let outside = b.gep(buf, [Constant::i64(0), Constant::i64(4)]);
                    b.store(Constant::i32(0), outside);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("f", pipeline()).unwrap();

        assert_eq!(report.spatial_eliminated_constant_index, 1);
        assert_eq!(report.spatial_checks, 1);
        // both stores target the stack
        assert_eq!(report.temporal_eliminated_trivial, 2);
        assert_eq!(report.temporal_checks, 0);
    }

    #[test]
    fn test_indirect_call_check() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let callback = FunctionType::new(Type::Void, vec![]);
        let sig = FunctionType::new(Type::Void, vec![Type::function_ptr(callback)]);
        module
            .define_function("dispatch", sig, |f| {
                let target = f.arg(0);
                f.block(0, |b| {
                    b.call_indirect(target, vec![]);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("dispatch", pipeline()).unwrap();

        assert_eq!(report.call_checks, 1);
        assert_eq!(
            harness
                .calls_to("dispatch", RuntimeFn::SpatialCallDereferenceCheck)
                .len(),
            1
        );
    }

    #[test]
    fn test_memcpy_copies_metadata() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let memcpy = module
            .declare_function(
                "memcpy",
                FunctionType::new(
                    Type::void_ptr(),
                    vec![Type::void_ptr(), Type::void_ptr(), Type::i64()],
                ),
            )
            .unwrap();
        let sig = FunctionType::new(Type::Void, vec![Type::void_ptr(), Type::void_ptr()]);
        module
            .define_function("copy", sig, |f| {
                let (dst, src) = (f.arg(0), f.arg(1));
                f.block(0, |b| {
                    b.call(memcpy, vec![dst.into(), src.into(), Constant::i64(16).into()]);
                    b.ret(None)
                });
            })
            .unwrap();

        let mut harness = Harness::new(module, InstrumentConfig::default());
        let report = harness.run("copy", pipeline()).unwrap();

        assert_eq!(report.metadata_copies, 1);
        let copies = harness.calls_to("copy", RuntimeFn::CopyMetadata);
        assert_eq!(
            harness.call_args("copy", copies[0])[2],
            Operand::Const(Constant::i64(16))
        );
    }

    #[test]
    fn test_ultimate_source_peels_derivations() {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let int_ptr = Type::ptr(Type::i32());
        module
            .define_function("f", FunctionType::new(Type::Void, vec![int_ptr]), |f| {
                let p = f.arg(0);
                f.block(0, |b| {
                    let q = b.gep(p, [Constant::i64(2)]);
                    b.bitcast(q, Type::void_ptr());
                    b.ret(None)
                });
            })
            .unwrap();

        let func = module.function(module.function_by_name("f").unwrap()).unwrap();
        let p = func.params()[0];
        let cast = func.original_instructions(BlockId::new(0))[1];
        assert_eq!(ultimate_source(func, &cast.into()), Operand::Value(p));
    }
}
