//! Metadata of constants and the seeding of global variables.
//!
//! Constants never enter the [`MetadataStore`](crate::instrument::MetadataStore). Their
//! metadata is a pure function of the constant and is recomputed by [`fold_constant`] on
//! every query:
//!
//! | constant                            | base       | bound              | key | lock   |
//! |-------------------------------------|------------|--------------------|-----|--------|
//! | `null`, `undef`, `zeroinitializer`  | null       | null               | 0   | null   |
//! | `inttoptr`                          | null       | null               | 0   | null   |
//! | defined global `@g`                 | `@g`       | `@g + sizeof(*@g)` | 1   | global |
//! | external global, function           | null       | max address        | 1   | global |
//! | `getelementptr`/`bitcast` of `c`    | as for `c` | as for `c`         |     |        |
//!
//! Pointers *stored inside* global initializers are a different matter: loads read their
//! metadata from the runtime's table, so the table must be filled before the program runs.
//! [`seed_globals`] emits a module constructor that writes one entry per pointer field.

use crate::{
    instrument::{
        metadata::{key_constant, PointerMetadata},
        pass::ModuleInfo,
        runtime::{RuntimeDecls, RuntimeFn, GLOBAL_INIT},
        InstrumentConfig,
    },
    ir::{
        BlockId, ConstExpr, Constant, FunctionFlags, FunctionType, InsertPoint, Inserter, Module,
        Operand, PointerWidth, Type,
    },
    Error, Result,
};

/// Which lock a folded constant refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstLock {
    /// The null lock of null pointers
    Null,
    /// The lock shared by all globals and functions
    Global,
}

/// Metadata of a constant pointer, before it is turned into operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedMetadata {
    /// Base address, an `i8*` constant
    pub base: Constant,
    /// Bound address, an `i8*` constant
    pub bound: Constant,
    /// Key
    pub key: i64,
    /// Lock
    pub lock: ConstLock,
}

impl FoldedMetadata {
    /// Metadata of the null pointer.
    #[must_use]
    pub fn null() -> Self {
        FoldedMetadata {
            base: Constant::null_void_ptr(),
            bound: Constant::null_void_ptr(),
            key: 0,
            lock: ConstLock::Null,
        }
    }

    /// Metadata permitting every access: `[null, max address)`, valid forever.
    #[must_use]
    pub fn unbounded(width: PointerWidth) -> Self {
        FoldedMetadata {
            base: Constant::null_void_ptr(),
            bound: infinite_bound(width),
            key: 1,
            lock: ConstLock::Global,
        }
    }

    /// Returns `true` if the lock is the global lock.
    #[must_use]
    pub fn needs_global_lock(&self) -> bool {
        self.lock == ConstLock::Global
    }

    /// Converts to operands. `global_lock` is used if the lock is [`ConstLock::Global`].
    #[must_use]
    pub fn materialize(
        &self,
        width: PointerWidth,
        spatial: bool,
        temporal: bool,
        global_lock: Operand,
    ) -> PointerMetadata {
        let mut metadata = PointerMetadata::null(width, spatial, temporal);
        if let Some(s) = metadata.spatial.as_mut() {
            s.base = self.base.clone().into();
            s.bound = self.bound.clone().into();
        }
        if let Some(t) = metadata.temporal.as_mut() {
            t.key = key_constant(width, self.key).into();
            t.lock = match self.lock {
                ConstLock::Null => Constant::null_void_ptr().into(),
                ConstLock::Global => global_lock,
            };
        }
        metadata
    }
}

/// The "+infinity" bound: the largest address as `i8*`.
#[must_use]
pub fn infinite_bound(width: PointerWidth) -> Constant {
    // all ones, sign-extended
    Constant::int_to_ptr(Constant::int(width.bits(), -1), Type::void_ptr())
}

fn void_ptr(constant: Constant) -> Constant {
    if constant.ty().is_void_ptr() {
        constant
    } else {
        Constant::bitcast(constant, Type::void_ptr())
    }
}

/// Computes the metadata of a pointer constant.
///
/// # Errors
///
/// Returns [`Error::Invariant`] if the constant is not a pointer, and
/// [`Error::UnknownGlobal`] for a dangling global reference.
pub fn fold_constant(constant: &Constant, module: &ModuleInfo) -> Result<FoldedMetadata> {
    let width = module.pointer_width();

    match constant {
        Constant::Null(ty) | Constant::Undef(ty) | Constant::Zero(ty) if ty.is_pointer() => {
            Ok(FoldedMetadata::null())
        }
        Constant::Global { id, ty } => {
            if module.global(*id)?.external {
                return Ok(FoldedMetadata::unbounded(width));
            }
            let one_past = Constant::gep(
                constant.clone(),
                vec![Constant::int(width.bits(), 1)],
                ty.clone(),
            );
            Ok(FoldedMetadata {
                base: void_ptr(constant.clone()),
                bound: void_ptr(one_past),
                key: 1,
                lock: ConstLock::Global,
            })
        }
        Constant::Function { .. } => Ok(FoldedMetadata::unbounded(width)),
        Constant::Expr(expr) => match expr.as_ref() {
            ConstExpr::GetElementPtr { base, .. } => fold_constant(base, module),
            ConstExpr::BitCast { value, .. } => fold_constant(value, module),
            ConstExpr::IntToPtr { .. } => Ok(FoldedMetadata::null()),
            ConstExpr::PtrToInt { .. } => Err(invariant_error!(
                "metadata requested for non-pointer constant {}",
                constant
            )),
        },
        _ => Err(invariant_error!(
            "metadata requested for non-pointer constant {}",
            constant
        )),
    }
}

/// A pointer stored inside a global initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerField {
    /// Address of the field, as an `i8*` constant
    pub address: Constant,
    /// The pointer constant stored there
    pub value: Constant,
}

/// Lists the pointer fields of every initialized global, in declaration order.
///
/// Aggregates are walked element by element, but only into members whose type contains a
/// pointer; globals without any pointer in their type are skipped entirely. `zeroinitializer`
/// and `undef` parts are skipped as a whole, since the runtime's metadata table starts out
/// null.
///
/// # Errors
///
/// Returns [`Error::InvalidIr`] if an initializer does not match its global's type.
pub fn pointer_fields(module: &Module) -> Result<Vec<PointerField>> {
    let mut fields = Vec::new();

    for global in module.globals() {
        let Some(init) = global.initializer() else {
            continue;
        };
        if !global.value_type().contains_pointer() {
            continue;
        }

        let mut path = vec![Constant::i32(0)];
        collect_fields(
            &global.address(),
            global.value_type(),
            init,
            &mut path,
            &mut fields,
        )?;
    }

    Ok(fields)
}

fn collect_fields(
    global: &Constant,
    ty: &Type,
    value: &Constant,
    path: &mut Vec<Constant>,
    out: &mut Vec<PointerField>,
) -> Result<()> {
    if matches!(value, Constant::Zero(_) | Constant::Undef(_)) {
        return Ok(());
    }
    match ty {
        Type::Ptr(_) => {
            let address = if path.len() == 1 {
                global.clone()
            } else {
                Constant::gep(global.clone(), path.clone(), Type::ptr(ty.clone()))
            };
            out.push(PointerField {
                address: void_ptr(address),
                value: value.clone(),
            });
            Ok(())
        }
        Type::Array(elem, len) => {
            if !elem.contains_pointer() {
                return Ok(());
            }
            for index in 0..*len {
                let element = element_of(value, index)?;
                path.push(Constant::i32(index_constant(index)?));
                collect_fields(global, elem, &element, path, out)?;
                path.pop();
            }
            Ok(())
        }
        Type::Struct(members) => {
            for (index, member) in members.iter().enumerate() {
                if !member.contains_pointer() {
                    continue;
                }
                let index = index as u64;
                let element = element_of(value, index)?;
                path.push(Constant::i32(index_constant(index)?));
                collect_fields(global, member, &element, path, out)?;
                path.pop();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn element_of(value: &Constant, index: u64) -> Result<Constant> {
    value.element(index).ok_or_else(|| {
        Error::InvalidIr(format!("initializer {value} has no element {index}"))
    })
}

fn index_constant(index: u64) -> Result<i64> {
    i64::try_from(index)
        .map_err(|_| Error::InvalidIr(format!("aggregate index {index} is out of range")))
}

/// Emits the module constructor that writes the metadata of every pointer stored in a global
/// initializer. Returns the number of fields seeded; no constructor is created for zero.
///
/// # Errors
///
/// Returns [`Error::InvalidIr`] for malformed initializers or if the constructor already
/// exists.
pub fn seed_globals(
    module: &mut Module,
    runtime: &RuntimeDecls,
    config: &InstrumentConfig,
) -> Result<usize> {
    let fields = pointer_fields(module)?;
    if fields.is_empty() {
        return Ok(0);
    }

    let info = ModuleInfo::capture(module);
    let width = info.pointer_width();

    let id = module.define_function(GLOBAL_INIT, FunctionType::new(Type::Void, vec![]), |f| {
        f.block(0, |b| b.ret(None));
    })?;
    module.add_constructor(id)?;

    let func = module.function_mut(id)?;
    func.add_flags(FunctionFlags::SYNTHETIC | FunctionFlags::CONSTRUCTOR);

    let mut inserter = Inserter::new(func, InsertPoint::BeforeTerminator(BlockId::new(0)))?;
    let lock: Operand = if config.temporal_safety {
        runtime
            .call(&mut inserter, RuntimeFn::GetGlobalLock, vec![])?
            .into()
    } else {
        Constant::null_void_ptr().into()
    };

    for field in &fields {
        let folded = fold_constant(&field.value, &info)?;
        let metadata = folded.materialize(
            width,
            config.spatial_safety,
            config.temporal_safety,
            lock.clone(),
        );
        runtime.call(
            &mut inserter,
            RuntimeFn::MetadataStore,
            vec![
                field.address.clone().into(),
                metadata.base_or_null(),
                metadata.bound_or_null(),
                metadata.key_or_zero(width),
                metadata.lock_or_null(),
            ],
        )?;
        tracing::trace!(address = %field.address, value = %field.value, "seeded global field");
    }

    tracing::debug!(fields = fields.len(), "seeded global metadata");
    Ok(fields.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;

    fn module() -> Module {
        Module::new("m", PointerWidth::Bits64)
    }

    #[test]
    fn test_fold_null_like() {
        let module = module();
        let info = ModuleInfo::capture(&module);
        let int_ptr = Type::ptr(Type::i32());

        for constant in [
            Constant::Null(int_ptr.clone()),
            Constant::Undef(int_ptr.clone()),
            Constant::Zero(int_ptr.clone()),
            Constant::int_to_ptr(Constant::i64(4096), int_ptr),
        ] {
            assert_eq!(fold_constant(&constant, &info).unwrap(), FoldedMetadata::null());
        }

        assert!(matches!(
            fold_constant(&Constant::i32(3), &info),
            Err(Error::Invariant { .. })
        ));
    }

    #[test]
    fn test_fold_globals() {
        let mut module = module();
        let arr = Type::array(Type::i8(), 10);
        let defined = module.add_global("buf", arr.clone(), Some(Constant::Zero(arr.clone())));
        let external = module.add_global("errno_loc", Type::i32(), None);
        let info = ModuleInfo::capture(&module);

        let address = module.global_ref(defined).unwrap();
        let folded = fold_constant(&address, &info).unwrap();
        assert_eq!(folded.base, Constant::bitcast(address.clone(), Type::void_ptr()));
        assert_eq!(folded.key, 1);
        assert!(folded.needs_global_lock());
        assert_eq!(
            folded.bound,
            Constant::bitcast(
                Constant::gep(address.clone(), vec![Constant::i64(1)], Type::ptr(arr.clone())),
                Type::void_ptr()
            )
        );

        // derived constants fold to their base object
        let fifth = Constant::gep(
            address,
            vec![Constant::i64(0), Constant::i64(5)],
            Type::ptr(Type::i8()),
        );
        assert_eq!(fold_constant(&fifth, &info).unwrap(), folded);

        let ext = fold_constant(&module.global_ref(external).unwrap(), &info).unwrap();
        assert_eq!(ext, FoldedMetadata::unbounded(PointerWidth::Bits64));
        assert_eq!(ext.bound, infinite_bound(PointerWidth::Bits64));
    }

    #[test]
    fn test_fold_function() {
        let mut module = module();
        let id = module
            .declare_function("ext", FunctionType::new(Type::Void, vec![]))
            .unwrap();
        let info = ModuleInfo::capture(&module);
        let folded = fold_constant(&module.function_ref(id).unwrap(), &info).unwrap();
        assert_eq!(folded.base, Constant::null_void_ptr());
        assert_eq!(folded.key, 1);
    }

    #[test]
    fn test_materialize_respects_safety_kinds() {
        let folded = FoldedMetadata::unbounded(PointerWidth::Bits32);
        let lock = Operand::Const(Constant::Undef(Type::void_ptr()));

        let both = folded.materialize(PointerWidth::Bits32, true, true, lock.clone());
        assert_eq!(both.key_or_zero(PointerWidth::Bits32), Constant::i32(1).into());
        assert_eq!(both.lock_or_null(), lock);

        let spatial = folded.materialize(PointerWidth::Bits32, true, false, lock);
        assert!(spatial.temporal.is_none());
        assert_eq!(spatial.bound_or_null(), infinite_bound(PointerWidth::Bits32).into());
    }

    #[test]
    fn test_pointer_fields_skip_pointer_free() {
        let mut module = module();
        let ints = Type::array(Type::i32(), 100);
        module.add_global("table", ints.clone(), Some(Constant::Zero(ints)));
        assert!(pointer_fields(&module).unwrap().is_empty());
    }

    #[test]
    fn test_pointer_fields_nested() {
        let mut module = module();
        let target = module.add_global("x", Type::i32(), Some(Constant::i32(7)));
        let x = module.global_ref(target).unwrap();

        // struct { i32, i32* } pairs[2] = { {1, &x}, {2, null} }
        let pair = Type::Struct(vec![Type::i32(), Type::ptr(Type::i32())]);
        let pairs = Type::array(pair.clone(), 2);
        let init = Constant::Aggregate {
            ty: pairs.clone(),
            elements: vec![
                Constant::Aggregate {
                    ty: pair.clone(),
                    elements: vec![Constant::i32(1), x.clone()],
                },
                Constant::Aggregate {
                    ty: pair,
                    elements: vec![Constant::i32(2), Constant::Null(Type::ptr(Type::i32()))],
                },
            ],
        };
        let table = module.add_global("pairs", pairs.clone(), Some(init));

        let fields = pointer_fields(&module).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value, x);
        assert_eq!(
            fields[1].address,
            Constant::bitcast(
                Constant::gep(
                    module.global_ref(table).unwrap(),
                    vec![Constant::i32(0), Constant::i32(1), Constant::i32(1)],
                    Type::ptr(Type::ptr(Type::i32())),
                ),
                Type::void_ptr()
            )
        );
        assert!(matches!(fields[1].value, Constant::Null(_)));
    }

    #[test]
    fn test_seed_globals_emits_constructor() {
        let mut module = module();
        let x = module.add_global("x", Type::i32(), Some(Constant::i32(0)));
        let xref = module.global_ref(x).unwrap();
        module.add_global("px", Type::ptr(Type::i32()), Some(xref));
        let int_ptr = Type::ptr(Type::i32());
        module.add_global("pz", int_ptr.clone(), Some(Constant::Zero(int_ptr)));
        let runtime = RuntimeDecls::declare(&mut module).unwrap();

        let seeded = seed_globals(&mut module, &runtime, &InstrumentConfig::default()).unwrap();
        // the zero-initialized pointer needs no write
        assert_eq!(seeded, 1);

        let ctor = module.function_by_name(GLOBAL_INIT).unwrap();
        assert_eq!(module.constructors(), &[ctor]);
        let func = module.function(ctor).unwrap();
        assert!(func.flags().contains(FunctionFlags::SYNTHETIC | FunctionFlags::CONSTRUCTOR));

        let stores = func
            .instructions()
            .filter(|(_, inst)| match &inst.kind {
                InstKind::Call { callee, .. } => {
                    crate::instrument::pass::direct_callee(callee)
                        == Some(runtime.id(RuntimeFn::MetadataStore))
                }
                _ => false,
            })
            .count();
        assert_eq!(stores, 1);
        assert!(crate::ir::verify_function(func).is_ok());
    }

    #[test]
    fn test_zero_initialized_tables_are_not_walked() {
        let mut module = module();
        let x = module.add_global("x", Type::i32(), Some(Constant::i32(0)));
        let xref = module.global_ref(x).unwrap();
        let int_ptr = Type::ptr(Type::i32());

        // static int *big[1 << 20];
        let big = Type::array(int_ptr.clone(), 1 << 20);
        module.add_global("big", big.clone(), Some(Constant::Zero(big)));

        // struct { int *a; int *b[4]; } s = { &x, undef };
        let inner = Type::array(int_ptr.clone(), 4);
        let pair = Type::Struct(vec![int_ptr, inner.clone()]);
        let init = Constant::Aggregate {
            ty: pair.clone(),
            elements: vec![xref.clone(), Constant::Undef(inner)],
        };
        module.add_global("s", pair, Some(init));

        let fields = pointer_fields(&module).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].value, xref);
    }

    #[test]
    fn test_seed_nothing() {
        let mut module = module();
        module.add_global("n", Type::i64(), Some(Constant::i64(1)));
        let runtime = RuntimeDecls::declare(&mut module).unwrap();
        assert_eq!(
            seed_globals(&mut module, &runtime, &InstrumentConfig::default()).unwrap(),
            0
        );
        assert!(module.function_by_name(GLOBAL_INIT).is_none());
    }
}
