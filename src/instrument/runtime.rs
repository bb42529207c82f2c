//! The runtime ABI called by inserted instrumentation.
//!
//! The runtime library itself (metadata tables, shadow stack storage, the lock/key allocator
//! and the check routines) is linked in later; this module only knows the symbols and their
//! signatures. Every routine is declared up front with [`RuntimeDecls::declare`] and carries
//! [`FunctionFlags::RUNTIME`], which keeps the instrumentation from ever treating it as part of
//! the instrumented program.
//!
//! Metadata components travel as `i8*` (base, bound, lock) and as a pointer-sized integer
//! (key). Routines with several results return a struct that the caller takes apart with
//! `extractvalue`.

use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{
    ir::{
        Constant, FuncId, FunctionFlags, FunctionType, Inserter, Module, Operand, PointerWidth,
        Type, ValueId,
    },
    Result,
};

/// Symbol prefix shared by every runtime routine and library wrapper.
pub const RUNTIME_PREFIX: &str = "__softboundcets_";

/// Name given to a defined `main` so the runtime can wrap the entry point.
pub const PSEUDO_MAIN: &str = "softboundcets_pseudo_main";

/// Name of the synthetic module constructor that seeds global metadata.
pub const GLOBAL_INIT: &str = "__softboundcets_global_init";

/// Library routines with metadata-aware wrappers in the runtime.
pub const WRAPPED_LIBRARY_FUNCTIONS: &[&str] = &[
    "malloc", "calloc", "realloc", "free", "strdup", "strndup", "strcpy", "strncpy", "strcat",
    "strncat", "strlen", "strchr", "strrchr", "strstr", "strtok", "memset", "memchr", "fopen",
    "fclose", "fgets", "getenv", "atoi", "puts",
];

/// Field index of the base in the struct returned by `metadata_load`.
pub const LOADED_BASE_FIELD: u32 = 0;

/// Field index of the bound in the struct returned by `metadata_load`.
pub const LOADED_BOUND_FIELD: u32 = 1;

/// Field index of the key in the struct returned by `metadata_load`.
pub const LOADED_KEY_FIELD: u32 = 2;

/// Field index of the lock in the struct returned by `metadata_load`.
pub const LOADED_LOCK_FIELD: u32 = 3;

/// Field index of the lock in the struct returned by `stack_memory_allocation`.
pub const ALLOCATION_LOCK_FIELD: u32 = 0;

/// Field index of the key in the struct returned by `stack_memory_allocation`.
pub const ALLOCATION_KEY_FIELD: u32 = 1;

/// Returns the wrapper symbol for a library routine.
#[must_use]
pub fn wrapper_symbol(name: &str) -> String {
    format!("{RUNTIME_PREFIX}{name}")
}

/// Returns `true` if calls to `name` copy memory and therefore need their metadata copied.
#[must_use]
pub fn is_memory_copy(name: &str) -> bool {
    matches!(name, "memcpy" | "memmove")
        || name.starts_with("llvm.memcpy")
        || name.starts_with("llvm.memmove")
        || name == wrapper_symbol("memcpy")
        || name == wrapper_symbol("memmove")
}

/// Returns `true` for compiler intrinsics.
#[must_use]
pub fn is_intrinsic(name: &str) -> bool {
    name.starts_with("llvm.")
}

/// A routine of the metadata runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeFn {
    /// `(base, bound, ptr, size)`
    SpatialLoadDereferenceCheck,
    /// `(base, bound, ptr, size)`
    SpatialStoreDereferenceCheck,
    /// `(lock, key, base, bound)`
    TemporalLoadDereferenceCheck,
    /// `(lock, key, base, bound)`
    TemporalStoreDereferenceCheck,
    /// `(base, bound, fn_ptr)`
    SpatialCallDereferenceCheck,
    /// `(addr, base, bound, key, lock)`
    MetadataStore,
    /// `(addr) -> {base, bound, key, lock}`
    MetadataLoad,
    /// `(slot_count)`
    AllocateShadowStackSpace,
    /// `()`
    DeallocateShadowStackSpace,
    /// `(slot) -> base`
    LoadBaseShadowStack,
    /// `(slot) -> bound`
    LoadBoundShadowStack,
    /// `(slot) -> key`
    LoadKeyShadowStack,
    /// `(slot) -> lock`
    LoadLockShadowStack,
    /// `(base, slot)`
    StoreBaseShadowStack,
    /// `(bound, slot)`
    StoreBoundShadowStack,
    /// `(key, slot)`
    StoreKeyShadowStack,
    /// `(lock, slot)`
    StoreLockShadowStack,
    /// `() -> {lock, key}`, once per stack frame
    StackMemoryAllocation,
    /// `(key)`
    StackMemoryDeallocation,
    /// `() -> lock`
    GetGlobalLock,
    /// `(dst, src, size)`
    CopyMetadata,
    /// `(ptr, base, bound, arg_no)`
    IntrospectMetadata,
}

impl RuntimeFn {
    /// The routine's name without prefix.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The linker symbol.
    #[must_use]
    pub fn symbol(self) -> String {
        format!("{RUNTIME_PREFIX}{}", self.name())
    }

    /// The routine's signature for the given pointer width.
    #[must_use]
    pub fn signature(self, width: PointerWidth) -> FunctionType {
        let ptr = Type::void_ptr;
        let key = width.key_type();
        let size = width.intptr_type();
        let slot = Type::i32();

        match self {
            RuntimeFn::SpatialLoadDereferenceCheck | RuntimeFn::SpatialStoreDereferenceCheck => {
                FunctionType::new(Type::Void, vec![ptr(), ptr(), ptr(), size])
            }
            RuntimeFn::TemporalLoadDereferenceCheck
            | RuntimeFn::TemporalStoreDereferenceCheck => {
                FunctionType::new(Type::Void, vec![ptr(), key, ptr(), ptr()])
            }
            RuntimeFn::SpatialCallDereferenceCheck => {
                FunctionType::new(Type::Void, vec![ptr(), ptr(), ptr()])
            }
            RuntimeFn::MetadataStore => {
                FunctionType::new(Type::Void, vec![ptr(), ptr(), ptr(), key, ptr()])
            }
            RuntimeFn::MetadataLoad => FunctionType::new(
                Type::Struct(vec![ptr(), ptr(), key, ptr()]),
                vec![ptr()],
            ),
            RuntimeFn::AllocateShadowStackSpace => FunctionType::new(Type::Void, vec![slot]),
            RuntimeFn::DeallocateShadowStackSpace => FunctionType::new(Type::Void, vec![]),
            RuntimeFn::LoadBaseShadowStack
            | RuntimeFn::LoadBoundShadowStack
            | RuntimeFn::LoadLockShadowStack => FunctionType::new(ptr(), vec![slot]),
            RuntimeFn::LoadKeyShadowStack => FunctionType::new(key, vec![slot]),
            RuntimeFn::StoreBaseShadowStack
            | RuntimeFn::StoreBoundShadowStack
            | RuntimeFn::StoreLockShadowStack => {
                FunctionType::new(Type::Void, vec![ptr(), slot])
            }
            RuntimeFn::StoreKeyShadowStack => FunctionType::new(Type::Void, vec![key, slot]),
            RuntimeFn::StackMemoryAllocation => {
                FunctionType::new(Type::Struct(vec![ptr(), key]), vec![])
            }
            RuntimeFn::StackMemoryDeallocation => FunctionType::new(Type::Void, vec![key]),
            RuntimeFn::GetGlobalLock => FunctionType::new(ptr(), vec![]),
            RuntimeFn::CopyMetadata => FunctionType::new(Type::Void, vec![ptr(), ptr(), size]),
            RuntimeFn::IntrospectMetadata => {
                FunctionType::new(Type::Void, vec![ptr(), ptr(), ptr(), slot])
            }
        }
    }
}

/// Handles of the declared runtime routines of one module.
#[derive(Debug, Clone)]
pub struct RuntimeDecls {
    decls: Vec<(FuncId, FunctionType)>,
}

impl RuntimeDecls {
    /// Declares every runtime routine in `module` (reusing existing declarations) and marks
    /// them as runtime functions.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidIr`] if the module already declares a runtime symbol
    /// with a different signature.
    pub fn declare(module: &mut Module) -> Result<Self> {
        let width = module.pointer_width();
        let mut decls = Vec::with_capacity(RuntimeFn::COUNT);

        for routine in RuntimeFn::iter() {
            let signature = routine.signature(width);
            let id = module.declare_function(routine.symbol(), signature.clone())?;
            module.function_mut(id)?.add_flags(FunctionFlags::RUNTIME);
            decls.push((id, signature));
        }

        Ok(RuntimeDecls { decls })
    }

    /// The declared function of a routine.
    #[must_use]
    pub fn id(&self, routine: RuntimeFn) -> FuncId {
        self.decls[routine as usize].0
    }

    /// The routine's signature.
    #[must_use]
    pub fn signature(&self, routine: RuntimeFn) -> &FunctionType {
        &self.decls[routine as usize].1
    }

    /// The routine's address as a callee operand.
    #[must_use]
    pub fn callee(&self, routine: RuntimeFn) -> Operand {
        let (id, signature) = &self.decls[routine as usize];
        Operand::Const(Constant::Function {
            id: *id,
            ty: Type::function_ptr(signature.clone()),
        })
    }

    /// Inserts a call to a runtime routine.
    ///
    /// # Errors
    ///
    /// Propagates insertion failures.
    pub fn call(
        &self,
        inserter: &mut Inserter<'_>,
        routine: RuntimeFn,
        args: Vec<Operand>,
    ) -> Result<ValueId> {
        inserter.call(
            self.callee(routine),
            self.signature(routine).clone(),
            args,
        )
    }

    /// Returns the routine behind `id`, if it is one of the declared runtime functions.
    #[must_use]
    pub fn routine_of(&self, id: FuncId) -> Option<RuntimeFn> {
        RuntimeFn::iter().find(|routine| self.id(*routine) == id)
    }
}
