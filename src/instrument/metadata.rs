//! Pointer metadata and the module-wide metadata store.
//!
//! Every pointer-typed value of the original program is associated with up to two records:
//! spatial metadata (`base`, `bound`) and temporal metadata (`key`, `lock`). The records hold
//! [`Operand`]s of the *instrumented* function, usually values inserted by the gather passes,
//! sometimes folded constants.
//!
//! The store lives for one engine run over one module. Value ids are never reused within a
//! module, so entries of earlier functions cannot be confused with later ones and nothing is
//! cleared between functions.
//!
//! # Type discipline
//!
//! `base`, `bound` and `lock` are always `i8*`; `key` is always the key integer of the module's
//! pointer width. [`MetadataStore::associate_spatial`] and
//! [`MetadataStore::associate_temporal`] enforce this and fail with [`Error::MetadataType`]
//! otherwise.

use std::collections::HashMap;

use crate::{
    ir::{Constant, Function, Operand, PointerWidth, Type, ValueId},
    Error, Result,
};

/// Base and bound of the object a pointer may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialMetadata {
    /// First byte of the object
    pub base: Operand,
    /// One past the last byte of the object
    pub bound: Operand,
}

/// Key and lock of the allocation a pointer was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalMetadata {
    /// Allocation identifier
    pub key: Operand,
    /// Validity cell holding the current key of the allocation
    pub lock: Operand,
}

/// The metadata of one pointer value.
///
/// A component is `None` when the corresponding safety kind is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PointerMetadata {
    /// Base and bound, if spatial safety is tracked
    pub spatial: Option<SpatialMetadata>,
    /// Key and lock, if temporal safety is tracked
    pub temporal: Option<TemporalMetadata>,
}

impl PointerMetadata {
    /// The null metadata: `base = bound = null`, `key = 0`, `lock = null`.
    #[must_use]
    pub fn null(width: PointerWidth, spatial: bool, temporal: bool) -> Self {
        PointerMetadata {
            spatial: spatial.then(|| SpatialMetadata {
                base: Constant::null_void_ptr().into(),
                bound: Constant::null_void_ptr().into(),
            }),
            temporal: temporal.then(|| TemporalMetadata {
                key: key_constant(width, 0).into(),
                lock: Constant::null_void_ptr().into(),
            }),
        }
    }

    /// Returns `true` if neither component is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.spatial.is_none() && self.temporal.is_none()
    }

    /// The base, or a null `i8*` when spatial metadata is absent.
    #[must_use]
    pub fn base_or_null(&self) -> Operand {
        self.spatial
            .as_ref()
            .map_or_else(|| Constant::null_void_ptr().into(), |s| s.base.clone())
    }

    /// The bound, or a null `i8*` when spatial metadata is absent.
    #[must_use]
    pub fn bound_or_null(&self) -> Operand {
        self.spatial
            .as_ref()
            .map_or_else(|| Constant::null_void_ptr().into(), |s| s.bound.clone())
    }

    /// The key, or key 0 when temporal metadata is absent.
    #[must_use]
    pub fn key_or_zero(&self, width: PointerWidth) -> Operand {
        self.temporal
            .as_ref()
            .map_or_else(|| key_constant(width, 0).into(), |t| t.key.clone())
    }

    /// The lock, or a null `i8*` when temporal metadata is absent.
    #[must_use]
    pub fn lock_or_null(&self) -> Operand {
        self.temporal
            .as_ref()
            .map_or_else(|| Constant::null_void_ptr().into(), |t| t.lock.clone())
    }
}

/// A key constant of the module's key width.
#[must_use]
pub fn key_constant(width: PointerWidth, key: i64) -> Constant {
    Constant::int(width.bits(), key)
}

/// Module-wide association of pointer values to their metadata.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    width: PointerWidth,
    spatial: HashMap<ValueId, SpatialMetadata>,
    temporal: HashMap<ValueId, TemporalMetadata>,
}

impl MetadataStore {
    /// Creates an empty store for a module with the given pointer width.
    #[must_use]
    pub fn new(width: PointerWidth) -> Self {
        MetadataStore {
            width,
            spatial: HashMap::new(),
            temporal: HashMap::new(),
        }
    }

    /// The pointer width the key type is derived from.
    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    /// Number of values with any metadata.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spatial
            .keys()
            .chain(self.temporal.keys().filter(|v| !self.spatial.contains_key(v)))
            .count()
    }

    /// Returns `true` if the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spatial.is_empty() && self.temporal.is_empty()
    }

    /// Associates base and bound with `value`, replacing any earlier spatial association.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetadataType`] if base or bound is not an `i8*` operand of `func`.
    pub fn associate_spatial(
        &mut self,
        func: &Function,
        value: ValueId,
        base: Operand,
        bound: Operand,
    ) -> Result<()> {
        check_type(func, value, "base", &base, &Type::void_ptr())?;
        check_type(func, value, "bound", &bound, &Type::void_ptr())?;

        self.spatial.remove(&value);
        self.spatial.insert(value, SpatialMetadata { base, bound });
        Ok(())
    }

    /// Associates key and lock with `value`, replacing any earlier temporal association.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MetadataType`] if the key is not of the key integer type or the lock
    /// is not an `i8*` operand of `func`.
    pub fn associate_temporal(
        &mut self,
        func: &Function,
        value: ValueId,
        key: Operand,
        lock: Operand,
    ) -> Result<()> {
        check_type(func, value, "key", &key, &self.width.key_type())?;
        check_type(func, value, "lock", &lock, &Type::void_ptr())?;

        self.temporal.remove(&value);
        self.temporal.insert(value, TemporalMetadata { key, lock });
        Ok(())
    }

    /// Associates every present component of `metadata` with `value`.
    ///
    /// # Errors
    ///
    /// See [`MetadataStore::associate_spatial`] and [`MetadataStore::associate_temporal`].
    pub fn associate(
        &mut self,
        func: &Function,
        value: ValueId,
        metadata: PointerMetadata,
    ) -> Result<()> {
        if let Some(SpatialMetadata { base, bound }) = metadata.spatial {
            self.associate_spatial(func, value, base, bound)?;
        }
        if let Some(TemporalMetadata { key, lock }) = metadata.temporal {
            self.associate_temporal(func, value, key, lock)?;
        }
        Ok(())
    }

    /// Returns `true` if `value` has any metadata.
    #[must_use]
    pub fn has(&self, value: ValueId) -> bool {
        self.spatial.contains_key(&value) || self.temporal.contains_key(&value)
    }

    /// The metadata of `value`, if any component is associated.
    #[must_use]
    pub fn lookup(&self, value: ValueId) -> Option<PointerMetadata> {
        let metadata = PointerMetadata {
            spatial: self.spatial.get(&value).cloned(),
            temporal: self.temporal.get(&value).cloned(),
        };
        (!metadata.is_empty()).then_some(metadata)
    }

    /// The metadata of `value`, which must exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMetadata`] if `value` was never associated.
    pub fn get(&self, func: &Function, value: ValueId) -> Result<PointerMetadata> {
        self.lookup(value).ok_or_else(|| Error::MissingMetadata {
            function: func.name().to_string(),
            value,
        })
    }

    /// Removes all metadata of `value`.
    pub fn dissociate(&mut self, value: ValueId) {
        self.spatial.remove(&value);
        self.temporal.remove(&value);
    }
}

fn check_type(
    func: &Function,
    value: ValueId,
    component: &'static str,
    operand: &Operand,
    expected: &Type,
) -> Result<()> {
    let found = func.operand_type(operand)?;
    if &found != expected {
        return Err(Error::MetadataType {
            value,
            component,
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionType, Module};

    fn function_with_pointer() -> (Module, ValueId) {
        let mut module = Module::new("m", PointerWidth::Bits64);
        let sig = FunctionType::new(Type::Void, vec![Type::void_ptr(), Type::ptr(Type::i32())]);
        let id = module
            .define_function("f", sig, |f| {
                f.block(0, |b| b.ret(None));
            })
            .unwrap();
        let p = module.function(id).unwrap().params()[0];
        (module, p)
    }

    #[test]
    fn test_associate_and_get() {
        let (module, p) = function_with_pointer();
        let func = module.function(p.func()).unwrap();
        let mut store = MetadataStore::new(PointerWidth::Bits64);

        assert!(!store.has(p));
        assert!(matches!(store.get(func, p), Err(Error::MissingMetadata { .. })));

        store
            .associate_spatial(func, p, p.into(), Constant::null_void_ptr().into())
            .unwrap();
        assert!(store.has(p));
        assert_eq!(store.len(), 1);

        let metadata = store.get(func, p).unwrap();
        assert_eq!(metadata.base_or_null(), Operand::Value(p));
        assert!(metadata.temporal.is_none());
        assert_eq!(metadata.key_or_zero(PointerWidth::Bits64), Constant::i64(0).into());

        store
            .associate_temporal(func, p, Constant::i64(1).into(), p.into())
            .unwrap();
        assert_eq!(store.len(), 1);

        store.dissociate(p);
        assert!(!store.has(p));
        assert!(store.is_empty());
    }

    #[test]
    fn test_associate_replaces() {
        let (module, p) = function_with_pointer();
        let func = module.function(p.func()).unwrap();
        let mut store = MetadataStore::new(PointerWidth::Bits64);

        let null = PointerMetadata::null(PointerWidth::Bits64, true, true);
        store.associate(func, p, null.clone()).unwrap();
        assert_eq!(store.lookup(p), Some(null));

        store
            .associate_spatial(func, p, p.into(), p.into())
            .unwrap();
        let spatial = store.lookup(p).unwrap().spatial.unwrap();
        assert_eq!(spatial.base, Operand::Value(p));
        assert_eq!(spatial.bound, Operand::Value(p));
    }

    #[test]
    fn test_type_checks() {
        let (module, p) = function_with_pointer();
        let func = module.function(p.func()).unwrap();
        let int_ptr = func.params()[1];
        let mut store = MetadataStore::new(PointerWidth::Bits64);

        // base must be i8*, not i32*
        let result = store.associate_spatial(func, p, int_ptr.into(), p.into());
        assert!(matches!(
            result,
            Err(Error::MetadataType {
                component: "base",
                ..
            })
        ));

        // key must be i64 on a 64-bit target
        let result =
            store.associate_temporal(func, p, Constant::i32(1).into(), p.into());
        assert!(matches!(
            result,
            Err(Error::MetadataType { component: "key", .. })
        ));
        assert!(!store.has(p));
    }

    #[test]
    fn test_null_metadata_components() {
        let spatial_only = PointerMetadata::null(PointerWidth::Bits32, true, false);
        assert!(spatial_only.spatial.is_some());
        assert!(spatial_only.temporal.is_none());
        assert_eq!(
            spatial_only.key_or_zero(PointerWidth::Bits32),
            Operand::Const(Constant::i32(0))
        );
        assert!(PointerMetadata::null(PointerWidth::Bits64, false, false).is_empty());
    }
}
