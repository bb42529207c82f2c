//! IR type system.
//!
//! The type system follows the shape of LLVM's first-class types with typed pointers: every
//! pointer carries its pointee type, which is what allows the instrumentation to compute
//! access sizes and object extents without any further context.
//!
//! # Type Categories
//!
//! - **Scalars**: [`Type::Int`], [`Type::Float`], [`Type::Double`]
//! - **Pointers**: [`Type::Ptr`]; `i8*` doubles as the untyped "void pointer" used for all
//!   metadata components
//! - **Aggregates**: [`Type::Array`], [`Type::Struct`]
//! - **Code**: [`Type::Function`], only ever seen behind a pointer
//!
//! Layout questions (sizes, alignment, field offsets) are answered by [`DataLayout`], which is
//! parameterised by the module's [`PointerWidth`].

use std::fmt;

/// An IR type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// No value (function results, stores, terminators).
    Void,
    /// Integer with the given bit width.
    Int(u32),
    /// 32-bit IEEE float.
    Float,
    /// 64-bit IEEE float.
    Double,
    /// Pointer to a value of the given type.
    Ptr(Box<Type>),
    /// Fixed-length array.
    Array(Box<Type>, u64),
    /// Struct with naturally aligned fields.
    Struct(Vec<Type>),
    /// Function signature.
    Function(Box<FunctionType>),
}

impl Type {
    /// `i1`.
    #[must_use]
    pub const fn i1() -> Self {
        Type::Int(1)
    }

    /// `i8`.
    #[must_use]
    pub const fn i8() -> Self {
        Type::Int(8)
    }

    /// `i32`.
    #[must_use]
    pub const fn i32() -> Self {
        Type::Int(32)
    }

    /// `i64`.
    #[must_use]
    pub const fn i64() -> Self {
        Type::Int(64)
    }

    /// Pointer to `pointee`.
    #[must_use]
    pub fn ptr(pointee: Type) -> Self {
        Type::Ptr(Box::new(pointee))
    }

    /// The untyped pointer `i8*` used for every base, bound and lock.
    #[must_use]
    pub fn void_ptr() -> Self {
        Type::ptr(Type::i8())
    }

    /// Array of `len` elements.
    #[must_use]
    pub fn array(elem: Type, len: u64) -> Self {
        Type::Array(Box::new(elem), len)
    }

    /// Pointer to a function of the given signature.
    #[must_use]
    pub fn function_ptr(signature: FunctionType) -> Self {
        Type::ptr(Type::Function(Box::new(signature)))
    }

    /// Returns `true` for pointer types.
    #[must_use]
    pub const fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    /// Returns `true` for integer types.
    #[must_use]
    pub const fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    /// Returns `true` for [`Type::Void`].
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Returns `true` if this is the void pointer `i8*`.
    #[must_use]
    pub fn is_void_ptr(&self) -> bool {
        matches!(self, Type::Ptr(inner) if **inner == Type::Int(8))
    }

    /// Returns the pointee type of a pointer.
    #[must_use]
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(inner) => Some(inner),
            _ => None,
        }
    }

    /// Returns the signature of a function type or of a pointer to one.
    #[must_use]
    pub fn function_signature(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(sig) => Some(sig),
            Type::Ptr(inner) => match inner.as_ref() {
                Type::Function(sig) => Some(sig),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns `true` if a pointer appears anywhere in this type.
    ///
    /// Pointers nested in arrays and structs count; function types do not, because a function
    /// type is never stored by value.
    #[must_use]
    pub fn contains_pointer(&self) -> bool {
        match self {
            Type::Ptr(_) => true,
            Type::Array(elem, _) => elem.contains_pointer(),
            Type::Struct(fields) => fields.iter().any(Type::contains_pointer),
            Type::Void | Type::Int(_) | Type::Float | Type::Double | Type::Function(_) => false,
        }
    }

    /// Returns the type of element `index` of an aggregate.
    ///
    /// Arrays accept any index (the element type is uniform); structs require an index in range.
    #[must_use]
    pub fn element(&self, index: u64) -> Option<&Type> {
        match self {
            Type::Array(elem, _) => Some(elem),
            Type::Struct(fields) => usize::try_from(index).ok().and_then(|i| fields.get(i)),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Ptr(inner) => write!(f, "{inner}*"),
            Type::Array(elem, len) => write!(f, "[{len} x {elem}]"),
            Type::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, " }}")
            }
            Type::Function(sig) => write!(f, "{sig}"),
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    /// Result type, [`Type::Void`] for procedures.
    pub ret: Type,
    /// Parameter types in order.
    pub params: Vec<Type>,
    /// Whether further arguments may follow the fixed ones.
    pub variadic: bool,
}

impl FunctionType {
    /// Creates a non-variadic signature.
    #[must_use]
    pub fn new(ret: Type, params: Vec<Type>) -> Self {
        FunctionType {
            ret,
            params,
            variadic: false,
        }
    }

    /// Creates a variadic signature.
    #[must_use]
    pub fn variadic(ret: Type, params: Vec<Type>) -> Self {
        FunctionType {
            ret,
            params,
            variadic: true,
        }
    }

    /// Number of pointer-typed parameters.
    #[must_use]
    pub fn pointer_param_count(&self) -> usize {
        self.params.iter().filter(|ty| ty.is_pointer()).count()
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.ret)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}

/// Target pointer width. Chosen once per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PointerWidth {
    /// 32-bit addresses.
    Bits32,
    /// 64-bit addresses.
    #[default]
    Bits64,
}

impl PointerWidth {
    /// Width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            PointerWidth::Bits32 => 32,
            PointerWidth::Bits64 => 64,
        }
    }

    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }

    /// The pointer-sized integer type, used for access sizes and byte counts.
    #[must_use]
    pub const fn intptr_type(self) -> Type {
        Type::Int(self.bits())
    }

    /// The integer type of temporal keys.
    #[must_use]
    pub const fn key_type(self) -> Type {
        Type::Int(self.bits())
    }

    /// The largest address, used as the "+infinity" bound.
    #[must_use]
    pub const fn max_address(self) -> u64 {
        match self {
            PointerWidth::Bits32 => u32::MAX as u64,
            PointerWidth::Bits64 => u64::MAX,
        }
    }
}

/// Size, alignment and offset queries with natural C alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataLayout {
    pointer_width: PointerWidth,
}

impl DataLayout {
    /// Creates a layout for the given pointer width.
    #[must_use]
    pub const fn new(pointer_width: PointerWidth) -> Self {
        DataLayout { pointer_width }
    }

    /// The pointer width this layout was built for.
    #[must_use]
    pub const fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    /// Allocation size of a value of type `ty`, including tail padding.
    ///
    /// Void and function types are unsized and report 0.
    #[must_use]
    pub fn size_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void | Type::Function(_) => 0,
            Type::Int(bits) => u64::from(bits.div_ceil(8)).next_power_of_two(),
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr(_) => self.pointer_width.bytes(),
            Type::Array(elem, len) => self.size_of(elem).saturating_mul(*len),
            Type::Struct(fields) => {
                let mut offset = 0u64;
                for field in fields {
                    offset = align_to(offset, self.align_of(field));
                    offset += self.size_of(field);
                }
                align_to(offset, self.align_of(ty))
            }
        }
    }

    /// ABI alignment of `ty`.
    #[must_use]
    pub fn align_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void | Type::Function(_) => 1,
            Type::Int(_) => self.size_of(ty).min(8),
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr(_) => self.pointer_width.bytes(),
            Type::Array(elem, _) => self.align_of(elem),
            Type::Struct(fields) => fields.iter().map(|f| self.align_of(f)).max().unwrap_or(1),
        }
    }

    /// Byte offset of field `index` within a struct with the given fields.
    #[must_use]
    pub fn field_offset(&self, fields: &[Type], index: usize) -> Option<u64> {
        if index >= fields.len() {
            return None;
        }

        let mut offset = 0u64;
        for (i, field) in fields.iter().enumerate() {
            offset = align_to(offset, self.align_of(field));
            if i == index {
                return Some(offset);
            }
            offset += self.size_of(field);
        }
        None
    }

    /// Folds a constant GEP index list applied to a `pointee*` into a byte offset.
    ///
    /// The first index scales by the pointee size; each following index selects an array element
    /// or a struct field. Returns `None` if an index walks into a scalar or names a missing
    /// field.
    #[must_use]
    pub fn gep_offset(&self, pointee: &Type, indices: &[i64]) -> Option<i64> {
        let (first, rest) = indices.split_first()?;

        let mut offset = first.checked_mul(i64::try_from(self.size_of(pointee)).ok()?)?;
        let mut current = pointee;

        for &index in rest {
            match current {
                Type::Array(elem, _) => {
                    let stride = i64::try_from(self.size_of(elem)).ok()?;
                    offset = offset.checked_add(index.checked_mul(stride)?)?;
                    current = elem;
                }
                Type::Struct(fields) => {
                    let field = usize::try_from(index).ok()?;
                    let field_offset = self.field_offset(fields, field)?;
                    offset = offset.checked_add(i64::try_from(field_offset).ok()?)?;
                    current = &fields[field];
                }
                _ => return None,
            }
        }

        Some(offset)
    }

    /// Computes the pointer type produced by a GEP over a `pointee*`.
    ///
    /// `indices` holds the constant value of each index where known. Struct indices must be
    /// known; array indices may be dynamic. The first index never changes the type.
    #[must_use]
    pub fn gep_result_type(&self, pointee: &Type, indices: &[Option<i64>]) -> Option<Type> {
        if indices.is_empty() {
            return None;
        }

        let mut current = pointee;
        for index in &indices[1..] {
            current = match current {
                Type::Array(elem, _) => elem,
                Type::Struct(fields) => {
                    let field = usize::try_from((*index)?).ok()?;
                    fields.get(field)?
                }
                _ => return None,
            };
        }

        Some(Type::ptr(current.clone()))
    }
}

fn align_to(offset: u64, align: u64) -> u64 {
    if align <= 1 {
        offset
    } else {
        offset.div_ceil(align) * align
    }
}
