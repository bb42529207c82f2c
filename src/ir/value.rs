//! Value identities, operands and constants.
//!
//! Every SSA value of a module is named by a [`ValueId`]: the owning function plus a dense
//! index into that function's value arena. Ids are never reused, so they are safe keys for
//! module-wide side tables such as the metadata store.

use std::fmt;

use crate::ir::Type;

/// Handle of a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    /// Creates a handle from a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        FuncId(index)
    }

    /// The raw index into the module's function list.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func#{}", self.0)
    }
}

/// Handle of a global variable within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub(crate) u32);

impl GlobalId {
    /// Creates a handle from a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        GlobalId(index)
    }

    /// The raw index into the module's global list.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global#{}", self.0)
    }
}

/// Handle of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Creates a handle from a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        BlockId(index)
    }

    /// The raw index into the function's block list.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl From<BlockId> for crate::utils::graph::NodeId {
    fn from(block: BlockId) -> Self {
        crate::utils::graph::NodeId::new(block.index())
    }
}

impl From<crate::utils::graph::NodeId> for BlockId {
    fn from(node: crate::utils::graph::NodeId) -> Self {
        // Block counts are bounded by the u32 block index space
        #[allow(clippy::cast_possible_truncation)]
        let index = node.index() as u32;
        BlockId(index)
    }
}

/// Module-wide identity of an SSA value (parameter or instruction result).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId {
    func: FuncId,
    index: u32,
}

impl ValueId {
    /// Creates a value id.
    #[must_use]
    pub const fn new(func: FuncId, index: u32) -> Self {
        ValueId { func, index }
    }

    /// The function owning this value.
    #[must_use]
    pub const fn func(self) -> FuncId {
        self.func
    }

    /// Index into the owning function's value arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.index)
    }
}

/// An instruction operand: either an SSA value or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Reference to a parameter or instruction result.
    Value(ValueId),
    /// Inline constant.
    Const(Constant),
}

impl Operand {
    /// Returns the referenced value, if this is not a constant.
    #[must_use]
    pub const fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            Operand::Const(_) => None,
        }
    }

    /// Returns the constant, if this is one.
    #[must_use]
    pub const fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Value(_) => None,
        }
    }

    /// Returns `true` for the literal null pointer constant.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Operand::Const(Constant::Null(_)))
    }
}

impl From<ValueId> for Operand {
    fn from(value: ValueId) -> Self {
        Operand::Value(value)
    }
}

impl From<Constant> for Operand {
    fn from(constant: Constant) -> Self {
        Operand::Const(constant)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "{id}"),
            Operand::Const(c) => write!(f, "{c}"),
        }
    }
}

/// A compile-time constant. Every constant carries enough information to know its own type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Null pointer of the given pointer type.
    Null(Type),
    /// Undefined value of the given type.
    Undef(Type),
    /// Integer; `value` holds the bit pattern sign-extended into an `i64`.
    Int {
        /// Bit width
        bits: u32,
        /// Value
        value: i64,
    },
    /// Address of a global variable; `ty` is a pointer to the global's value type.
    Global {
        /// The global
        id: GlobalId,
        /// Pointer type of the address
        ty: Type,
    },
    /// Address of a function; `ty` is a pointer to its function type.
    Function {
        /// The function
        id: FuncId,
        /// Pointer type of the address
        ty: Type,
    },
    /// Array or struct literal.
    Aggregate {
        /// The aggregate type
        ty: Type,
        /// One constant per element or field
        elements: Vec<Constant>,
    },
    /// All-zero value of any type.
    Zero(Type),
    /// Constant expression.
    Expr(Box<ConstExpr>),
}

impl Constant {
    /// Integer constant of the given width.
    #[must_use]
    pub const fn int(bits: u32, value: i64) -> Self {
        Constant::Int { bits, value }
    }

    /// `i32` constant.
    #[must_use]
    pub const fn i32(value: i64) -> Self {
        Constant::Int { bits: 32, value }
    }

    /// `i64` constant.
    #[must_use]
    pub const fn i64(value: i64) -> Self {
        Constant::Int { bits: 64, value }
    }

    /// The null `i8*`.
    #[must_use]
    pub fn null_void_ptr() -> Self {
        Constant::Null(Type::void_ptr())
    }

    /// Builds a constant `bitcast`.
    #[must_use]
    pub fn bitcast(value: Constant, ty: Type) -> Self {
        Constant::Expr(Box::new(ConstExpr::BitCast { value, ty }))
    }

    /// Builds a constant `inttoptr`.
    #[must_use]
    pub fn int_to_ptr(value: Constant, ty: Type) -> Self {
        Constant::Expr(Box::new(ConstExpr::IntToPtr { value, ty }))
    }

    /// Builds a constant `getelementptr` with result type `ty`.
    #[must_use]
    pub fn gep(base: Constant, indices: Vec<Constant>, ty: Type) -> Self {
        Constant::Expr(Box::new(ConstExpr::GetElementPtr { base, indices, ty }))
    }

    /// The type of this constant.
    #[must_use]
    pub fn ty(&self) -> Type {
        match self {
            Constant::Null(ty)
            | Constant::Undef(ty)
            | Constant::Zero(ty)
            | Constant::Global { ty, .. }
            | Constant::Function { ty, .. }
            | Constant::Aggregate { ty, .. } => ty.clone(),
            Constant::Int { bits, .. } => Type::Int(*bits),
            Constant::Expr(expr) => expr.ty().clone(),
        }
    }

    /// Returns the integer value of an integer constant.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Returns element `index` of an aggregate-valued constant.
    ///
    /// Zero and undef aggregates yield zero and undef elements of the element type.
    #[must_use]
    pub fn element(&self, index: u64) -> Option<Constant> {
        match self {
            Constant::Aggregate { elements, .. } => {
                usize::try_from(index).ok().and_then(|i| elements.get(i).cloned())
            }
            Constant::Zero(ty) => ty.element(index).map(|elem| Constant::Zero(elem.clone())),
            Constant::Undef(ty) => ty.element(index).map(|elem| Constant::Undef(elem.clone())),
            _ => None,
        }
    }

    /// Substitutes every function address nested in this constant, including those inside
    /// aggregates and constant expressions, for which `map` yields a replacement.
    ///
    /// Returns the number of addresses replaced. The pointer type is kept.
    pub fn replace_functions(&mut self, map: &impl Fn(FuncId) -> Option<FuncId>) -> usize {
        match self {
            Constant::Function { id, .. } => match map(*id) {
                Some(replacement) => {
                    *id = replacement;
                    1
                }
                None => 0,
            },
            Constant::Aggregate { elements, .. } => elements
                .iter_mut()
                .map(|element| element.replace_functions(map))
                .sum(),
            Constant::Expr(expr) => match expr.as_mut() {
                ConstExpr::GetElementPtr { base, indices, .. } => {
                    base.replace_functions(map)
                        + indices
                            .iter_mut()
                            .map(|index| index.replace_functions(map))
                            .sum::<usize>()
                }
                ConstExpr::BitCast { value, .. }
                | ConstExpr::IntToPtr { value, .. }
                | ConstExpr::PtrToInt { value, .. } => value.replace_functions(map),
            },
            Constant::Null(_)
            | Constant::Undef(_)
            | Constant::Zero(_)
            | Constant::Int { .. }
            | Constant::Global { .. } => 0,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null(ty) => write!(f, "{ty} null"),
            Constant::Undef(ty) => write!(f, "{ty} undef"),
            Constant::Int { bits, value } => write!(f, "i{bits} {value}"),
            Constant::Global { id, ty } => write!(f, "{ty} @g{}", id.0),
            Constant::Function { id, ty } => write!(f, "{ty} @f{}", id.0),
            Constant::Aggregate { ty, elements } => {
                write!(f, "{ty} [")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, "]")
            }
            Constant::Zero(ty) => write!(f, "{ty} zeroinitializer"),
            Constant::Expr(expr) => write!(f, "{expr}"),
        }
    }
}

/// A constant expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstExpr {
    /// Address arithmetic on a constant pointer.
    GetElementPtr {
        /// Base pointer
        base: Constant,
        /// Integer indices
        indices: Vec<Constant>,
        /// Result pointer type
        ty: Type,
    },
    /// Pointer reinterpretation.
    BitCast {
        /// Source pointer
        value: Constant,
        /// Target type
        ty: Type,
    },
    /// Integer to pointer conversion.
    IntToPtr {
        /// Source integer
        value: Constant,
        /// Target pointer type
        ty: Type,
    },
    /// Pointer to integer conversion.
    PtrToInt {
        /// Source pointer
        value: Constant,
        /// Target integer type
        ty: Type,
    },
}

impl ConstExpr {
    /// Result type of the expression.
    #[must_use]
    pub const fn ty(&self) -> &Type {
        match self {
            ConstExpr::GetElementPtr { ty, .. }
            | ConstExpr::BitCast { ty, .. }
            | ConstExpr::IntToPtr { ty, .. }
            | ConstExpr::PtrToInt { ty, .. } => ty,
        }
    }
}

impl fmt::Display for ConstExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstExpr::GetElementPtr { base, indices, ty } => {
                write!(f, "{ty} getelementptr ({base}")?;
                for index in indices {
                    write!(f, ", {index}")?;
                }
                write!(f, ")")
            }
            ConstExpr::BitCast { value, ty } => write!(f, "bitcast ({value} to {ty})"),
            ConstExpr::IntToPtr { value, ty } => write!(f, "inttoptr ({value} to {ty})"),
            ConstExpr::PtrToInt { value, ty } => write!(f, "ptrtoint ({value} to {ty})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_types() {
        assert_eq!(Constant::i32(7).ty(), Type::i32());
        assert_eq!(Constant::null_void_ptr().ty(), Type::void_ptr());

        let global = Constant::Global {
            id: GlobalId::new(0),
            ty: Type::ptr(Type::array(Type::i8(), 10)),
        };
        let cast = Constant::bitcast(global, Type::void_ptr());
        assert_eq!(cast.ty(), Type::void_ptr());
    }

    #[test]
    fn test_zero_elements() {
        let ty = Type::Struct(vec![Type::i32(), Type::void_ptr()]);
        let zero = Constant::Zero(ty);
        assert_eq!(zero.element(1), Some(Constant::Zero(Type::void_ptr())));
        assert_eq!(zero.element(2), None);
    }

    #[test]
    fn test_operand_helpers() {
        let value = ValueId::new(FuncId::new(0), 3);
        let op: Operand = value.into();
        assert_eq!(op.as_value(), Some(value));
        assert!(!op.is_null());
        assert!(Operand::from(Constant::null_void_ptr()).is_null());
        assert_eq!(op.to_string(), "%3");
    }

    #[test]
    fn test_replace_nested_functions() {
        let fn_ty = Type::ptr(Type::i8());
        let old = FuncId::new(1);
        let new = FuncId::new(5);
        let address = Constant::Function {
            id: old,
            ty: fn_ty.clone(),
        };
        let other = Constant::Function {
            id: FuncId::new(2),
            ty: fn_ty.clone(),
        };
        let mut table = Constant::Aggregate {
            ty: Type::array(Type::void_ptr(), 3),
            elements: vec![
                Constant::bitcast(address.clone(), Type::void_ptr()),
                other.clone(),
                Constant::null_void_ptr(),
            ],
        };

        let replaced = table.replace_functions(&|id| (id == old).then_some(new));
        assert_eq!(replaced, 1);
        let moved = Constant::Function { id: new, ty: fn_ty };
        assert_eq!(
            table.element(0),
            Some(Constant::bitcast(moved, Type::void_ptr()))
        );
        assert_eq!(table.element(1), Some(other));
    }
}
