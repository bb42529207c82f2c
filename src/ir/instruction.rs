//! Instructions.
//!
//! [`InstKind`] is a closed set: passes dispatch on it with exhaustive `match`es. An
//! instruction's result (if any) is the value it defines; its type lives on the value, not
//! on the instruction.

use strum::{EnumIter, IntoStaticStr};

use crate::ir::{BlockId, FunctionType, Operand, Type};

/// Integer arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    /// Wrapping addition
    Add,
    /// Wrapping subtraction
    Sub,
    /// Wrapping multiplication
    Mul,
    /// Unsigned division
    UDiv,
    /// Signed division
    SDiv,
    /// Unsigned remainder
    URem,
    /// Signed remainder
    SRem,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Logical shift right
    LShr,
    /// Arithmetic shift right
    AShr,
}

impl BinaryOp {
    /// Textual opcode.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum IntPredicate {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Unsigned greater than
    Ugt,
    /// Unsigned greater or equal
    Uge,
    /// Unsigned less than
    Ult,
    /// Unsigned less or equal
    Ule,
    /// Signed greater than
    Sgt,
    /// Signed greater or equal
    Sge,
    /// Signed less than
    Slt,
    /// Signed less or equal
    Sle,
}

impl IntPredicate {
    /// Textual predicate.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}

/// The operation an instruction performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Stack allocation of `count` (default 1) values of type `allocated`.
    Alloca {
        /// Element type
        allocated: Type,
        /// Optional element count
        count: Option<Operand>,
    },
    /// Memory read through `ptr`.
    Load {
        /// Address
        ptr: Operand,
    },
    /// Memory write of `value` through `ptr`.
    Store {
        /// Stored value
        value: Operand,
        /// Address
        ptr: Operand,
    },
    /// Address computation.
    GetElementPtr {
        /// Base pointer
        base: Operand,
        /// Integer indices
        indices: Vec<Operand>,
    },
    /// Pointer reinterpretation.
    BitCast {
        /// Source
        value: Operand,
    },
    /// Integer to pointer conversion.
    IntToPtr {
        /// Source integer
        value: Operand,
    },
    /// Pointer to integer conversion.
    PtrToInt {
        /// Source pointer
        value: Operand,
    },
    /// Conditional value choice.
    Select {
        /// `i1` condition
        cond: Operand,
        /// Chosen when the condition is true
        if_true: Operand,
        /// Chosen when the condition is false
        if_false: Operand,
    },
    /// SSA merge.
    Phi {
        /// One `(value, predecessor)` pair per incoming edge
        incoming: Vec<(Operand, BlockId)>,
    },
    /// Direct or indirect call.
    Call {
        /// Function constant or function pointer value
        callee: Operand,
        /// Actual arguments
        args: Vec<Operand>,
        /// Signature the call is made through
        fn_ty: FunctionType,
    },
    /// Field extraction from a struct-typed value.
    ExtractValue {
        /// Struct value
        aggregate: Operand,
        /// Field index
        index: u32,
    },
    /// Integer arithmetic.
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
    },
    /// Integer comparison producing `i1`.
    ICmp {
        /// Predicate
        pred: IntPredicate,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
    },
    /// Unconditional branch.
    Jump {
        /// Target block
        target: BlockId,
    },
    /// Two-way conditional branch.
    Branch {
        /// `i1` condition
        cond: Operand,
        /// Taken when true
        then_block: BlockId,
        /// Taken when false
        else_block: BlockId,
    },
    /// Function return.
    Return {
        /// Returned value, `None` for void functions
        value: Option<Operand>,
    },
    /// Marks unreachable code.
    Unreachable,
}

impl InstKind {
    /// Returns `true` for block terminators.
    #[must_use]
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Jump { .. }
                | InstKind::Branch { .. }
                | InstKind::Return { .. }
                | InstKind::Unreachable
        )
    }

    /// Returns `true` for phi nodes.
    #[must_use]
    pub const fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Returns `true` for calls.
    #[must_use]
    pub const fn is_call(&self) -> bool {
        matches!(self, InstKind::Call { .. })
    }

    /// Control-flow successors named by a terminator, in branch order.
    #[must_use]
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Jump { target } => vec![*target],
            InstKind::Branch {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
            _ => Vec::new(),
        }
    }

    /// The memory address accessed by a load or store.
    #[must_use]
    pub const fn accessed_pointer(&self) -> Option<&Operand> {
        match self {
            InstKind::Load { ptr } | InstKind::Store { ptr, .. } => Some(ptr),
            _ => None,
        }
    }

    /// All operands in evaluation order. Phi operands are included.
    #[must_use]
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            InstKind::Alloca { count, .. } => count.iter().collect(),
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::GetElementPtr { base, indices } => {
                std::iter::once(base).chain(indices.iter()).collect()
            }
            InstKind::BitCast { value }
            | InstKind::IntToPtr { value }
            | InstKind::PtrToInt { value } => vec![value],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Phi { incoming } => incoming.iter().map(|(value, _)| value).collect(),
            InstKind::Call { callee, args, .. } => {
                std::iter::once(callee).chain(args.iter()).collect()
            }
            InstKind::ExtractValue { aggregate, .. } => vec![aggregate],
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Branch { cond, .. } => vec![cond],
            InstKind::Return { value } => value.iter().collect(),
            InstKind::Jump { .. } | InstKind::Unreachable => Vec::new(),
        }
    }

    /// Mutable access to all operands, in the order of [`InstKind::operands`].
    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            InstKind::Alloca { count, .. } => count.iter_mut().collect(),
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr } => vec![value, ptr],
            InstKind::GetElementPtr { base, indices } => {
                std::iter::once(base).chain(indices.iter_mut()).collect()
            }
            InstKind::BitCast { value }
            | InstKind::IntToPtr { value }
            | InstKind::PtrToInt { value } => vec![value],
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => vec![cond, if_true, if_false],
            InstKind::Phi { incoming } => incoming.iter_mut().map(|(value, _)| value).collect(),
            InstKind::Call { callee, args, .. } => {
                std::iter::once(callee).chain(args.iter_mut()).collect()
            }
            InstKind::ExtractValue { aggregate, .. } => vec![aggregate],
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Branch { cond, .. } => vec![cond],
            InstKind::Return { value } => value.iter_mut().collect(),
            InstKind::Jump { .. } | InstKind::Unreachable => Vec::new(),
        }
    }

    /// Short mnemonic used by the printer and in diagnostics.
    #[must_use]
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            InstKind::Alloca { .. } => "alloca",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::GetElementPtr { .. } => "getelementptr",
            InstKind::BitCast { .. } => "bitcast",
            InstKind::IntToPtr { .. } => "inttoptr",
            InstKind::PtrToInt { .. } => "ptrtoint",
            InstKind::Select { .. } => "select",
            InstKind::Phi { .. } => "phi",
            InstKind::Call { .. } => "call",
            InstKind::ExtractValue { .. } => "extractvalue",
            InstKind::Binary { .. } => "binary",
            InstKind::ICmp { .. } => "icmp",
            InstKind::Jump { .. } | InstKind::Branch { .. } => "br",
            InstKind::Return { .. } => "ret",
            InstKind::Unreachable => "unreachable",
        }
    }
}

/// An instruction placed in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The operation
    pub kind: InstKind,
    /// Containing block
    pub block: BlockId,
    /// `true` if the instruction belongs to the input program, `false` if it was inserted by
    /// instrumentation
    pub original: bool,
}

impl Instruction {
    /// Creates an instruction.
    #[must_use]
    pub const fn new(kind: InstKind, block: BlockId, original: bool) -> Self {
        Instruction {
            kind,
            block,
            original,
        }
    }
}
