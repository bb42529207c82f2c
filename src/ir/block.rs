//! Basic blocks.

use crate::ir::{BlockId, ValueId};

/// A basic block: an ordered list of instruction values ending in a terminator.
///
/// The block stores only value handles; the instructions themselves live in the owning
/// function's value arena, so inserting into a block never invalidates any [`ValueId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    insts: Vec<ValueId>,
}

impl Block {
    /// Creates an empty block.
    #[must_use]
    pub const fn new(id: BlockId) -> Self {
        Block {
            id,
            insts: Vec::new(),
        }
    }

    /// The block's id.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Instructions in execution order.
    #[must_use]
    pub fn instructions(&self) -> &[ValueId] {
        &self.insts
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// Returns `true` if the block holds no instruction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Position of `value` within the block.
    #[must_use]
    pub fn position(&self, value: ValueId) -> Option<usize> {
        self.insts.iter().position(|v| *v == value)
    }

    pub(crate) fn push(&mut self, value: ValueId) {
        self.insts.push(value);
    }

    pub(crate) fn insert(&mut self, position: usize, value: ValueId) {
        self.insts.insert(position, value);
    }
}
