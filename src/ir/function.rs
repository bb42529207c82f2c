//! Functions: parameters, the value arena and the block list.
//!
//! A [`Function`] owns every value it defines. Parameters and instruction results share one
//! arena indexed by [`ValueId::index`]; blocks hold ordered lists of instruction handles. A
//! function without blocks is a declaration.
//!
//! The function doubles as its own control flow graph: it implements the graph traits from
//! [`crate::utils::graph`], with one node per block and edges read off the terminators.

use bitflags::bitflags;

use crate::{
    ir::{Block, BlockId, FuncId, FunctionType, InstKind, Instruction, Operand, Type, ValueId},
    utils::graph::{GraphBase, NodeId, Predecessors, RootedGraph, Successors},
    Error, Result,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Properties of a function relevant to instrumentation
    pub struct FunctionFlags: u32 {
        /// Part of the metadata runtime; never instrumented, calls to it are opaque
        const RUNTIME = 0x0001;
        /// Created by the instrumentation itself
        const SYNTHETIC = 0x0002;
        /// Runs at module initialisation
        const CONSTRUCTOR = 0x0004;
        /// Metadata-aware wrapper of a library routine
        const WRAPPER = 0x0008;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Parameter attributes
    pub struct ParamAttributes: u32 {
        /// The pointer argument denotes a private copy made by the caller
        const BYVAL = 0x0001;
        /// The pointer does not alias other arguments
        const NOALIAS = 0x0002;
    }
}

/// How a value is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueDef {
    /// Formal parameter with the given position.
    Param(u32),
    /// Result of an instruction.
    Inst(Instruction),
}

/// An entry of the value arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueData {
    /// Type of the value, [`Type::Void`] for instructions without result
    pub ty: Type,
    /// Definition
    pub def: ValueDef,
}

/// A function definition or declaration.
#[derive(Debug, Clone)]
pub struct Function {
    id: FuncId,
    name: String,
    signature: FunctionType,
    params: Vec<ValueId>,
    param_attrs: Vec<ParamAttributes>,
    values: Vec<ValueData>,
    blocks: Vec<Block>,
    flags: FunctionFlags,
}

impl Function {
    /// Creates a declaration with one parameter value per signature parameter.
    #[must_use]
    pub fn new(id: FuncId, name: impl Into<String>, signature: FunctionType) -> Self {
        let mut function = Function {
            id,
            name: name.into(),
            params: Vec::with_capacity(signature.params.len()),
            param_attrs: vec![ParamAttributes::empty(); signature.params.len()],
            values: Vec::new(),
            blocks: Vec::new(),
            flags: FunctionFlags::empty(),
            signature,
        };

        for (position, ty) in function.signature.params.clone().into_iter().enumerate() {
            // Parameter counts are bounded by the value index space
            #[allow(clippy::cast_possible_truncation)]
            let id = function.push_value(ValueData {
                ty,
                def: ValueDef::Param(position as u32),
            });
            function.params.push(id);
        }

        function
    }

    /// The function's handle.
    #[must_use]
    pub const fn id(&self) -> FuncId {
        self.id
    }

    /// The symbol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The signature.
    #[must_use]
    pub const fn signature(&self) -> &FunctionType {
        &self.signature
    }

    /// Pointer type of the function's address.
    #[must_use]
    pub fn pointer_type(&self) -> Type {
        Type::function_ptr(self.signature.clone())
    }

    /// Instrumentation flags.
    #[must_use]
    pub const fn flags(&self) -> FunctionFlags {
        self.flags
    }

    /// Adds instrumentation flags.
    pub fn add_flags(&mut self, flags: FunctionFlags) {
        self.flags |= flags;
    }

    /// Returns `true` if the function has no body.
    #[must_use]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Parameter values in order.
    #[must_use]
    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    /// Parameter value at `position`.
    #[must_use]
    pub fn param(&self, position: usize) -> Option<ValueId> {
        self.params.get(position).copied()
    }

    /// Attributes of the parameter at `position`.
    #[must_use]
    pub fn param_attributes(&self, position: usize) -> ParamAttributes {
        self.param_attrs
            .get(position)
            .copied()
            .unwrap_or_else(ParamAttributes::empty)
    }

    /// Sets the attributes of the parameter at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if there is no such parameter.
    pub fn set_param_attributes(&mut self, position: usize, attrs: ParamAttributes) -> Result<()> {
        let slot = self.param_attrs.get_mut(position).ok_or_else(|| {
            Error::InvalidIr(format!("'{}' has no parameter {position}", self.name))
        })?;
        *slot = attrs;
        Ok(())
    }

    /// Number of entries in the value arena.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Iterates over all values of the arena.
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        let func = self.id;
        (0..self.values.len()).map(move |index| {
            // Arena size is bounded by the u32 index space
            #[allow(clippy::cast_possible_truncation)]
            let index = index as u32;
            ValueId::new(func, index)
        })
    }

    /// Looks up a value of this function.
    #[must_use]
    pub fn value(&self, id: ValueId) -> Option<&ValueData> {
        if id.func() != self.id {
            return None;
        }
        self.values.get(id.index())
    }

    /// Type of a value of this function.
    #[must_use]
    pub fn value_type(&self, id: ValueId) -> Option<&Type> {
        self.value(id).map(|data| &data.ty)
    }

    /// Type of an operand. Constants carry their own type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the operand refers to a value of another function or
    /// outside the arena.
    pub fn operand_type(&self, operand: &Operand) -> Result<Type> {
        match operand {
            Operand::Const(constant) => Ok(constant.ty()),
            Operand::Value(id) => self.value_type(*id).cloned().ok_or_else(|| {
                Error::InvalidIr(format!("{id} is not a value of '{}'", self.name))
            }),
        }
    }

    /// The instruction defining `id`, if `id` is an instruction result.
    #[must_use]
    pub fn instruction(&self, id: ValueId) -> Option<&Instruction> {
        match &self.value(id)?.def {
            ValueDef::Inst(inst) => Some(inst),
            ValueDef::Param(_) => None,
        }
    }

    /// Mutable access to the instruction defining `id`.
    pub fn instruction_mut(&mut self, id: ValueId) -> Option<&mut Instruction> {
        if id.func() != self.id {
            return None;
        }
        match &mut self.values.get_mut(id.index())?.def {
            ValueDef::Inst(inst) => Some(inst),
            ValueDef::Param(_) => None,
        }
    }

    /// Blocks in layout order. The first block is the entry.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Looks up a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    /// The entry block, `None` for declarations.
    #[must_use]
    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.first().map(Block::id)
    }

    /// The terminator of `block`, if the block is non-empty and ends in one.
    #[must_use]
    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        let last = *self.block(block)?.instructions().last()?;
        self.instruction(last)
            .filter(|inst| inst.kind.is_terminator())
            .map(|_| last)
    }

    /// Control-flow successors of `block`.
    #[must_use]
    pub fn block_successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .and_then(|term| self.instruction(term))
            .map(|inst| inst.kind.successors())
            .unwrap_or_default()
    }

    /// Control-flow predecessors of `block`, each listed once, in layout order.
    #[must_use]
    pub fn block_predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .map(Block::id)
            .filter(|pred| self.block_successors(*pred).contains(&block))
            .collect()
    }

    /// The instructions of `block` that belong to the input program, in order.
    #[must_use]
    pub fn original_instructions(&self, block: BlockId) -> Vec<ValueId> {
        self.block(block)
            .map(|b| {
                b.instructions()
                    .iter()
                    .copied()
                    .filter(|v| self.instruction(*v).is_some_and(|inst| inst.original))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterates over all instructions in layout order.
    pub fn instructions(&self) -> impl Iterator<Item = (ValueId, &Instruction)> + '_ {
        self.blocks.iter().flat_map(move |block| {
            block
                .instructions()
                .iter()
                .filter_map(move |v| self.instruction(*v).map(|inst| (*v, inst)))
        })
    }

    /// Appends an incoming edge to a phi.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if `phi` is not a phi of this function.
    pub fn add_phi_incoming(&mut self, phi: ValueId, value: Operand, block: BlockId) -> Result<()> {
        let name = self.name.clone();
        match self.instruction_mut(phi).map(|inst| &mut inst.kind) {
            Some(InstKind::Phi { incoming }) => {
                incoming.push((value, block));
                Ok(())
            }
            _ => Err(Error::InvalidIr(format!("{phi} in '{name}' is not a phi"))),
        }
    }

    /// Number of incoming edges of a phi.
    #[must_use]
    pub fn phi_arity(&self, phi: ValueId) -> Option<usize> {
        match &self.instruction(phi)?.kind {
            InstKind::Phi { incoming } => Some(incoming.len()),
            _ => None,
        }
    }

    pub(crate) fn push_value(&mut self, data: ValueData) -> ValueId {
        // Arena size is bounded by the u32 index space
        #[allow(clippy::cast_possible_truncation)]
        let id = ValueId::new(self.id, self.values.len() as u32);
        self.values.push(data);
        id
    }

    /// Creates an instruction value and places it at `position` within `block`.
    pub(crate) fn insert_instruction(
        &mut self,
        block: BlockId,
        position: usize,
        kind: InstKind,
        ty: Type,
        original: bool,
    ) -> Result<ValueId> {
        if block.index() >= self.blocks.len() {
            return Err(Error::InvalidIr(format!(
                "'{}' has no block {block}",
                self.name
            )));
        }

        let id = self.push_value(ValueData {
            ty,
            def: ValueDef::Inst(Instruction::new(kind, block, original)),
        });
        let target = &mut self.blocks[block.index()];
        let position = position.min(target.len());
        target.insert(position, id);
        Ok(id)
    }

    /// Extends the block list so that `block` exists.
    pub(crate) fn ensure_block(&mut self, block: BlockId) {
        while self.blocks.len() <= block.index() {
            // Block counts are bounded by the u32 block index space
            #[allow(clippy::cast_possible_truncation)]
            let id = BlockId::new(self.blocks.len() as u32);
            self.blocks.push(Block::new(id));
        }
    }

    /// Creates an instruction value at the end of `block`.
    pub(crate) fn append_instruction(
        &mut self,
        block: BlockId,
        kind: InstKind,
        ty: Type,
        original: bool,
    ) -> ValueId {
        self.ensure_block(block);
        let id = self.push_value(ValueData {
            ty,
            def: ValueDef::Inst(Instruction::new(kind, block, original)),
        });
        self.blocks[block.index()].push(id);
        id
    }
}

impl GraphBase for Function {
    fn node_count(&self) -> usize {
        self.blocks.len()
    }

    fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.blocks.len()).map(NodeId::new)
    }
}

impl Successors for Function {
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.block_successors(BlockId::from(node))
            .into_iter()
            .map(NodeId::from)
    }
}

impl Predecessors for Function {
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
        self.block_predecessors(BlockId::from(node))
            .into_iter()
            .map(NodeId::from)
    }
}

impl RootedGraph for Function {
    fn entry(&self) -> NodeId {
        NodeId::new(0)
    }
}
