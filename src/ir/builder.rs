//! Construction and insertion APIs.
//!
//! Two builders cover the two ways IR comes into existence:
//!
//! - [`FunctionBuilder`] constructs the *input* program. It uses a closure-based API where all
//!   blocks of a function are defined within a single expression, which keeps the CFG shape
//!   visible in test fixtures. Everything it creates is flagged as original.
//! - [`Inserter`] places *instrumentation* into an existing function at an [`InsertPoint`].
//!   Everything it creates is flagged as non-original, so the gather passes never revisit it.
//!
//! # Examples
//!
//! ```rust,ignore
//! use softboundcets::ir::{Constant, FunctionType, Module, PointerWidth, Type};
//!
//! let mut module = Module::new("demo", PointerWidth::Bits64);
//! let int_ptr = Type::ptr(Type::i32());
//! module.define_function("first", FunctionType::new(Type::i32(), vec![int_ptr]), |f| {
//!     let p = f.arg(0);
//!     f.block(0, |b| {
//!         let v = b.load(p);
//!         b.ret(Some(v.into()));
//!     });
//! })?;
//! ```
//!
//! # Loops
//!
//! A phi can only name values that exist. Back edges are therefore added after the fact with
//! [`FunctionContext::add_incoming`]:
//!
//! ```rust,ignore
//! f.block(1, |b| {
//!     let i = b.phi(Type::i64(), vec![(Constant::i64(0).into(), 0)]);
//!     let next = b.add(i, Constant::i64(1));
//!     // ...
//! });
//! f.add_incoming(i, next, 1);
//! ```

use crate::{
    ir::{
        BinaryOp, BlockId, Constant, DataLayout, FuncId, Function, FunctionType, GlobalId,
        InstKind, IntPredicate, Module, Operand, ParamAttributes, Type, ValueId,
    },
    Error, Result,
};

/// Builder for the body of an input function.
#[derive(Debug)]
pub struct FunctionBuilder<'m> {
    module: &'m Module,
    function: Function,
    layout: DataLayout,
    error: Option<Error>,
}

impl<'m> FunctionBuilder<'m> {
    /// Creates a builder that fills the body of `function`, resolving callees and globals
    /// against `module`.
    #[must_use]
    pub fn new(module: &'m Module, function: Function) -> Self {
        FunctionBuilder {
            module,
            function,
            layout: module.data_layout(),
            error: None,
        }
    }

    /// Builds the function body using a closure that defines all blocks.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::InvalidIr`] recorded while building (an operand of the
    /// wrong type, an unknown callee, a non-aggregate field access, ...).
    pub fn build_with<F>(mut self, f: F) -> Result<Function>
    where
        F: FnOnce(&mut FunctionContext<'_, 'm>),
    {
        let mut ctx = FunctionContext { builder: &mut self };
        f(&mut ctx);

        match self.error {
            Some(error) => Err(error),
            None => Ok(self.function),
        }
    }

    fn fail(&mut self, message: String) -> Type {
        if self.error.is_none() {
            self.error = Some(Error::InvalidIr(format!(
                "{} in '{}'",
                message,
                self.function.name()
            )));
        }
        Type::Void
    }

    fn operand_type(&mut self, operand: &Operand) -> Type {
        match self.function.operand_type(operand) {
            Ok(ty) => ty,
            Err(error) => self.fail(error.to_string()),
        }
    }

    fn emit(&mut self, block: BlockId, kind: InstKind, ty: Type) -> ValueId {
        self.function.append_instruction(block, kind, ty, true)
    }
}

/// Context passed to the build closure for defining blocks.
pub struct FunctionContext<'a, 'm> {
    builder: &'a mut FunctionBuilder<'m>,
}

impl<'m> FunctionContext<'_, 'm> {
    /// Gets the parameter value at the specified position.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a parameter position.
    #[must_use]
    pub fn arg(&self, index: usize) -> ValueId {
        self.builder.function.params()[index]
    }

    /// Sets the attributes of a parameter.
    pub fn set_param_attributes(&mut self, index: usize, attrs: ParamAttributes) {
        if let Err(error) = self.builder.function.set_param_attributes(index, attrs) {
            self.builder.fail(error.to_string());
        }
    }

    /// The address of a global as an operand.
    pub fn global(&mut self, id: GlobalId) -> Operand {
        match self.builder.module.global_ref(id) {
            Ok(address) => address.into(),
            Err(error) => {
                let ty = self.builder.fail(error.to_string());
                Constant::Undef(ty).into()
            }
        }
    }

    /// The address of a function as an operand.
    pub fn function(&mut self, id: FuncId) -> Operand {
        match self.builder.module.function_ref(id) {
            Ok(address) => address.into(),
            Err(error) => {
                let ty = self.builder.fail(error.to_string());
                Constant::Undef(ty).into()
            }
        }
    }

    /// Defines a block with the given id using a closure and returns the closure's result.
    ///
    /// Block ids should be sequential starting from 0; gaps are filled with empty blocks,
    /// which the verifier rejects.
    pub fn block<F, R>(&mut self, id: usize, f: F) -> R
    where
        F: FnOnce(&mut BlockBuilder<'_, 'm>) -> R,
    {
        let block = block_id(id);
        self.builder.function.ensure_block(block);
        let mut block_builder = BlockBuilder {
            builder: self.builder,
            block,
        };
        f(&mut block_builder)
    }

    /// Adds an incoming edge `(value, block)` to an existing phi.
    pub fn add_incoming(&mut self, phi: ValueId, value: impl Into<Operand>, block: usize) {
        if let Err(error) = self
            .builder
            .function
            .add_phi_incoming(phi, value.into(), block_id(block))
        {
            self.builder.fail(error.to_string());
        }
    }
}

fn block_id(id: usize) -> BlockId {
    // Block ids are bounded by the u32 block index space
    #[allow(clippy::cast_possible_truncation)]
    let index = id as u32;
    BlockId::new(index)
}

/// Builder for the instructions of one block.
///
/// Operations that produce values return the new [`ValueId`]; result types are derived from
/// the operands (typed pointers make loads and GEPs self-describing).
pub struct BlockBuilder<'a, 'm> {
    builder: &'a mut FunctionBuilder<'m>,
    block: BlockId,
}

impl BlockBuilder<'_, '_> {
    /// The block being built.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.block
    }

    fn emit(&mut self, kind: InstKind, ty: Type) -> ValueId {
        self.builder.emit(self.block, kind, ty)
    }

    /// `alloca ty`.
    pub fn alloca(&mut self, allocated: Type) -> ValueId {
        let ty = Type::ptr(allocated.clone());
        self.emit(
            InstKind::Alloca {
                allocated,
                count: None,
            },
            ty,
        )
    }

    /// `alloca ty, count`.
    pub fn alloca_array(&mut self, allocated: Type, count: impl Into<Operand>) -> ValueId {
        let ty = Type::ptr(allocated.clone());
        self.emit(
            InstKind::Alloca {
                allocated,
                count: Some(count.into()),
            },
            ty,
        )
    }

    /// `load ptr`; the result type is the pointee type.
    pub fn load(&mut self, ptr: impl Into<Operand>) -> ValueId {
        let ptr = ptr.into();
        let ty = match self.builder.operand_type(&ptr) {
            Type::Ptr(pointee) => *pointee,
            other => self.builder.fail(format!("load through non-pointer {other}")),
        };
        self.emit(InstKind::Load { ptr }, ty)
    }

    /// `store value, ptr`.
    pub fn store(&mut self, value: impl Into<Operand>, ptr: impl Into<Operand>) -> ValueId {
        let (value, ptr) = (value.into(), ptr.into());
        let ptr_ty = self.builder.operand_type(&ptr);
        let value_ty = self.builder.operand_type(&value);
        if ptr_ty.pointee() != Some(&value_ty) {
            self.builder
                .fail(format!("store of {value_ty} through {ptr_ty}"));
        }
        self.emit(InstKind::Store { value, ptr }, Type::Void)
    }

    /// `getelementptr base, indices...`.
    pub fn gep<I, O>(&mut self, base: impl Into<Operand>, indices: I) -> ValueId
    where
        I: IntoIterator<Item = O>,
        O: Into<Operand>,
    {
        let base = base.into();
        let indices: Vec<Operand> = indices.into_iter().map(Into::into).collect();
        let constant_indices: Vec<Option<i64>> = indices
            .iter()
            .map(|i| i.as_const().and_then(Constant::as_int))
            .collect();

        let ty = match self.builder.operand_type(&base) {
            Type::Ptr(pointee) => {
                match self
                    .builder
                    .layout
                    .gep_result_type(&pointee, &constant_indices)
                {
                    Some(ty) => ty,
                    None => self
                        .builder
                        .fail(format!("invalid getelementptr indices into {pointee}")),
                }
            }
            other => self.builder.fail(format!("getelementptr on non-pointer {other}")),
        };
        self.emit(InstKind::GetElementPtr { base, indices }, ty)
    }

    /// `bitcast value to ty`.
    pub fn bitcast(&mut self, value: impl Into<Operand>, ty: Type) -> ValueId {
        self.emit(
            InstKind::BitCast {
                value: value.into(),
            },
            ty,
        )
    }

    /// `inttoptr value to ty`.
    pub fn int_to_ptr(&mut self, value: impl Into<Operand>, ty: Type) -> ValueId {
        self.emit(
            InstKind::IntToPtr {
                value: value.into(),
            },
            ty,
        )
    }

    /// `ptrtoint value to ty`.
    pub fn ptr_to_int(&mut self, value: impl Into<Operand>, ty: Type) -> ValueId {
        self.emit(
            InstKind::PtrToInt {
                value: value.into(),
            },
            ty,
        )
    }

    /// `select cond, if_true, if_false`.
    pub fn select(
        &mut self,
        cond: impl Into<Operand>,
        if_true: impl Into<Operand>,
        if_false: impl Into<Operand>,
    ) -> ValueId {
        let if_true = if_true.into();
        let ty = self.builder.operand_type(&if_true);
        self.emit(
            InstKind::Select {
                cond: cond.into(),
                if_true,
                if_false: if_false.into(),
            },
            ty,
        )
    }

    /// `phi ty [value, block]...`. Edges from blocks defined later can be added with
    /// [`FunctionContext::add_incoming`].
    pub fn phi(&mut self, ty: Type, incoming: Vec<(Operand, usize)>) -> ValueId {
        let incoming = incoming
            .into_iter()
            .map(|(value, block)| (value, block_id(block)))
            .collect();
        self.emit(InstKind::Phi { incoming }, ty)
    }

    /// Direct call of a module function.
    pub fn call(&mut self, callee: FuncId, args: Vec<Operand>) -> ValueId {
        let (callee_op, fn_ty) = match self.builder.module.function(callee) {
            Ok(function) => (
                Operand::Const(Constant::Function {
                    id: callee,
                    ty: function.pointer_type(),
                }),
                function.signature().clone(),
            ),
            Err(error) => {
                let ty = self.builder.fail(error.to_string());
                (
                    Operand::Const(Constant::Undef(ty)),
                    FunctionType::new(Type::Void, vec![]),
                )
            }
        };
        self.call_with(callee_op, fn_ty, args)
    }

    /// Indirect call through a function pointer.
    pub fn call_indirect(&mut self, callee: impl Into<Operand>, args: Vec<Operand>) -> ValueId {
        let callee = callee.into();
        let callee_ty = self.builder.operand_type(&callee);
        let fn_ty = match callee_ty.function_signature() {
            Some(sig) => sig.clone(),
            None => {
                self.builder
                    .fail(format!("indirect call through {callee_ty}"));
                FunctionType::new(Type::Void, vec![])
            }
        };
        self.call_with(callee, fn_ty, args)
    }

    fn call_with(&mut self, callee: Operand, fn_ty: FunctionType, args: Vec<Operand>) -> ValueId {
        let fixed = fn_ty.params.len();
        if args.len() < fixed || (args.len() > fixed && !fn_ty.variadic) {
            self.builder.fail(format!(
                "call with {} arguments through {fn_ty}",
                args.len()
            ));
        }
        let ret = fn_ty.ret.clone();
        self.emit(InstKind::Call { callee, args, fn_ty }, ret)
    }

    /// `extractvalue aggregate, index`.
    pub fn extract_value(&mut self, aggregate: impl Into<Operand>, index: u32) -> ValueId {
        let aggregate = aggregate.into();
        let ty = match self.builder.operand_type(&aggregate).element(u64::from(index)) {
            Some(ty) => ty.clone(),
            None => self.builder.fail(format!("extractvalue index {index} out of range")),
        };
        self.emit(InstKind::ExtractValue { aggregate, index }, ty)
    }

    /// Integer arithmetic.
    pub fn binary(
        &mut self,
        op: BinaryOp,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> ValueId {
        let lhs = lhs.into();
        let ty = self.builder.operand_type(&lhs);
        self.emit(
            InstKind::Binary {
                op,
                lhs,
                rhs: rhs.into(),
            },
            ty,
        )
    }

    /// `add lhs, rhs`.
    pub fn add(&mut self, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    /// `sub lhs, rhs`.
    pub fn sub(&mut self, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    /// `icmp pred lhs, rhs`.
    pub fn icmp(
        &mut self,
        pred: IntPredicate,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> ValueId {
        self.emit(
            InstKind::ICmp {
                pred,
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
            Type::i1(),
        )
    }

    /// Unconditional branch.
    pub fn jump(&mut self, target: usize) -> ValueId {
        self.emit(
            InstKind::Jump {
                target: block_id(target),
            },
            Type::Void,
        )
    }

    /// Conditional branch.
    pub fn branch(&mut self, cond: impl Into<Operand>, then_block: usize, else_block: usize) -> ValueId {
        self.emit(
            InstKind::Branch {
                cond: cond.into(),
                then_block: block_id(then_block),
                else_block: block_id(else_block),
            },
            Type::Void,
        )
    }

    /// Return, with a value for non-void functions.
    pub fn ret(&mut self, value: Option<Operand>) -> ValueId {
        self.emit(InstKind::Return { value }, Type::Void)
    }

    /// `unreachable`.
    pub fn unreachable(&mut self) -> ValueId {
        self.emit(InstKind::Unreachable, Type::Void)
    }
}

/// Where an [`Inserter`] places new instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Immediately before an instruction.
    Before(ValueId),
    /// Immediately after an instruction.
    After(ValueId),
    /// After the phis at the start of a block.
    AfterPhis(BlockId),
    /// In the entry block, before the first original instruction.
    Prologue,
    /// Before the terminator of a block.
    BeforeTerminator(BlockId),
}

/// Inserts non-original instructions into a function.
///
/// Consecutive insertions through one inserter appear in program order: each new instruction
/// is placed after the previously inserted one.
pub struct Inserter<'f> {
    func: &'f mut Function,
    block: BlockId,
    position: usize,
}

impl<'f> Inserter<'f> {
    /// Creates an inserter positioned at `point`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the anchor instruction or block does not exist.
    pub fn new(func: &'f mut Function, point: InsertPoint) -> Result<Self> {
        let (block, position) = Self::resolve(func, point)?;
        Ok(Inserter {
            func,
            block,
            position,
        })
    }

    fn resolve(func: &Function, point: InsertPoint) -> Result<(BlockId, usize)> {
        let missing = || Error::InvalidIr(format!("insert point {point:?} is not in '{}'", func.name()));

        match point {
            InsertPoint::Before(anchor) | InsertPoint::After(anchor) => {
                let block = func.instruction(anchor).ok_or_else(missing)?.block;
                let position = func
                    .block(block)
                    .and_then(|b| b.position(anchor))
                    .ok_or_else(missing)?;
                let offset = usize::from(matches!(point, InsertPoint::After(_)));
                Ok((block, position + offset))
            }
            InsertPoint::AfterPhis(block) => {
                let b = func.block(block).ok_or_else(missing)?;
                let position = b
                    .instructions()
                    .iter()
                    .position(|v| !func.instruction(*v).is_some_and(|i| i.kind.is_phi()))
                    .unwrap_or(b.len());
                Ok((block, position))
            }
            InsertPoint::Prologue => {
                let entry = func.entry_block().ok_or_else(missing)?;
                let b = func.block(entry).ok_or_else(missing)?;
                let position = b
                    .instructions()
                    .iter()
                    .position(|v| func.instruction(*v).is_some_and(|i| i.original))
                    .unwrap_or(b.len());
                Ok((entry, position))
            }
            InsertPoint::BeforeTerminator(block) => {
                let b = func.block(block).ok_or_else(missing)?;
                let position = match func.terminator(block) {
                    Some(_) => b.len() - 1,
                    None => b.len(),
                };
                Ok((block, position))
            }
        }
    }

    /// The function being modified.
    #[must_use]
    pub fn function(&self) -> &Function {
        self.func
    }

    /// The block receiving new instructions.
    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    /// Inserts a non-original instruction and advances past it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the block vanished.
    pub fn insert(&mut self, kind: InstKind, ty: Type) -> Result<ValueId> {
        let id = self
            .func
            .insert_instruction(self.block, self.position, kind, ty, false)?;
        self.position += 1;
        Ok(id)
    }

    /// Inserts `getelementptr` with an explicit result type.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert`].
    pub fn gep(&mut self, base: Operand, indices: Vec<Operand>, ty: Type) -> Result<ValueId> {
        self.insert(InstKind::GetElementPtr { base, indices }, ty)
    }

    /// Inserts `bitcast value to ty`.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert`].
    pub fn bitcast(&mut self, value: Operand, ty: Type) -> Result<ValueId> {
        self.insert(InstKind::BitCast { value }, ty)
    }

    /// Converts a pointer operand to `i8*`, folding constants instead of emitting code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the operand is not a pointer.
    pub fn cast_to_void_ptr(&mut self, value: Operand) -> Result<Operand> {
        let ty = self.func.operand_type(&value)?;
        if !ty.is_pointer() {
            return Err(Error::InvalidIr(format!(
                "cannot reinterpret {ty} {value} as i8*"
            )));
        }
        if ty.is_void_ptr() {
            return Ok(value);
        }
        match value {
            Operand::Const(Constant::Null(_)) => Ok(Constant::null_void_ptr().into()),
            Operand::Const(constant) => Ok(Constant::bitcast(constant, Type::void_ptr()).into()),
            Operand::Value(_) => Ok(self.bitcast(value, Type::void_ptr())?.into()),
        }
    }

    /// Inserts `select cond, if_true, if_false`.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert`].
    pub fn select(&mut self, cond: Operand, if_true: Operand, if_false: Operand) -> Result<ValueId> {
        let ty = self.func.operand_type(&if_true)?;
        self.insert(
            InstKind::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    /// Inserts a phi without incoming edges.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert`].
    pub fn phi(&mut self, ty: Type) -> Result<ValueId> {
        self.insert(
            InstKind::Phi {
                incoming: Vec::new(),
            },
            ty,
        )
    }

    /// Inserts a call through the given signature.
    ///
    /// # Errors
    ///
    /// See [`Inserter::insert`].
    pub fn call(&mut self, callee: Operand, fn_ty: FunctionType, args: Vec<Operand>) -> Result<ValueId> {
        let ret = fn_ty.ret.clone();
        self.insert(InstKind::Call { callee, args, fn_ty }, ret)
    }

    /// Inserts `extractvalue aggregate, index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIr`] if the aggregate has no such field.
    pub fn extract_value(&mut self, aggregate: Operand, index: u32) -> Result<ValueId> {
        let ty = self
            .func
            .operand_type(&aggregate)?
            .element(u64::from(index))
            .cloned()
            .ok_or_else(|| Error::InvalidIr(format!("extractvalue index {index} out of range")))?;
        self.insert(InstKind::ExtractValue { aggregate, index }, ty)
    }
}
