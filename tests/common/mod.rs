//! Shared helpers for the integration tests.
//!
//! [`Machine`] executes an instrumented module: a small interpreter for the IR plus an
//! in-memory model of the runtime ABI (metadata table, shadow stack, lock/key allocator,
//! dereference checks and the `malloc`/`free` wrappers). Every check the runtime performs is
//! recorded as an [`Event`], so tests can assert on the metadata the inserted code computed.

#![allow(dead_code)]

use std::{collections::HashMap, result::Result};

use softboundcets::{instrument::runtime::RUNTIME_PREFIX, prelude::*};
use strum::IntoEnumIterator;

const FUNCTION_BASE: u64 = 0xF000_0000_0000;
const FUNCTION_STRIDE: u64 = 16;
const MEMORY_BASE: u64 = 0x1_0000;
const RED_ZONE: u64 = 16;
const STEP_LIMIT: usize = 1_000_000;

/// A runtime value: integers and pointers are words, structs and arrays are aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Val {
    Word(u64),
    Agg(Vec<Val>),
}

impl Val {
    pub fn word(&self) -> Result<u64, Trap> {
        match self {
            Val::Word(word) => Ok(*word),
            Val::Agg(_) => Err(Trap::Unsupported("aggregate used as scalar".into())),
        }
    }
}

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    Spatial {
        ptr: u64,
        base: u64,
        bound: u64,
        size: u64,
    },
    Temporal {
        key: u64,
        lock: u64,
    },
    CallTarget {
        target: u64,
    },
    Unreachable,
    StepLimit,
    Unsupported(String),
}

/// Something the runtime observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Spatial {
        store: bool,
        base: u64,
        bound: u64,
        ptr: u64,
        size: u64,
    },
    Temporal {
        store: bool,
        lock: u64,
        key: u64,
    },
    CallTarget {
        base: u64,
        bound: u64,
        target: u64,
    },
    StackAllocation {
        key: u64,
    },
    StackDeallocation {
        key: u64,
    },
    HeapAllocation {
        ptr: u64,
        size: u64,
        key: u64,
    },
}

enum Flow {
    Continue,
    Jump(BlockId),
    Return(Option<Val>),
}

type Frame = HashMap<ValueId, Val>;

/// Index of each component in a metadata record.
const BASE: usize = 0;
const BOUND: usize = 1;
const KEY: usize = 2;
const LOCK: usize = 3;

pub struct Machine<'m> {
    module: &'m Module,
    layout: DataLayout,
    memory: HashMap<u64, u8>,
    next_address: u64,
    globals: Vec<u64>,
    metadata: HashMap<u64, [u64; 4]>,
    shadow_stack: Vec<Vec<[u64; 4]>>,
    locks: HashMap<u64, u64>,
    next_key: u64,
    global_lock: u64,
    steps: usize,
    stack_objects: Vec<u64>,
    pub events: Vec<Event>,
}

impl<'m> Machine<'m> {
    /// Lays out the globals, writes their initializers and runs the module constructors.
    pub fn new(module: &'m Module) -> Result<Self, Trap> {
        let mut machine = Machine {
            module,
            layout: module.data_layout(),
            memory: HashMap::new(),
            next_address: MEMORY_BASE,
            globals: Vec::new(),
            metadata: HashMap::new(),
            shadow_stack: Vec::new(),
            locks: HashMap::new(),
            next_key: 2,
            global_lock: 0,
            steps: 0,
            stack_objects: Vec::new(),
            events: Vec::new(),
        };

        machine.global_lock = machine.alloc(8);
        machine.write(machine.global_lock, 8, 1);

        for global in module.globals() {
            let size = machine.layout.size_of(global.value_type());
            let address = machine.alloc(size);
            machine.globals.push(address);
        }
        for (global, &address) in module.globals().iter().zip(&machine.globals.clone()) {
            if let Some(init) = global.initializer() {
                let value = machine.eval_const(init)?;
                machine.write_value(address, global.value_type(), &value)?;
            }
        }
        for &constructor in module.constructors() {
            machine.invoke(constructor, Vec::new())?;
        }

        Ok(machine)
    }

    /// Calls a function by name.
    pub fn call(&mut self, name: &str, args: Vec<Val>) -> Result<Option<Val>, Trap> {
        let id = self
            .module
            .function_by_name(name)
            .ok_or_else(|| Trap::Unsupported(format!("no function '{name}'")))?;
        self.invoke(id, args)
    }

    pub fn global_address(&self, name: &str) -> Option<u64> {
        let id = self.module.global_by_name(name)?;
        self.globals.get(id.index()).copied()
    }

    pub fn read(&self, address: u64, size: u64) -> u64 {
        (0..size.min(8)).fold(0u64, |acc, i| {
            let byte = self.memory.get(&(address + i)).copied().unwrap_or(0);
            acc | (u64::from(byte) << (8 * i))
        })
    }

    pub fn spatial_events(&self) -> Vec<(u64, u64, u64, u64)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Spatial {
                    base,
                    bound,
                    ptr,
                    size,
                    ..
                } => Some((*base, *bound, *ptr, *size)),
                _ => None,
            })
            .collect()
    }

    pub fn temporal_event_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, Event::Temporal { .. }))
            .count()
    }

    /// Addresses of every executed `alloca`, in execution order.
    pub fn stack_allocations(&self) -> Vec<u64> {
        self.stack_objects.clone()
    }

    /// Keys handed out for stack frames.
    pub fn frame_keys(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::StackAllocation { key } => Some(*key),
                _ => None,
            })
            .collect()
    }

    fn alloc(&mut self, size: u64) -> u64 {
        let address = self.next_address.div_ceil(16) * 16;
        self.next_address = address + size.max(1) + RED_ZONE;
        address
    }

    fn write(&mut self, address: u64, size: u64, value: u64) {
        for i in 0..size.min(8) {
            self.memory.insert(address + i, (value >> (8 * i)) as u8);
        }
    }

    fn tick(&mut self) -> Result<(), Trap> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(Trap::StepLimit);
        }
        Ok(())
    }

    fn pointer_bits(&self) -> u32 {
        self.layout.pointer_width().bits()
    }

    fn bits_of(&self, ty: &Type) -> u32 {
        match ty {
            Type::Int(bits) => *bits,
            Type::Ptr(_) => self.pointer_bits(),
            _ => 64,
        }
    }

    // ---------------------------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------------------------

    fn zero(ty: &Type) -> Val {
        match ty {
            Type::Array(elem, len) => Val::Agg((0..*len).map(|_| Self::zero(elem)).collect()),
            Type::Struct(fields) => Val::Agg(fields.iter().map(Self::zero).collect()),
            _ => Val::Word(0),
        }
    }

    fn eval_const(&self, constant: &Constant) -> Result<Val, Trap> {
        Ok(match constant {
            Constant::Null(_) => Val::Word(0),
            Constant::Undef(ty) | Constant::Zero(ty) => Self::zero(ty),
            Constant::Int { bits, value } => Val::Word(mask(*value as u64, *bits)),
            Constant::Global { id, .. } => Val::Word(
                self.globals
                    .get(id.index())
                    .copied()
                    .ok_or_else(|| Trap::Unsupported(format!("unknown global {id}")))?,
            ),
            Constant::Function { id, .. } => {
                Val::Word(FUNCTION_BASE + id.index() as u64 * FUNCTION_STRIDE)
            }
            Constant::Aggregate { elements, .. } => Val::Agg(
                elements
                    .iter()
                    .map(|element| self.eval_const(element))
                    .collect::<Result<_, _>>()?,
            ),
            Constant::Expr(expr) => match expr.as_ref() {
                ConstExpr::GetElementPtr { base, indices, .. } => {
                    let address = self.eval_const(base)?.word()?;
                    let base_ty = base.ty();
                    let pointee = base_ty
                        .pointee()
                        .ok_or_else(|| Trap::Unsupported("gep on non-pointer".into()))?;
                    let indices: Vec<i64> = indices
                        .iter()
                        .map(|index| {
                            index
                                .as_int()
                                .ok_or_else(|| Trap::Unsupported("non-integer index".into()))
                        })
                        .collect::<Result<_, _>>()?;
                    let offset = self
                        .layout
                        .gep_offset(pointee, &indices)
                        .ok_or_else(|| Trap::Unsupported("invalid constant gep".into()))?;
                    Val::Word(address.wrapping_add(offset as u64))
                }
                ConstExpr::BitCast { value, .. } => self.eval_const(value)?,
                ConstExpr::IntToPtr { value, ty } | ConstExpr::PtrToInt { value, ty } => {
                    Val::Word(mask(self.eval_const(value)?.word()?, self.bits_of(ty)))
                }
            },
        })
    }

    fn eval(&self, frame: &Frame, operand: &Operand) -> Result<Val, Trap> {
        match operand {
            Operand::Value(id) => frame
                .get(id)
                .cloned()
                .ok_or_else(|| Trap::Unsupported(format!("{id} used before definition"))),
            Operand::Const(constant) => self.eval_const(constant),
        }
    }

    fn read_value(&self, address: u64, ty: &Type) -> Result<Val, Trap> {
        Ok(match ty {
            Type::Array(elem, len) => {
                let stride = self.layout.size_of(elem);
                Val::Agg(
                    (0..*len)
                        .map(|i| self.read_value(address + i * stride, elem))
                        .collect::<Result<_, _>>()?,
                )
            }
            Type::Struct(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (i, field) in fields.iter().enumerate() {
                    let offset = self
                        .layout
                        .field_offset(fields, i)
                        .ok_or_else(|| Trap::Unsupported("bad field".into()))?;
                    values.push(self.read_value(address + offset, field)?);
                }
                Val::Agg(values)
            }
            Type::Void | Type::Function(_) => {
                return Err(Trap::Unsupported(format!("load of {ty}")));
            }
            _ => Val::Word(self.read(address, self.layout.size_of(ty))),
        })
    }

    fn write_value(&mut self, address: u64, ty: &Type, value: &Val) -> Result<(), Trap> {
        match (ty, value) {
            (Type::Array(elem, _), Val::Agg(values)) => {
                let stride = self.layout.size_of(elem);
                for (i, value) in (0u64..).zip(values) {
                    self.write_value(address + i * stride, elem, value)?;
                }
            }
            (Type::Struct(fields), Val::Agg(values)) => {
                for (i, (field, value)) in fields.iter().zip(values).enumerate() {
                    let offset = self
                        .layout
                        .field_offset(fields, i)
                        .ok_or_else(|| Trap::Unsupported("bad field".into()))?;
                    self.write_value(address + offset, field, value)?;
                }
            }
            (_, Val::Word(word)) => {
                let size = self.layout.size_of(ty);
                self.write(address, size, *word);
            }
            _ => return Err(Trap::Unsupported(format!("store of aggregate as {ty}"))),
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------------------------

    fn function_at(&self, address: u64) -> Result<FuncId, Trap> {
        let offset = address.wrapping_sub(FUNCTION_BASE);
        let index = offset / FUNCTION_STRIDE;
        if address < FUNCTION_BASE
            || offset % FUNCTION_STRIDE != 0
            || index >= self.module.functions().len() as u64
        {
            return Err(Trap::Unsupported(format!("call through {address:#x}")));
        }
        Ok(FuncId::new(index as u32))
    }

    fn invoke(&mut self, id: FuncId, args: Vec<Val>) -> Result<Option<Val>, Trap> {
        let module = self.module;
        let func = module
            .function(id)
            .map_err(|error| Trap::Unsupported(error.to_string()))?;
        if func.is_declaration() {
            return self.external(func, &args);
        }

        let mut frame: Frame = func.params().iter().copied().zip(args).collect();
        let mut block = func
            .entry_block()
            .ok_or_else(|| Trap::Unsupported("no entry block".into()))?;
        let mut previous: Option<BlockId> = None;

        loop {
            let insts = func
                .block(block)
                .ok_or_else(|| Trap::Unsupported(format!("no block {block}")))?
                .instructions();

            let mut merged = Vec::new();
            let mut first = 0;
            for &value in insts {
                let Some(InstKind::Phi { incoming }) = func.instruction(value).map(|i| &i.kind)
                else {
                    break;
                };
                let from = previous
                    .ok_or_else(|| Trap::Unsupported("phi in entry block".into()))?;
                let (operand, _) = incoming
                    .iter()
                    .find(|(_, pred)| *pred == from)
                    .ok_or_else(|| Trap::Unsupported(format!("{value} has no edge from {from}")))?;
                merged.push((value, self.eval(&frame, operand)?));
                first += 1;
            }
            frame.extend(merged);

            let mut next = None;
            for &value in &insts[first..] {
                self.tick()?;
                let inst = func
                    .instruction(value)
                    .ok_or_else(|| Trap::Unsupported(format!("{value} is not an instruction")))?;
                match self.step(func, &mut frame, value, &inst.kind)? {
                    Flow::Continue => {}
                    Flow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Flow::Return(result) => return Ok(result),
                }
            }

            previous = Some(block);
            block = next.ok_or_else(|| Trap::Unsupported("fell off a block".into()))?;
        }
    }

    fn step(
        &mut self,
        func: &Function,
        frame: &mut Frame,
        value: ValueId,
        kind: &InstKind,
    ) -> Result<Flow, Trap> {
        let ty = func.value_type(value).cloned().unwrap_or(Type::Void);
        let type_of = |operand: &Operand| {
            func.operand_type(operand)
                .map_err(|error| Trap::Unsupported(error.to_string()))
        };

        let result = match kind {
            InstKind::Alloca { allocated, count } => {
                let count = match count {
                    Some(count) => self.eval(frame, count)?.word()?,
                    None => 1,
                };
                let size = self.layout.size_of(allocated).saturating_mul(count);
                let address = self.alloc(size);
                self.stack_objects.push(address);
                Val::Word(address)
            }
            InstKind::Load { ptr } => {
                let address = self.eval(frame, ptr)?.word()?;
                self.read_value(address, &ty)?
            }
            InstKind::Store { value: stored, ptr } => {
                let address = self.eval(frame, ptr)?.word()?;
                let stored_ty = type_of(stored)?;
                let stored = self.eval(frame, stored)?;
                self.write_value(address, &stored_ty, &stored)?;
                return Ok(Flow::Continue);
            }
            InstKind::GetElementPtr { base, indices } => {
                let address = self.eval(frame, base)?.word()?;
                let base_ty = type_of(base)?;
                let pointee = base_ty
                    .pointee()
                    .ok_or_else(|| Trap::Unsupported("gep on non-pointer".into()))?;
                let mut offsets = Vec::with_capacity(indices.len());
                for index in indices {
                    let bits = self.bits_of(&type_of(index)?);
                    offsets.push(sext(self.eval(frame, index)?.word()?, bits));
                }
                let offset = self
                    .layout
                    .gep_offset(pointee, &offsets)
                    .ok_or_else(|| Trap::Unsupported("invalid gep".into()))?;
                Val::Word(address.wrapping_add(offset as u64))
            }
            InstKind::BitCast { value: source } => self.eval(frame, source)?,
            InstKind::IntToPtr { value: source } | InstKind::PtrToInt { value: source } => {
                Val::Word(mask(self.eval(frame, source)?.word()?, self.bits_of(&ty)))
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                if self.eval(frame, cond)?.word()? & 1 == 1 {
                    self.eval(frame, if_true)?
                } else {
                    self.eval(frame, if_false)?
                }
            }
            InstKind::Phi { .. } => {
                return Err(Trap::Unsupported(format!("{value} follows a non-phi")));
            }
            InstKind::Call { callee, args, .. } => {
                let target = self.function_at(self.eval(frame, callee)?.word()?)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(frame, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                match self.invoke(target, args)? {
                    Some(result) => result,
                    None => return Ok(Flow::Continue),
                }
            }
            InstKind::ExtractValue { aggregate, index } => match self.eval(frame, aggregate)? {
                Val::Agg(fields) => fields
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| Trap::Unsupported(format!("no field {index}")))?,
                Val::Word(_) => return Err(Trap::Unsupported("extract from scalar".into())),
            },
            InstKind::Binary { op, lhs, rhs } => {
                let bits = self.bits_of(&ty);
                let lhs = self.eval(frame, lhs)?.word()?;
                let rhs = self.eval(frame, rhs)?.word()?;
                Val::Word(binary(*op, lhs, rhs, bits)?)
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let bits = self.bits_of(&type_of(lhs)?);
                let lhs = self.eval(frame, lhs)?.word()?;
                let rhs = self.eval(frame, rhs)?.word()?;
                Val::Word(u64::from(compare(*pred, lhs, rhs, bits)))
            }
            InstKind::Jump { target } => return Ok(Flow::Jump(*target)),
            InstKind::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let taken = if self.eval(frame, cond)?.word()? & 1 == 1 {
                    *then_block
                } else {
                    *else_block
                };
                return Ok(Flow::Jump(taken));
            }
            InstKind::Return { value: returned } => {
                let result = match returned {
                    Some(operand) => Some(self.eval(frame, operand)?),
                    None => None,
                };
                return Ok(Flow::Return(result));
            }
            InstKind::Unreachable => return Err(Trap::Unreachable),
        };

        frame.insert(value, result);
        Ok(Flow::Continue)
    }

    // ---------------------------------------------------------------------------------------
    // Runtime model
    // ---------------------------------------------------------------------------------------

    fn external(&mut self, func: &Function, args: &[Val]) -> Result<Option<Val>, Trap> {
        let words = args.iter().map(Val::word).collect::<Result<Vec<_>, _>>()?;
        let name = func.name();
        let returns = !func.signature().ret.is_void();

        let result = if func.flags().contains(FunctionFlags::RUNTIME) {
            let routine = RuntimeFn::iter()
                .find(|routine| routine.symbol() == name)
                .ok_or_else(|| Trap::Unsupported(format!("unknown runtime routine '{name}'")))?;
            self.runtime(routine, &words)?
        } else if func.flags().contains(FunctionFlags::WRAPPER) {
            let library = name.strip_prefix(RUNTIME_PREFIX).unwrap_or(name);
            self.library(library, true, &words)?
        } else {
            self.library(name, false, &words)?
        };

        Ok(if returns { result } else { None })
    }

    fn new_lock(&mut self) -> (u64, u64) {
        let key = self.next_key;
        self.next_key += 1;
        let lock = self.alloc(8);
        self.write(lock, 8, key);
        self.locks.insert(key, lock);
        (lock, key)
    }

    fn slot(&mut self, slot: u64) -> Result<&mut [u64; 4], Trap> {
        self.shadow_stack
            .last_mut()
            .and_then(|frame| frame.get_mut(slot as usize))
            .ok_or_else(|| Trap::Unsupported(format!("shadow stack slot {slot} out of frame")))
    }

    fn runtime(&mut self, routine: RuntimeFn, a: &[u64]) -> Result<Option<Val>, Trap> {
        let arg = |i: usize| {
            a.get(i)
                .copied()
                .ok_or_else(|| Trap::Unsupported(format!("{} takes more arguments", routine.name())))
        };

        match routine {
            RuntimeFn::SpatialLoadDereferenceCheck | RuntimeFn::SpatialStoreDereferenceCheck => {
                let (base, bound, ptr, size) = (arg(0)?, arg(1)?, arg(2)?, arg(3)?);
                self.events.push(Event::Spatial {
                    store: routine == RuntimeFn::SpatialStoreDereferenceCheck,
                    base,
                    bound,
                    ptr,
                    size,
                });
                if ptr < base || ptr.saturating_add(size) > bound {
                    return Err(Trap::Spatial {
                        ptr,
                        base,
                        bound,
                        size,
                    });
                }
            }
            RuntimeFn::TemporalLoadDereferenceCheck
            | RuntimeFn::TemporalStoreDereferenceCheck => {
                let (lock, key) = (arg(0)?, arg(1)?);
                self.events.push(Event::Temporal {
                    store: routine == RuntimeFn::TemporalStoreDereferenceCheck,
                    lock,
                    key,
                });
                if lock == 0 || self.read(lock, 8) != key {
                    return Err(Trap::Temporal { key, lock });
                }
            }
            RuntimeFn::SpatialCallDereferenceCheck => {
                let (base, bound, target) = (arg(0)?, arg(1)?, arg(2)?);
                self.events.push(Event::CallTarget {
                    base,
                    bound,
                    target,
                });
                if target < base || target >= bound {
                    return Err(Trap::CallTarget { target });
                }
            }
            RuntimeFn::MetadataStore => {
                self.metadata
                    .insert(arg(0)?, [arg(1)?, arg(2)?, arg(3)?, arg(4)?]);
            }
            RuntimeFn::MetadataLoad => {
                let record = self.metadata.get(&arg(0)?).copied().unwrap_or_default();
                return Ok(Some(Val::Agg(record.iter().map(|w| Val::Word(*w)).collect())));
            }
            RuntimeFn::AllocateShadowStackSpace => {
                self.shadow_stack.push(vec![[0; 4]; arg(0)? as usize]);
            }
            RuntimeFn::DeallocateShadowStackSpace => {
                self.shadow_stack
                    .pop()
                    .ok_or_else(|| Trap::Unsupported("shadow stack underflow".into()))?;
            }
            RuntimeFn::LoadBaseShadowStack => return Ok(Some(Val::Word(self.slot(arg(0)?)?[BASE]))),
            RuntimeFn::LoadBoundShadowStack => {
                return Ok(Some(Val::Word(self.slot(arg(0)?)?[BOUND])))
            }
            RuntimeFn::LoadKeyShadowStack => return Ok(Some(Val::Word(self.slot(arg(0)?)?[KEY]))),
            RuntimeFn::LoadLockShadowStack => return Ok(Some(Val::Word(self.slot(arg(0)?)?[LOCK]))),
            RuntimeFn::StoreBaseShadowStack => self.slot(arg(1)?)?[BASE] = arg(0)?,
            RuntimeFn::StoreBoundShadowStack => self.slot(arg(1)?)?[BOUND] = arg(0)?,
            RuntimeFn::StoreKeyShadowStack => self.slot(arg(1)?)?[KEY] = arg(0)?,
            RuntimeFn::StoreLockShadowStack => self.slot(arg(1)?)?[LOCK] = arg(0)?,
            RuntimeFn::StackMemoryAllocation => {
                let (lock, key) = self.new_lock();
                self.events.push(Event::StackAllocation { key });
                return Ok(Some(Val::Agg(vec![Val::Word(lock), Val::Word(key)])));
            }
            RuntimeFn::StackMemoryDeallocation => {
                let key = arg(0)?;
                if let Some(&lock) = self.locks.get(&key) {
                    self.write(lock, 8, 0);
                }
                self.events.push(Event::StackDeallocation { key });
            }
            RuntimeFn::GetGlobalLock => return Ok(Some(Val::Word(self.global_lock))),
            RuntimeFn::CopyMetadata => {
                let (dst, src, size) = (arg(0)?, arg(1)?, arg(2)?);
                let copied: Vec<(u64, [u64; 4])> = self
                    .metadata
                    .iter()
                    .filter(|(address, _)| **address >= src && **address < src + size)
                    .map(|(address, record)| (address - src + dst, *record))
                    .collect();
                self.metadata.extend(copied);
            }
            RuntimeFn::IntrospectMetadata => {}
        }
        Ok(None)
    }

    fn library(&mut self, name: &str, wrapped: bool, a: &[u64]) -> Result<Option<Val>, Trap> {
        let arg = |i: usize| {
            a.get(i)
                .copied()
                .ok_or_else(|| Trap::Unsupported(format!("{name} takes more arguments")))
        };

        match name {
            "malloc" => {
                let size = arg(0)?;
                let ptr = self.alloc(size);
                if wrapped {
                    let (lock, key) = self.new_lock();
                    *self.slot(0)? = [ptr, ptr + size, key, lock];
                    self.events.push(Event::HeapAllocation { ptr, size, key });
                }
                Ok(Some(Val::Word(ptr)))
            }
            "free" => {
                if wrapped {
                    let lock = self.slot(1)?[LOCK];
                    if lock != 0 && lock != self.global_lock {
                        self.write(lock, 8, 0);
                    }
                }
                Ok(None)
            }
            "memcpy" | "memmove" => {
                let (dst, src, size) = (arg(0)?, arg(1)?, arg(2)?);
                let bytes: Vec<u8> = (0..size)
                    .map(|i| self.memory.get(&(src + i)).copied().unwrap_or(0))
                    .collect();
                for (i, byte) in (0u64..).zip(bytes) {
                    self.memory.insert(dst + i, byte);
                }
                Ok(Some(Val::Word(dst)))
            }
            "tick" => Ok(None),
            _ => Err(Trap::Unsupported(format!("no model of '{name}'"))),
        }
    }
}

fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

fn sext(value: u64, bits: u32) -> i64 {
    if bits >= 64 || bits == 0 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

fn binary(op: BinaryOp, lhs: u64, rhs: u64, bits: u32) -> Result<u64, Trap> {
    let (sl, sr) = (sext(lhs, bits), sext(rhs, bits));
    let zero = || Trap::Unsupported("division by zero".into());
    let raw = match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::UDiv => lhs.checked_div(rhs).ok_or_else(zero)?,
        BinaryOp::SDiv => sl.checked_div(sr).ok_or_else(zero)? as u64,
        BinaryOp::URem => lhs.checked_rem(rhs).ok_or_else(zero)?,
        BinaryOp::SRem => sl.checked_rem(sr).ok_or_else(zero)? as u64,
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
        BinaryOp::Shl => lhs.wrapping_shl(rhs as u32),
        BinaryOp::LShr => lhs.wrapping_shr(rhs as u32),
        BinaryOp::AShr => sl.wrapping_shr(rhs as u32) as u64,
    };
    Ok(mask(raw, bits))
}

fn compare(pred: IntPredicate, lhs: u64, rhs: u64, bits: u32) -> bool {
    let (l, r) = (mask(lhs, bits), mask(rhs, bits));
    let (sl, sr) = (sext(lhs, bits), sext(rhs, bits));
    match pred {
        IntPredicate::Eq => l == r,
        IntPredicate::Ne => l != r,
        IntPredicate::Ugt => l > r,
        IntPredicate::Uge => l >= r,
        IntPredicate::Ult => l < r,
        IntPredicate::Ule => l <= r,
        IntPredicate::Sgt => sl > sr,
        IntPredicate::Sge => sl >= sr,
        IntPredicate::Slt => sl < sr,
        IntPredicate::Sle => sl <= sr,
    }
}

/// Instruments `module` in place.
pub fn instrument(
    module: &mut Module,
    config: InstrumentConfig,
) -> softboundcets::Result<InstrumentReport> {
    InstrumentEngine::new(config).run(module)
}

/// Argument lists of every call to `routine` inside `function`, in layout order.
pub fn runtime_calls(module: &Module, function: &str, routine: RuntimeFn) -> Vec<Vec<Operand>> {
    let Some(target) = module.function_by_name(&routine.symbol()) else {
        return Vec::new();
    };
    let Some(func) = module
        .function_by_name(function)
        .and_then(|id| module.function(id).ok())
    else {
        return Vec::new();
    };

    func.blocks()
        .iter()
        .flat_map(|block| block.instructions().iter().copied())
        .filter_map(|value| match func.instruction(value).map(|i| &i.kind) {
            Some(InstKind::Call { callee, args, .. })
                if matches!(callee, Operand::Const(Constant::Function { id, .. }) if *id == target) =>
            {
                Some(args.clone())
            }
            _ => None,
        })
        .collect()
}

/// The `i32` slot constant passed to the shadow stack routines.
pub fn slot(index: i64) -> Operand {
    Operand::Const(Constant::i32(index))
}

/// The slot numbers passed at argument `position` of each call, sorted.
pub fn slot_numbers(calls: &[Vec<Operand>], position: usize) -> Vec<i64> {
    let mut slots: Vec<i64> = calls
        .iter()
        .filter_map(|args| args.get(position))
        .filter_map(|operand| operand.as_const().and_then(Constant::as_int))
        .collect();
    slots.sort_unstable();
    slots
}
