//! LLVM-like textual rendering of the IR, for diagnostics and tracing output.
//!
//! Only printing is supported; there is no parser.

use std::fmt;

use crate::ir::{Function, InstKind, Module, ValueDef, ValueId};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module '{}' ({}-bit)", self.name(), self.pointer_width().bits())?;

        for global in self.globals() {
            let kind = if global.is_constant() { "constant" } else { "global" };
            match global.initializer() {
                Some(init) => writeln!(f, "@g{} = {kind} {init}  ; {}", global.id().index(), global.name())?,
                None => writeln!(
                    f,
                    "@g{} = external {kind} {}  ; {}",
                    global.id().index(),
                    global.value_type(),
                    global.name()
                )?,
            }
        }

        for ctor in self.constructors() {
            writeln!(f, "; constructor @f{}", ctor.index())?;
        }

        for function in self.functions() {
            writeln!(f)?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.is_declaration() { "declare" } else { "define" };
        write!(
            f,
            "{keyword} {} @{}(",
            self.signature().ret,
            self.name()
        )?;
        for (i, param) in self.params().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let ty = self.value_type(*param).map(ToString::to_string).unwrap_or_default();
            write!(f, "{ty} {param}")?;
        }
        if self.signature().variadic {
            write!(f, ", ...")?;
        }
        write!(f, ")  ; @f{}", self.id().index())?;

        if self.is_declaration() {
            return writeln!(f);
        }

        writeln!(f, " {{")?;
        for block in self.blocks() {
            writeln!(f, "{}:", block.id())?;
            for value in block.instructions() {
                write!(f, "  ")?;
                write_instruction(f, self, *value)?;
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }
}

fn write_instruction(f: &mut fmt::Formatter<'_>, func: &Function, id: ValueId) -> fmt::Result {
    let Some(data) = func.value(id) else {
        return write!(f, "<dangling {id}>");
    };
    let ValueDef::Inst(inst) = &data.def else {
        return write!(f, "<param {id}>");
    };

    if !data.ty.is_void() {
        write!(f, "{id} = ")?;
    }

    match &inst.kind {
        InstKind::Alloca { allocated, count } => {
            write!(f, "alloca {allocated}")?;
            if let Some(count) = count {
                write!(f, ", {count}")?;
            }
        }
        InstKind::Load { ptr } => write!(f, "load {}, {ptr}", data.ty)?,
        InstKind::Store { value, ptr } => write!(f, "store {value}, {ptr}")?,
        InstKind::GetElementPtr { base, indices } => {
            write!(f, "getelementptr {base}")?;
            for index in indices {
                write!(f, ", {index}")?;
            }
        }
        InstKind::BitCast { value } => write!(f, "bitcast {value} to {}", data.ty)?,
        InstKind::IntToPtr { value } => write!(f, "inttoptr {value} to {}", data.ty)?,
        InstKind::PtrToInt { value } => write!(f, "ptrtoint {value} to {}", data.ty)?,
        InstKind::Select {
            cond,
            if_true,
            if_false,
        } => write!(f, "select {cond}, {if_true}, {if_false}")?,
        InstKind::Phi { incoming } => {
            write!(f, "phi {}", data.ty)?;
            for (i, (value, block)) in incoming.iter().enumerate() {
                let sep = if i == 0 { " " } else { ", " };
                write!(f, "{sep}[{value}, {block}]")?;
            }
        }
        InstKind::Call { callee, args, .. } => {
            write!(f, "call {} {callee}(", data.ty)?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ")")?;
        }
        InstKind::ExtractValue { aggregate, index } => {
            write!(f, "extractvalue {aggregate}, {index}")?;
        }
        InstKind::Binary { op, lhs, rhs } => write!(f, "{} {lhs}, {rhs}", op.mnemonic())?,
        InstKind::ICmp { pred, lhs, rhs } => write!(f, "icmp {} {lhs}, {rhs}", pred.mnemonic())?,
        InstKind::Jump { target } => write!(f, "br {target}")?,
        InstKind::Branch {
            cond,
            then_block,
            else_block,
        } => write!(f, "br {cond}, {then_block}, {else_block}")?,
        InstKind::Return { value } => match value {
            Some(value) => write!(f, "ret {value}")?,
            None => write!(f, "ret void")?,
        },
        InstKind::Unreachable => write!(f, "unreachable")?,
    }

    if !inst.original {
        write!(f, "  ; inserted")?;
    }
    Ok(())
}
