//! Structural IR verification.
//!
//! The verifier checks the properties every pass relies on and every pass must preserve:
//!
//! - each block ends in exactly one terminator and contains no other
//! - phis form a prefix of their block and, in reachable blocks, carry exactly one incoming
//!   edge per CFG predecessor
//! - value operands refer to non-void values of the same function
//! - SSA dominance: every use in reachable code is dominated by its definition
//!
//! Violations are reported as [`Error::Verification`].

use std::collections::HashMap;

use crate::{
    ir::{BlockId, Function, InstKind, Module, Operand, ValueDef, ValueId},
    utils::graph::{algorithms::compute_dominators, NodeId},
    Error, Result,
};

/// Verifies every function of a module.
///
/// # Errors
///
/// Returns the first [`Error::Verification`] found.
pub fn verify_module(module: &Module) -> Result<()> {
    for function in module.functions() {
        verify_function(function)?;
    }
    Ok(())
}

/// Verifies one function. Declarations always pass.
///
/// # Errors
///
/// Returns [`Error::Verification`] describing the first violation.
pub fn verify_function(func: &Function) -> Result<()> {
    if func.is_declaration() {
        return Ok(());
    }

    let fail = |message: String| Error::Verification {
        function: func.name().to_string(),
        message,
    };

    // position of every placed instruction
    let mut placement: HashMap<ValueId, (BlockId, usize)> = HashMap::new();

    for block in func.blocks() {
        let insts = block.instructions();
        if insts.is_empty() {
            return Err(fail(format!("{} is empty", block.id())));
        }

        let mut phis_done = false;
        for (position, value) in insts.iter().enumerate() {
            let inst = func
                .instruction(*value)
                .ok_or_else(|| fail(format!("{} lists non-instruction {value}", block.id())))?;
            if inst.block != block.id() {
                return Err(fail(format!("{value} placed in {} claims {}", block.id(), inst.block)));
            }
            if placement.insert(*value, (block.id(), position)).is_some() {
                return Err(fail(format!("{value} is placed twice")));
            }

            let is_last = position + 1 == insts.len();
            if inst.kind.is_terminator() != is_last {
                return Err(fail(format!(
                    "{} must end in exactly one terminator ({value} is {})",
                    block.id(),
                    inst.kind.mnemonic()
                )));
            }

            if inst.kind.is_phi() {
                if phis_done {
                    return Err(fail(format!("phi {value} follows a non-phi in {}", block.id())));
                }
            } else {
                phis_done = true;
            }
        }

        for target in func.block_successors(block.id()) {
            if func.block(target).is_none() {
                return Err(fail(format!("{} branches to missing {target}", block.id())));
            }
        }
    }

    let dominators = compute_dominators(func);
    let reachable = |block: BlockId| dominators.is_reachable(NodeId::from(block));

    // def site dominates use site
    let dominates_use = |def: ValueId, use_block: BlockId, use_position: usize| -> bool {
        match func.value(def).map(|data| &data.def) {
            Some(ValueDef::Param(_)) => true,
            Some(ValueDef::Inst(_)) => match placement.get(&def) {
                Some(&(def_block, def_position)) if def_block == use_block => {
                    def_position < use_position
                }
                Some(&(def_block, _)) => {
                    dominators.strictly_dominates(NodeId::from(def_block), NodeId::from(use_block))
                }
                None => false,
            },
            None => false,
        }
    };

    for block in func.blocks() {
        let block_id = block.id();
        let block_reachable = reachable(block_id);
        let predecessors = func.block_predecessors(block_id);

        for (position, value) in block.instructions().iter().enumerate() {
            let Some(inst) = func.instruction(*value) else {
                continue;
            };

            for operand in inst.kind.operands() {
                if let Operand::Value(used) = operand {
                    match func.value(*used) {
                        Some(data) if !data.ty.is_void() => {}
                        Some(_) => {
                            return Err(fail(format!("{value} uses void value {used}")));
                        }
                        None => {
                            return Err(fail(format!("{value} uses undefined value {used}")));
                        }
                    }
                }
            }

            if !block_reachable {
                continue;
            }

            if let InstKind::Phi { incoming } = &inst.kind {
                if incoming.len() != predecessors.len() {
                    return Err(fail(format!(
                        "phi {value} has {} incoming edges, {block_id} has {} predecessors",
                        incoming.len(),
                        predecessors.len()
                    )));
                }
                for (operand, pred) in incoming {
                    if !predecessors.contains(pred) {
                        return Err(fail(format!("phi {value} names non-predecessor {pred}")));
                    }
                    if let Operand::Value(used) = operand {
                        let pred_end = func.block(*pred).map_or(0, |b| b.len());
                        if reachable(*pred) && !dominates_use(*used, *pred, pred_end) {
                            return Err(fail(format!(
                                "{used} does not dominate the end of {pred} for phi {value}"
                            )));
                        }
                    }
                }
                let mut seen: Vec<BlockId> = incoming.iter().map(|(_, b)| *b).collect();
                seen.sort();
                seen.dedup();
                if seen.len() != incoming.len() {
                    return Err(fail(format!("phi {value} names a predecessor twice")));
                }
            } else {
                for operand in inst.kind.operands() {
                    if let Operand::Value(used) = operand {
                        if !dominates_use(*used, block_id, position) {
                            return Err(fail(format!("{used} does not dominate its use in {value}")));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
