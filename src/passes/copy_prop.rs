//! Copy propagation: fold `x = y` into every consumer of `x` and erase
//! the copy. A copy is left alone when any consumer is a special
//! instruction or a phi, since those do not read their slots as plain
//! value names.

use crate::analysis::uses::Uses;
use crate::common::fx_hash::FxHashSet;
use crate::ir::ir::{FlowGraph, FunctionAttributes, Module, Op};

pub fn run(module: &mut Module) -> usize {
    let mut folded = 0;
    for function in &mut module.functions {
        if function.has_attribute(FunctionAttributes::EXTERN) {
            continue;
        }
        folded += run_function(&mut function.cfg);
    }
    folded
}

pub fn run_function(cfg: &mut FlowGraph) -> usize {
    let mut uses = Uses::new();
    uses.analyze(cfg);

    // Names appearing as phi operands must keep their definitions.
    let mut phi_operands: FxHashSet<i32> = FxHashSet::default();
    for id in cfg.block_order() {
        for phi in &cfg.block(id).phis {
            phi_operands.extend(phi.values.iter().copied());
        }
    }

    let mut folded = 0;
    for id in cfg.block_order() {
        for index in 0..cfg.block(id).instructions.len() {
            let ins = cfg.block(id).instructions[index];
            if ins.op != Op::Copy || ins.name == -1 {
                continue;
            }
            let name = ins.name;
            let source = ins.left;
            if name == source || !uses.has_uses(name) || phi_operands.contains(&name) {
                continue;
            }
            if propagate(cfg, &uses, name, source) {
                cfg.block_mut(id).instructions[index].name = -1;
                folded += 1;
            }
        }
    }

    cfg.compact();
    folded
}

fn propagate(cfg: &mut FlowGraph, uses: &Uses, name: i32, source: i32) -> bool {
    for reference in uses.get_uses(name) {
        let ins = cfg.block(reference.block).instructions[reference.adjusted()];
        if ins.is_special() || ins.op == Op::Phi {
            return false;
        }
    }

    for reference in uses.get_uses(name) {
        let ins = &mut cfg.block_mut(reference.block).instructions[reference.adjusted()];
        if ins.left == name {
            ins.left = source;
        }
        if ins.right == name {
            ins.right = source;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    #[test]
    fn test_copy_folds_into_consumer() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Copy));
        b.add_instruction(Instruction::new(2, TYPE_I64, 1, 1, Op::Add));
        b.add_instruction(Instruction::new(3, TYPE_I64, 2, -1, Op::Return));

        let folded = run_function(&mut cfg);
        assert_eq!(folded, 1);
        let ins: Vec<Instruction> = cfg.block(bb).instructions.clone();
        assert_eq!(ins.len(), 3);
        assert_eq!(ins[1].op, Op::Add);
        assert_eq!(ins[1].left, 0);
        assert_eq!(ins[1].right, 0);
    }

    #[test]
    fn test_copy_feeding_phi_is_kept() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        cfg.set_branch(bb1, Some(bb3), false);

        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Copy));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::with_imm(4, TYPE_I64, 1, Op::Constant));

        let mut phi = Phi::new(2, TYPE_I64);
        phi.add_value(4, bb2);
        phi.add_value(1, bb1);
        cfg.block_mut(bb3).add_phi(phi);
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(2, TYPE_I64, 4, 1, Op::Phi));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(3, TYPE_I64, 2, -1, Op::Return));

        let folded = run_function(&mut cfg);
        assert_eq!(folded, 0);
        assert_eq!(cfg.block(bb1).instructions.len(), 2);
    }

    #[test]
    fn test_unused_copy_left_for_dce() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, -1, Op::Copy));
        b.add_instruction(Instruction::new(2, TYPE_VOID, -1, -1, Op::Return));

        let folded = run_function(&mut cfg);
        assert_eq!(folded, 0);
        assert_eq!(cfg.block(bb).instructions.len(), 3);
    }
}
