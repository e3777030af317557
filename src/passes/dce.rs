//! Dead-code elimination.
//!
//! Walks the CFG depth-first, eliminating within each block after all of
//! its successors have been processed. The live-name set is seeded from
//! every phi operand and from the operands of side-effecting instructions
//! (compares, returns, call arguments, branches, loads, stores, calls);
//! scanning a block backward, an instruction with no side effects whose
//! name is not live is removed and contributes nothing.

use crate::analysis::dom::Dom;
use crate::common::fx_hash::FxHashSet;
use crate::ir::ir::{FlowGraph, FunctionAttributes, Module, Op};

pub fn run(module: &mut Module) -> usize {
    let mut removed = 0;
    for function in &mut module.functions {
        if function.has_attribute(FunctionAttributes::EXTERN) {
            continue;
        }
        removed += run_function(&mut function.cfg);
    }
    removed
}

pub fn run_function(cfg: &mut FlowGraph) -> usize {
    if cfg.first().is_none() {
        return 0;
    }
    let mut dom = Dom::new();
    dom.compute(cfg);
    let mut dce = Dce::default();
    dce.eliminate(cfg, &dom, dom.start())
}

fn has_side_effects(op: Op) -> bool {
    matches!(
        op,
        Op::Cmp | Op::Return | Op::Arg | Op::Br | Op::Load | Op::Store | Op::Call
    )
}

#[derive(Default)]
struct Dce {
    used_names: FxHashSet<i32>,
    visited: FxHashSet<usize>,
}

impl Dce {
    fn eliminate(&mut self, cfg: &mut FlowGraph, dom: &Dom, node: usize) -> usize {
        self.visited.insert(node);
        let id = dom.get(node).block();

        // Phi operands are uses on the incoming edges.
        for phi in &cfg.block(id).phis {
            for &value in &phi.values {
                self.used_names.insert(value);
            }
        }

        let mut removed = 0;
        for i in 0..dom.get(node).successors().len() {
            let succ = dom.get(node).successors()[i];
            if !self.visited.contains(&succ) {
                removed += self.eliminate(cfg, dom, succ);
            }
        }

        let bb = cfg.block_mut(id);
        let mut pos = bb.instructions.len() as i32 - 1;
        while pos >= 0 {
            let ins = bb.instructions[pos as usize];
            let keep = has_side_effects(ins.op) || self.used_names.contains(&ins.name);
            if !keep {
                if ins.op == Op::Phi {
                    if let Some(index) = bb.phis.iter().position(|p| p.name == ins.name) {
                        bb.phis.remove(index);
                    }
                }
                bb.remove_instruction(pos as usize);
                removed += 1;
                pos -= 1;
                continue;
            }
            if !ins.is_special() && ins.op != Op::Phi {
                if ins.left != -1 {
                    self.used_names.insert(ins.left);
                }
                if ins.right != -1 {
                    self.used_names.insert(ins.right);
                }
            }
            pos -= 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    #[test]
    fn test_removes_unused_instruction() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1, TYPE_I64, 1, Op::Constant));
        // Only name 0 flows into the return.
        b.add_instruction(Instruction::new(2, TYPE_I64, 0, -1, Op::Return));

        let removed = run_function(&mut cfg);
        assert_eq!(removed, 1);
        let ops: Vec<i32> = cfg.block(bb).instructions.iter().map(|i| i.name).collect();
        assert_eq!(ops, vec![0, 2]);
    }

    #[test]
    fn test_keeps_side_effecting_instructions() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(2, TYPE_I64, 0, 1, Op::Store));
        b.add_instruction(Instruction::new(3, TYPE_BOOLEAN, 0, 1, Op::Cmp));
        b.add_instruction(Instruction::new(4, TYPE_VOID, 0, -1, Op::Br));
        b.add_instruction(Instruction::new(5, TYPE_VOID, -1, -1, Op::Return));

        let removed = run_function(&mut cfg);
        assert_eq!(removed, 0);
        assert_eq!(cfg.block(bb).instructions.len(), 6);
    }

    #[test]
    fn test_dead_chain_is_removed_bottom_up() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, 0, Op::Add));
        b.add_instruction(Instruction::new(2, TYPE_I64, 1, 1, Op::Mul));
        b.add_instruction(Instruction::new(3, TYPE_VOID, -1, -1, Op::Return));

        let removed = run_function(&mut cfg);
        // The whole chain is dead: the multiply, the add, the constant.
        assert_eq!(removed, 3);
        assert_eq!(cfg.block(bb).instructions.len(), 1);
    }

    #[test]
    fn test_phi_operands_stay_live() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        cfg.set_branch(bb1, Some(bb3), false);

        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::with_imm(1, TYPE_I64, 1, Op::Constant));

        let mut phi = Phi::new(2, TYPE_I64);
        phi.add_value(1, bb2);
        phi.add_value(0, bb1);
        cfg.block_mut(bb3).add_phi(phi);
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(2, TYPE_I64, 1, 0, Op::Phi));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(3, TYPE_I64, 2, -1, Op::Return));

        let removed = run_function(&mut cfg);
        assert_eq!(removed, 0);
        assert_eq!(cfg.block(bb1).instructions.len(), 1);
        assert_eq!(cfg.block(bb2).instructions.len(), 1);
    }

    #[test]
    fn test_unused_phi_is_removed_with_its_record() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        cfg.set_branch(bb1, Some(bb3), false);

        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(0, TYPE_I64, -1, -1, Op::Param));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1, TYPE_I64, 0, 0, Op::Add));

        let mut phi = Phi::new(2, TYPE_I64);
        phi.add_value(1, bb2);
        phi.add_value(0, bb1);
        cfg.block_mut(bb3).add_phi(phi);
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(2, TYPE_I64, 1, 0, Op::Phi));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(3, TYPE_VOID, -1, -1, Op::Return));

        run_function(&mut cfg);
        assert!(cfg.block(bb3).phis.is_empty());
        assert!(cfg.block(bb3).instructions.iter().all(|i| i.op != Op::Phi));
    }
}
