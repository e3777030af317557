//! Def→use index over the linearized function: for every value name, the
//! ordered list of instruction positions that read it. Special
//! instructions contribute no uses.

use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{FlowGraph, InstructionRef, Op};

#[derive(Debug, Default)]
pub struct Uses {
    uses: FxHashMap<i32, Vec<InstructionRef>>,
}

impl Uses {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_use(&mut self, variable: i32, reference: InstructionRef) {
        let list = self.uses.entry(variable).or_default();
        let at = list.partition_point(|r| r.pos < reference.pos);
        list.insert(at, reference);
    }

    pub fn analyze(&mut self, cfg: &FlowGraph) {
        self.uses.clear();

        let mut pos = 0i32;
        let mut base_pos = 0i32;
        for id in cfg.block_order() {
            let bb = cfg.block(id);
            for (index, ins) in bb.instructions.iter().enumerate() {
                if ins.is_special() {
                    pos += 1;
                    continue;
                }
                if ins.op == Op::Phi {
                    // Read the full operand list from the side record.
                    if let Some(phi) = bb.phis.get(index) {
                        for &value in &phi.values {
                            self.add_use(value, InstructionRef::new(id, pos, base_pos));
                        }
                        pos += 1;
                        continue;
                    }
                }
                if ins.left != -1 {
                    self.add_use(ins.left, InstructionRef::new(id, pos, base_pos));
                }
                if ins.right != -1 {
                    self.add_use(ins.right, InstructionRef::new(id, pos, base_pos));
                }
                pos += 1;
            }
            base_pos = pos;
        }
    }

    pub fn has_uses(&self, variable: i32) -> bool {
        self.uses.contains_key(&variable)
    }

    /// Uses of `variable`, ordered by position.
    pub fn get_uses(&self, variable: i32) -> &[InstructionRef] {
        self.uses.get(&variable).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The first use of `variable` at or after `pos`, or -1.
    pub fn find_next_use(&self, variable: i32, pos: i32) -> i32 {
        let Some(list) = self.uses.get(&variable) else {
            return -1;
        };
        let at = list.partition_point(|r| r.pos < pos);
        match list.get(at) {
            Some(reference) => reference.pos,
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    fn two_block_cfg() -> FlowGraph {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let b = cfg.block_mut(bb1);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1001, TYPE_I64, 1, Op::Constant));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Add));
        let b = cfg.block_mut(bb2);
        b.add_instruction(Instruction::new(1003, TYPE_I64, 1002, 1000, Op::Add));
        b.add_instruction(Instruction::new(1004, TYPE_I64, 1003, -1, Op::Copy));
        cfg
    }

    #[test]
    fn test_uses_are_ordered() {
        let mut uses = Uses::new();
        uses.analyze(&two_block_cfg());
        let list = uses.get_uses(1000);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].pos, 2);
        assert_eq!(list[1].pos, 3);
        // Position 3 is the first instruction of the second block.
        assert_eq!(list[1].adjusted(), 0);
    }

    #[test]
    fn test_find_next_use() {
        let mut uses = Uses::new();
        uses.analyze(&two_block_cfg());
        assert_eq!(uses.find_next_use(1000, 0), 2);
        assert_eq!(uses.find_next_use(1000, 3), 3);
        assert_eq!(uses.find_next_use(1000, 4), -1);
        assert_eq!(uses.find_next_use(1002, 0), 3);
        assert_eq!(uses.find_next_use(9999, 0), -1);
    }

    #[test]
    fn test_special_instructions_have_no_uses() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        // A call's left slot is its argument count, not a value name.
        b.add_instruction(Instruction::new(1001, TYPE_I64, 1, 0, Op::Call));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, -1, Op::Arg));
        let mut uses = Uses::new();
        uses.analyze(&cfg);
        assert!(uses.has_uses(1000));
        assert!(!uses.has_uses(1));
        assert_eq!(uses.get_uses(1000)[0].pos, 2);
    }
}
