//! Linear register allocator.
//!
//! Treats the whole CFG as one linear sequence in block order, which
//! keeps allocation to a couple of simple loops at the cost of less
//! precise spilling than the coloring allocator. Per-register expiry
//! positions free registers as ranges end; when no register of the
//! required class is free, the occupant whose next use lies farthest in
//! the future is evicted.
//!
//! Spill records are keyed at the spilled value's definition (the store
//! happens right after the value is produced) and restore records at each
//! later use, the same shapes the coloring allocator emits.

use crate::analysis::live::LiveRange;
use crate::analysis::uses::Uses;
use crate::common::error::{CompileError, CompileResult};
use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{FlowGraph, Module, Op};
use crate::regalloc::stack::StackAllocator;
use crate::regalloc::{
    class_of_type, Allocator, RegClass, RegisterFile, RestoreRecord, SpillRecord,
};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: i32,
    end: i32,
    register: usize,
}

pub struct LinearAllocator {
    file: RegisterFile,
    stack: StackAllocator,
    occupant: Vec<i32>,
    expiry: Vec<i32>,
    register_map: FxHashMap<i32, usize>,
    intervals: FxHashMap<i32, Vec<Interval>>,
    spills: FxHashMap<i32, Vec<SpillRecord>>,
    restores: FxHashMap<i32, Vec<RestoreRecord>>,
    registers_set: Vec<bool>,
}

impl LinearAllocator {
    pub fn new(file: RegisterFile) -> Self {
        let num = file.num_registers();
        Self {
            file,
            stack: StackAllocator::new(),
            occupant: vec![-1; num],
            expiry: vec![0; num],
            register_map: FxHashMap::default(),
            intervals: FxHashMap::default(),
            spills: FxHashMap::default(),
            restores: FxHashMap::default(),
            registers_set: vec![false; num],
        }
    }

    fn free_registers(&mut self, pos: i32) {
        for r in 0..self.occupant.len() {
            if self.occupant[r] != -1 && self.expiry[r] < pos {
                self.register_map.remove(&self.occupant[r]);
                self.occupant[r] = -1;
            }
        }
    }

    /// A free register of the class, or the one whose occupant's next use
    /// is farthest away after evicting it.
    fn acquire_register(
        &mut self,
        class: RegClass,
        pos: i32,
        uses: &Uses,
    ) -> CompileResult<usize> {
        let candidates = self.file.allocatable(class);
        if candidates.is_empty() {
            return Err(CompileError::Allocator(format!(
                "no allocatable registers in class {:?}",
                class
            )));
        }
        for &r in &candidates {
            if self.occupant[r] == -1 {
                return Ok(r);
            }
        }

        let mut victim = candidates[0];
        let mut farthest = -1i64;
        for &r in &candidates {
            let next = uses.find_next_use(self.occupant[r], pos + 1);
            let distance = if next == -1 { i64::MAX } else { next as i64 };
            if distance > farthest {
                farthest = distance;
                victim = r;
            }
        }

        let name = self.occupant[victim];
        let has_future_use = uses.find_next_use(name, pos + 1) != -1;
        if has_future_use && self.stack.find_slot(name) == -1 {
            let slot = self.stack.allocate_slot(name, 8);
            // The value is stored out right where it was produced.
            if let Some(intervals) = self.intervals.get(&name) {
                let interval = *intervals.last().unwrap();
                self.spills.entry(interval.start).or_default().push(SpillRecord {
                    register: interval.register,
                    name,
                    slot,
                });
            }
        }
        if let Some(intervals) = self.intervals.get_mut(&name) {
            if let Some(interval) = intervals.last_mut() {
                interval.end = interval.end.min(pos - 1);
            }
        }
        self.register_map.remove(&name);
        self.occupant[victim] = -1;
        Ok(victim)
    }

    fn assign(&mut self, name: i32, register: usize, start: i32, end: i32) {
        self.occupant[register] = name;
        self.expiry[register] = end;
        self.register_map.insert(name, register);
        self.intervals
            .entry(name)
            .or_default()
            .push(Interval { start, end, register });
        self.registers_set[register] = true;
    }
}

impl Allocator for LinearAllocator {
    fn allocate(&mut self, module: &Module, cfg: &mut FlowGraph) -> CompileResult<()> {
        let mut live_range = LiveRange::new();
        live_range.compute(cfg);
        let mut uses = Uses::new();
        uses.analyze(cfg);

        // The class a name lives in, from its defining instruction.
        let mut classes: FxHashMap<i32, RegClass> = FxHashMap::default();
        for id in cfg.block_order() {
            for ins in &cfg.block(id).instructions {
                if ins.name == -1 || matches!(ins.op, Op::Br | Op::Cmp | Op::Arg | Op::Return) {
                    continue;
                }
                if let Some(class) = class_of_type(module, ins.ty) {
                    classes.insert(ins.name, class);
                }
            }
        }

        let mut pos = 0i32;
        for id in cfg.block_order() {
            for index in 0..cfg.block(id).instructions.len() {
                let ins = cfg.block(id).instructions[index];
                self.free_registers(pos);

                // Reload spilled operands ahead of the instruction.
                if !ins.is_special() {
                    for operand in [ins.left, ins.right] {
                        if operand == -1 || self.register_map.contains_key(&operand) {
                            continue;
                        }
                        let slot = self.stack.find_slot(operand);
                        if slot == -1 {
                            continue;
                        }
                        let class = classes
                            .get(&operand)
                            .copied()
                            .unwrap_or(RegClass::General);
                        let register = self.acquire_register(class, pos, &uses)?;
                        self.restores.entry(pos).or_default().push(RestoreRecord {
                            register,
                            name: operand,
                            slot,
                        });
                        self.assign(operand, register, pos, pos);
                    }
                }

                match ins.op {
                    Op::Br | Op::Cmp | Op::Arg | Op::Return | Op::Store => {
                        pos += 1;
                        continue;
                    }
                    Op::Alloca => {
                        let ty = module.type_of(ins.ty);
                        let elements = ins.left.max(1);
                        let size = if ty.is_pointer || ty.is_array {
                            module.type_of(ty.base_type).size
                        } else {
                            8
                        };
                        self.stack.allocate_slot(ins.name, size * elements);
                        pos += 1;
                        continue;
                    }
                    _ => {}
                }
                let Some(class) = class_of_type(module, ins.ty) else {
                    pos += 1;
                    continue;
                };

                // A redefinition of a still-live name (a coalesced web
                // after SSA destruction) keeps its register so every
                // definition of the name lands in one place.
                let register = match self.register_map.get(&ins.name) {
                    Some(&register) => register,
                    None => self.acquire_register(class, pos, &uses)?,
                };
                let end = pos + live_range.get_live_range(pos as usize);
                self.assign(ins.name, register, pos, end);

                // A redefinition of a name that already lives in a slot
                // must keep the slot current.
                let slot = self.stack.find_slot(ins.name);
                if slot != -1 {
                    self.spills.entry(pos).or_default().push(SpillRecord {
                        register,
                        name: ins.name,
                        slot,
                    });
                }
                pos += 1;
            }
        }
        trace!(stack_slots = self.stack.num_slots(), "linear allocation complete");
        Ok(())
    }

    fn register_for(&self, name: i32, pos: i32) -> i32 {
        if let Some(intervals) = self.intervals.get(&name) {
            for interval in intervals {
                if interval.start <= pos && pos <= interval.end {
                    return interval.register as i32;
                }
            }
        }
        if let Some(restores) = self.restores.get(&pos) {
            for r in restores {
                if r.name == name {
                    return r.register as i32;
                }
            }
        }
        if let Some(spills) = self.spills.get(&pos) {
            for s in spills {
                if s.name == name {
                    return s.register as i32;
                }
            }
        }
        -1
    }

    fn slot_for(&self, name: i32) -> i32 {
        self.stack.find_slot(name)
    }

    fn spills_at(&self, pos: i32) -> &[SpillRecord] {
        self.spills.get(&pos).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn restores_at(&self, pos: i32) -> &[RestoreRecord] {
        self.restores.get(&pos).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn registers_used(&self) -> &[bool] {
        &self.registers_set
    }

    fn stack_size(&self) -> i32 {
        self.stack.num_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    fn general_file(count: usize) -> RegisterFile {
        let mut file = RegisterFile::new(count);
        for i in 0..count {
            file.set_volatile(i, false);
            file.set_class(i, RegClass::General);
        }
        file
    }

    #[test]
    fn test_allocates_distinct_registers_for_live_values() {
        let module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(2, TYPE_I64, 0, 1, Op::Add));

        let mut alloc = LinearAllocator::new(general_file(4));
        alloc.allocate(&module, &mut cfg).unwrap();
        let r0 = alloc.register_for(0, 2);
        let r1 = alloc.register_for(1, 2);
        assert_ne!(r0, -1);
        assert_ne!(r1, -1);
        assert_ne!(r0, r1);
        assert_eq!(alloc.stack_size(), 0);
    }

    #[test]
    fn test_expired_registers_are_reused() {
        let module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1, TYPE_I64, 0, 0, Op::Add));
        b.add_instruction(Instruction::new(2, TYPE_I64, 1, 1, Op::Add));
        b.add_instruction(Instruction::new(3, TYPE_I64, 2, 2, Op::Add));

        let mut alloc = LinearAllocator::new(general_file(2));
        alloc.allocate(&module, &mut cfg).unwrap();
        // Name 0 dies at position 1, so its register is free again for
        // name 2.
        assert_eq!(alloc.register_for(0, 1), alloc.register_for(2, 2));
        assert_eq!(alloc.stack_size(), 0);
    }

    #[test]
    fn test_spills_when_out_of_registers() {
        let module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        // Three values live at once with only two registers.
        b.add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(2, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(3, TYPE_I64, 1, 2, Op::Add));
        b.add_instruction(Instruction::new(4, TYPE_I64, 3, 0, Op::Add));

        let mut alloc = LinearAllocator::new(general_file(2));
        alloc.allocate(&module, &mut cfg).unwrap();

        // Something was pushed to the stack and later restored.
        assert!(alloc.stack_size() > 0);
        let spilled: Vec<i32> = (0..5)
            .flat_map(|p| alloc.spills_at(p).iter().map(|s| s.name))
            .collect();
        assert!(!spilled.is_empty());
        // Name 0 has the farthest next use, so it is the eviction victim,
        // stored at its definition and restored at its use.
        assert_eq!(spilled, vec![0]);
        assert_eq!(alloc.spills_at(0)[0].name, 0);
        let restore = alloc.restores_at(4);
        assert_eq!(restore.len(), 1);
        assert_eq!(restore[0].name, 0);
        assert_ne!(alloc.register_for(0, 4), -1);
    }

    #[test]
    fn test_alloca_reserves_slot_without_register() {
        let mut module = Module::new();
        let ptr = module.get_pointer_type(TYPE_I64);
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        cfg.block_mut(bb)
            .add_instruction(Instruction::new(0, ptr, 1, -1, Op::Alloca));

        let mut alloc = LinearAllocator::new(general_file(2));
        alloc.allocate(&module, &mut cfg).unwrap();
        assert_eq!(alloc.slot_for(0), 0);
        assert_eq!(alloc.register_for(0, 0), -1);
        assert_eq!(alloc.stack_size(), 1);
    }

    #[test]
    fn test_fails_without_allocatable_registers() {
        let module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        cfg.block_mut(bb)
            .add_instruction(Instruction::with_imm(0, TYPE_I64, 0, Op::Constant));

        // Every register is volatile: nothing to assign from.
        let mut alloc = LinearAllocator::new(RegisterFile::new(4));
        assert!(alloc.allocate(&module, &mut cfg).is_err());
    }
}
