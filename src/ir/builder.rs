//! IR construction helpers: one `emit_*` method per operation, each
//! appending to a chosen block and returning the new value name. Names
//! come from a per-function counter owned by the builder.

use crate::ir::ir::*;

pub struct Builder<'a> {
    pub module: &'a mut Module,
    counter: i32,
}

impl<'a> Builder<'a> {
    pub fn new(module: &'a mut Module) -> Self {
        Self { module, counter: 0 }
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn fresh(&mut self) -> i32 {
        let name = self.counter;
        self.counter += 1;
        name
    }

    fn push(&mut self, cfg: &mut FlowGraph, bb: BlockId, ins: Instruction) -> i32 {
        let name = ins.name;
        cfg.block_mut(bb).add_instruction(ins);
        name
    }

    pub fn emit_constant_i64(&mut self, cfg: &mut FlowGraph, bb: BlockId, value: i64) -> i32 {
        let id = self.module.constants.intern_i64(value);
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_imm(name, TYPE_I64, id, Op::Constant))
    }

    pub fn emit_constant_f64(&mut self, cfg: &mut FlowGraph, bb: BlockId, value: f64) -> i32 {
        let id = self.module.constants.intern_f64(value);
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_imm(name, TYPE_F64, id, Op::Constant))
    }

    /// A constant of an arbitrary primitive type from an interned pool id.
    pub fn emit_constant(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, id: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_imm(name, ty, id, Op::Constant))
    }

    pub fn emit_binop(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        op: Op,
        ty: TypeId,
        left: i32,
        right: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, left, right, op))
    }

    pub fn emit_unary_minus(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, value: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, value, -1, Op::UnaryMinus))
    }

    pub fn emit_cmp(&mut self, cfg: &mut FlowGraph, bb: BlockId, left: i32, right: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, TYPE_BOOLEAN, left, right, Op::Cmp))
    }

    pub fn emit_br(&mut self, cfg: &mut FlowGraph, bb: BlockId, jump: Jump) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, TYPE_VOID, jump as i32, -1, Op::Br))
    }

    pub fn emit_call(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        ret: TypeId,
        num_args: i32,
        symbol: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ret, num_args, symbol, Op::Call))
    }

    pub fn emit_arg(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, value: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, value, -1, Op::Arg))
    }

    pub fn emit_return(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, value: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, value, -1, Op::Return))
    }

    pub fn emit_param(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, index: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_imm(name, ty, index, Op::Param))
    }

    pub fn emit_alloca(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, elements: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, elements, -1, Op::Alloca))
    }

    pub fn emit_ptr(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        ty: TypeId,
        base: i32,
        offset: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_offset(name, ty, base, -1, offset, Op::Ptr))
    }

    pub fn emit_element_ptr(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        ty: TypeId,
        base: i32,
        index: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, base, index, Op::ElementPtr))
    }

    pub fn emit_load(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, ptr: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, ptr, -1, Op::Load))
    }

    pub fn emit_store(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        ty: TypeId,
        ptr: i32,
        value: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, ptr, value, Op::Store))
    }

    pub fn emit_load_global(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, global: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_imm(name, ty, global, Op::LoadGlobal))
    }

    pub fn emit_store_global(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        ty: TypeId,
        value: i32,
        global: i32,
    ) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_offset(name, ty, value, -1, global, Op::StoreGlobal))
    }

    pub fn emit_copy(&mut self, cfg: &mut FlowGraph, bb: BlockId, ty: TypeId, value: i32) -> i32 {
        let name = self.fresh();
        self.push(cfg, bb, Instruction::new(name, ty, value, -1, Op::Copy))
    }

    /// A widening/narrowing or class conversion; the source type travels
    /// in the immediate slot.
    pub fn emit_conversion(
        &mut self,
        cfg: &mut FlowGraph,
        bb: BlockId,
        op: Op,
        dst_ty: TypeId,
        src_ty: TypeId,
        value: i32,
    ) -> i32 {
        debug_assert!(matches!(
            op,
            Op::SignExtend | Op::ZeroExtend | Op::BitwiseCast | Op::Convert
        ));
        let name = self.fresh();
        self.push(cfg, bb, Instruction::with_offset(name, dst_ty, value, -1, src_ty, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_names_are_sequential() {
        let mut module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let mut builder = Builder::new(&mut module);
        let a = builder.emit_constant_i64(&mut cfg, bb, 1);
        let b = builder.emit_constant_i64(&mut cfg, bb, 2);
        let c = builder.emit_binop(&mut cfg, bb, Op::Add, TYPE_I64, a, b);
        assert_eq!((a, b, c), (0, 1, 2));
        let block = cfg.block(bb);
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(block.instructions[2].left, a);
        assert_eq!(block.instructions[2].right, b);
    }

    #[test]
    fn test_constants_are_pooled() {
        let mut module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let mut builder = Builder::new(&mut module);
        builder.emit_constant_i64(&mut cfg, bb, 5);
        builder.emit_constant_i64(&mut cfg, bb, 5);
        let block = cfg.block(bb);
        assert_eq!(block.instructions[0].imm, block.instructions[1].imm);
    }
}
