//! IR to x86-64 lowering.
//!
//! Walks the allocated function in linear order and selects an encoding
//! per opcode: operand registers come from the allocator, restores are
//! placed ahead of each instruction and spills behind it, and the
//! calling convention (System-V or Windows) decides argument registers,
//! shadow space, and stack-argument offsets. Frames are RSP-relative:
//! pushes for the used callee-saved GPRs, one `sub rsp` covering
//! outgoing arguments, spill slots, and XMM saves.

use crate::backend::image::DataLayout;
use crate::backend::x86::minst::{MBlock, MFunction, MInst, MJump, MOp, Operand, Width};
use crate::backend::x86::regs::{file_reg, FileReg, Reg, Target, TargetOs};
use crate::common::error::{CompileError, CompileResult};
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::{
    is_float_type, BlockId, FlowGraph, Function, Instruction, Jump, Module, Op, TypeId,
    TYPE_BOOLEAN, TYPE_NULLPTR, TYPE_U16, TYPE_U32, TYPE_U64, TYPE_U8, TYPE_VOID,
};
use crate::regalloc::{Allocator, RestoreRecord, SpillRecord};

/// Scratch registers owned by the lowering itself; the allocators never
/// hand these out.
const SCRATCH1: Reg = Reg::R10;
const SCRATCH2: Reg = Reg::R11;
const SSE_SCRATCH: u8 = 4;

#[derive(Debug, Default)]
struct Frame {
    saved_gprs: Vec<Reg>,
    saved_xmms: Vec<u8>,
    /// Byte size of the `sub rsp` adjustment.
    total: i32,
    /// Base of the spill-slot area, above the outgoing argument area.
    slot_base: i32,
    /// Base of the XMM save area.
    xmm_base: i32,
}

impl Frame {
    fn slot_offset(&self, slot: i32) -> i32 {
        self.slot_base + slot * 8
    }

    fn incoming_offset(&self, k: i32, shadow: i32) -> i32 {
        self.total + self.saved_gprs.len() as i32 * 8 + 8 + shadow + k * 8
    }
}

pub fn lower_function(
    module: &Module,
    function: &Function,
    cfg: &FlowGraph,
    alloc: &dyn Allocator,
    target: &Target,
    data: &DataLayout,
) -> CompileResult<MFunction> {
    let mut lowering = Lower::new(module, function, cfg, alloc, target, data);
    lowering.run()?;
    Ok(lowering.mfunc)
}

struct Lower<'a> {
    module: &'a Module,
    function: &'a Function,
    cfg: &'a FlowGraph,
    alloc: &'a dyn Allocator,
    target: &'a Target,
    data: &'a DataLayout,
    mfunc: MFunction,
    frame: Frame,
    types: FxHashMap<i32, TypeId>,
    alloca_names: FxHashSet<i32>,
    last_cmp_unsigned: bool,
}

fn is_unsigned_type(module: &Module, ty: TypeId) -> bool {
    matches!(ty, TYPE_U8 | TYPE_U16 | TYPE_U32 | TYPE_U64 | TYPE_BOOLEAN | TYPE_NULLPTR)
        || module.type_of(ty).is_pointer
        || module.type_of(ty).is_array
}

impl<'a> Lower<'a> {
    fn new(
        module: &'a Module,
        function: &'a Function,
        cfg: &'a FlowGraph,
        alloc: &'a dyn Allocator,
        target: &'a Target,
        data: &'a DataLayout,
    ) -> Self {
        let mut types = FxHashMap::default();
        let mut alloca_names = FxHashSet::default();
        for id in cfg.block_order() {
            for ins in &cfg.block(id).instructions {
                if ins.name != -1 {
                    types.insert(ins.name, ins.ty);
                }
                if ins.op == Op::Alloca {
                    alloca_names.insert(ins.name);
                }
            }
        }
        Self {
            module,
            function,
            cfg,
            alloc,
            target,
            data,
            mfunc: MFunction::new(function.full_name.clone()),
            frame: Frame::default(),
            types,
            alloca_names,
            last_cmp_unsigned: false,
        }
    }

    fn emit(&mut self, inst: MInst) {
        self.mfunc.blocks.last_mut().unwrap().insts.push(inst);
    }

    fn width_of(&self, ty: TypeId) -> Width {
        Width::from_size(self.module.type_of(ty).size)
    }

    /// Sub-32-bit arithmetic runs at 32 bits; the low bits are what the
    /// typed compares and stores read.
    fn op_width(&self, ty: TypeId) -> Width {
        match self.width_of(ty) {
            Width::B8 | Width::B16 | Width::B32 => Width::B32,
            Width::B64 => Width::B64,
        }
    }

    fn gpr_of(&self, name: i32, pos: i32) -> CompileResult<Reg> {
        let index = self.alloc.register_for(name, pos);
        if index < 0 {
            return Err(CompileError::Internal(format!(
                "value {} has no register at position {}",
                name, pos
            )));
        }
        match file_reg(index as usize) {
            FileReg::Gpr(reg) => Ok(reg),
            FileReg::Xmm(_) => Err(CompileError::Internal(format!(
                "value {} expected in a general register",
                name
            ))),
        }
    }

    fn xmm_of(&self, name: i32, pos: i32) -> CompileResult<u8> {
        let index = self.alloc.register_for(name, pos);
        if index < 0 {
            return Err(CompileError::Internal(format!(
                "value {} has no register at position {}",
                name, pos
            )));
        }
        match file_reg(index as usize) {
            FileReg::Xmm(xmm) => Ok(xmm),
            FileReg::Gpr(_) => Err(CompileError::Internal(format!(
                "value {} expected in an SSE register",
                name
            ))),
        }
    }

    fn dest_gpr(&self, ins: &Instruction, pos: i32) -> Option<Reg> {
        let index = self.alloc.register_for(ins.name, pos);
        if index < 0 {
            return None;
        }
        match file_reg(index as usize) {
            FileReg::Gpr(reg) => Some(reg),
            FileReg::Xmm(_) => None,
        }
    }

    fn dest_xmm(&self, ins: &Instruction, pos: i32) -> Option<u8> {
        let index = self.alloc.register_for(ins.name, pos);
        if index < 0 {
            return None;
        }
        match file_reg(index as usize) {
            FileReg::Xmm(xmm) => Some(xmm),
            FileReg::Gpr(_) => None,
        }
    }

    fn run(&mut self) -> CompileResult<()> {
        self.compute_frame();

        // Prologue in its own unlabeled block so branches to the entry
        // block do not re-run it.
        self.mfunc.blocks.push(MBlock::default());
        self.emit_prologue();

        let order = self.cfg.block_order();
        let mut pos = 0i32;
        for &id in &order {
            self.mfunc.blocks.push(MBlock { id: Some(id), ..Default::default() });
            pos = self.lower_block(id, pos)?;
        }
        Ok(())
    }

    fn lower_block(&mut self, id: BlockId, mut pos: i32) -> CompileResult<i32> {
        let cfg = self.cfg;
        let bb = cfg.block(id);
        let mut skip_args = 0usize;
        for (index, ins) in bb.instructions.iter().enumerate() {
            if skip_args > 0 && ins.op == Op::Arg {
                skip_args -= 1;
                pos += 1;
                continue;
            }
            for restore in self.alloc.restores_at(pos).to_vec() {
                self.emit_restore(&restore);
            }
            if ins.op == Op::Call {
                skip_args = self.lower_call(ins, pos, bb.instructions.get(index + 1..))?;
            } else {
                self.lower_ins(ins, pos, id)?;
            }
            for spill in self.alloc.spills_at(pos).to_vec() {
                self.emit_spill(&spill);
            }
            pos += 1;
        }
        Ok(pos)
    }

    fn compute_frame(&mut self) {
        let used: Vec<bool> = self.alloc.registers_used().to_vec();
        for (index, used) in used.into_iter().enumerate() {
            if !used {
                continue;
            }
            match file_reg(index) {
                FileReg::Gpr(reg) => self.frame.saved_gprs.push(reg),
                FileReg::Xmm(xmm) => self.frame.saved_xmms.push(xmm),
            }
        }

        let mut outgoing = 0i32;
        let mut any_calls = false;
        for id in self.cfg.block_order() {
            let bb = self.cfg.block(id);
            for (index, ins) in bb.instructions.iter().enumerate() {
                if ins.op != Op::Call && ins.op != Op::Malloc {
                    continue;
                }
                any_calls = true;
                if ins.op != Op::Call {
                    continue;
                }
                let nargs = ins.left.max(0) as usize;
                let mut overflow = 0i32;
                let mut int_count = 0usize;
                let mut sse_count = 0usize;
                for arg in bb.instructions.iter().skip(index + 1).take(nargs) {
                    let overflowing = match self.target.os {
                        TargetOs::Windows => {
                            int_count + sse_count >= self.target.int_arg_regs().len()
                        }
                        TargetOs::Linux => {
                            if is_float_type(arg.ty) {
                                sse_count >= self.target.max_sse_args()
                            } else {
                                int_count >= self.target.int_arg_regs().len()
                            }
                        }
                    };
                    if is_float_type(arg.ty) {
                        sse_count += 1;
                    } else {
                        int_count += 1;
                    }
                    if overflowing {
                        overflow += 8;
                    }
                }
                outgoing = outgoing.max(overflow);
            }
        }
        if any_calls {
            outgoing += self.target.shadow_space();
        }

        self.frame.slot_base = outgoing;
        self.frame.xmm_base = outgoing + self.alloc.stack_size() * 8;
        let body = self.frame.xmm_base + self.frame.saved_xmms.len() as i32 * 8;
        // Keep RSP 16-byte aligned at call sites: return address plus
        // pushes plus the adjustment must be a multiple of 16.
        let pushed = self.frame.saved_gprs.len() as i32 * 8 + 8;
        let mut total = body;
        if (pushed + total) % 16 != 0 {
            total += 16 - (pushed + total) % 16;
        }
        self.frame.total = total;
    }

    fn emit_prologue(&mut self) {
        for &reg in &self.frame.saved_gprs.clone() {
            self.emit(MInst::new(MOp::Push, Width::B64, Operand::Gpr(reg), Operand::None));
        }
        if self.frame.total > 0 {
            self.emit(MInst::new(
                MOp::Sub,
                Width::B64,
                Operand::Gpr(Reg::Rsp),
                Operand::Imm(self.frame.total as i64),
            ));
        }
        for (i, &xmm) in self.frame.saved_xmms.clone().iter().enumerate() {
            let disp = self.frame.xmm_base + i as i32 * 8;
            self.emit(MInst::new(
                MOp::Movsd,
                Width::B64,
                Operand::Mem { base: Reg::Rsp, disp },
                Operand::Xmm(xmm),
            ));
        }
    }

    fn emit_epilogue(&mut self) {
        for (i, &xmm) in self.frame.saved_xmms.clone().iter().enumerate() {
            let disp = self.frame.xmm_base + i as i32 * 8;
            self.emit(MInst::new(
                MOp::Movsd,
                Width::B64,
                Operand::Xmm(xmm),
                Operand::Mem { base: Reg::Rsp, disp },
            ));
        }
        if self.frame.total > 0 {
            self.emit(MInst::new(
                MOp::Add,
                Width::B64,
                Operand::Gpr(Reg::Rsp),
                Operand::Imm(self.frame.total as i64),
            ));
        }
        for &reg in self.frame.saved_gprs.clone().iter().rev() {
            self.emit(MInst::new(MOp::Pop, Width::B64, Operand::Gpr(reg), Operand::None));
        }
        self.emit(MInst::nullary(MOp::Ret));
    }

    fn emit_restore(&mut self, restore: &RestoreRecord) {
        let disp = self.frame.slot_offset(restore.slot);
        match file_reg(restore.register) {
            FileReg::Gpr(reg) => self.emit(MInst::new(
                MOp::Mov,
                Width::B64,
                Operand::Gpr(reg),
                Operand::Mem { base: Reg::Rsp, disp },
            )),
            FileReg::Xmm(xmm) => self.emit(MInst::new(
                MOp::Movsd,
                Width::B64,
                Operand::Xmm(xmm),
                Operand::Mem { base: Reg::Rsp, disp },
            )),
        }
    }

    fn emit_spill(&mut self, spill: &SpillRecord) {
        let disp = self.frame.slot_offset(spill.slot);
        match file_reg(spill.register) {
            FileReg::Gpr(reg) => self.emit(MInst::new(
                MOp::Mov,
                Width::B64,
                Operand::Mem { base: Reg::Rsp, disp },
                Operand::Gpr(reg),
            )),
            FileReg::Xmm(xmm) => self.emit(MInst::new(
                MOp::Movsd,
                Width::B64,
                Operand::Mem { base: Reg::Rsp, disp },
                Operand::Xmm(xmm),
            )),
        }
    }

    fn lower_ins(&mut self, ins: &Instruction, pos: i32, id: BlockId) -> CompileResult<()> {
        match ins.op {
            Op::Constant => self.lower_constant(ins, pos),
            Op::Param => self.lower_param(ins, pos),
            Op::Copy => self.lower_copy(ins, pos),
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or => self.lower_binop(ins, pos),
            Op::Div | Op::Modulo => self.lower_div(ins, pos),
            Op::LeftShift | Op::RightShift => self.lower_shift(ins, pos),
            Op::UnaryMinus => self.lower_unary_minus(ins, pos),
            Op::SignExtend | Op::ZeroExtend => self.lower_extend(ins, pos),
            Op::BitwiseCast => self.lower_bitwise_cast(ins, pos),
            Op::Convert => self.lower_convert(ins, pos),
            Op::Cmp => self.lower_cmp(ins, pos),
            Op::Br => self.lower_br(ins, id),
            Op::Return => self.lower_return(ins, pos),
            Op::Load => self.lower_load(ins, pos),
            Op::Store => self.lower_store(ins, pos),
            Op::Ptr => self.lower_ptr(ins, pos),
            Op::ElementPtr => self.lower_element_ptr(ins, pos),
            Op::LoadGlobal => self.lower_load_global(ins, pos),
            Op::StoreGlobal => self.lower_store_global(ins, pos),
            Op::Alloca => Ok(()),
            Op::Malloc => self.lower_malloc(ins, pos),
            Op::Arg => Ok(()),
            Op::Call => unreachable!("calls are lowered with their argument run"),
            Op::Phi => Err(CompileError::Internal(
                "phi instruction survived SSA destruction".to_string(),
            )),
        }
    }

    fn lower_constant(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            let offset = self.data.constant_offset(ins.imm)?;
            let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::RipData { offset }));
            return Ok(());
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let value = self.module.constants.get(ins.imm).as_i64();
        let inst = if self.width_of(ins.ty) == Width::B64 {
            if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
                MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Imm(value))
            } else {
                MInst::new(MOp::MovAbs, Width::B64, Operand::Gpr(dst), Operand::Imm(value))
            }
        } else {
            MInst::new(MOp::Mov, Width::B32, Operand::Gpr(dst), Operand::Imm(value))
        };
        self.emit(inst);
        Ok(())
    }

    fn lower_param(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let index = ins.imm as usize;
        let shadow = self.target.shadow_space();
        let int_regs = self.target.int_arg_regs();

        // System-V assigns integer and floating-point argument registers
        // from independent counters; Windows shares the position.
        let (class_index, overflow_index) = match self.target.os {
            TargetOs::Windows => {
                let over = index as i32 - int_regs.len() as i32;
                (index, over)
            }
            TargetOs::Linux => {
                let mut int_count = 0usize;
                let mut sse_count = 0usize;
                let mut overflow = 0i32;
                let mut class_index = 0usize;
                let mut overflow_index = -1i32;
                for (i, &arg_ty) in self.function.args.iter().enumerate() {
                    let float = is_float_type(arg_ty);
                    let fits = if float {
                        sse_count < self.target.max_sse_args()
                    } else {
                        int_count < int_regs.len()
                    };
                    if i == index {
                        class_index = if float { sse_count } else { int_count };
                        overflow_index = if fits { -1 } else { overflow };
                    }
                    if !fits {
                        overflow += 1;
                    }
                    if float {
                        sse_count += 1;
                    } else {
                        int_count += 1;
                    }
                }
                (class_index, overflow_index)
            }
        };

        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            if overflow_index < 0 && class_index < self.target.max_sse_args() {
                if dst != class_index as u8 {
                    self.emit(MInst::new(
                        MOp::Movsd,
                        Width::B64,
                        Operand::Xmm(dst),
                        Operand::Xmm(class_index as u8),
                    ));
                }
            } else {
                let k = overflow_index.max(0);
                let disp = self.frame.incoming_offset(k, shadow);
                self.emit(MInst::new(
                    MOp::Movsd,
                    Width::B64,
                    Operand::Xmm(dst),
                    Operand::Mem { base: Reg::Rsp, disp },
                ));
            }
            return Ok(());
        }

        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        if overflow_index < 0 && class_index < int_regs.len() {
            let src = int_regs[class_index];
            if src != dst {
                self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(src)));
            }
        } else {
            let k = overflow_index.max(0);
            let disp = self.frame.incoming_offset(k, shadow);
            self.emit(MInst::new(
                MOp::Mov,
                Width::B64,
                Operand::Gpr(dst),
                Operand::Mem { base: Reg::Rsp, disp },
            ));
        }
        Ok(())
    }

    fn lower_copy(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            let src = self.xmm_of(ins.left, pos)?;
            if src != dst {
                let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
                self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::Xmm(src)));
            }
            return Ok(());
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let src = self.gpr_of(ins.left, pos)?;
        if src != dst {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(src)));
        }
        Ok(())
    }

    fn lower_binop(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if is_float_type(ins.ty) {
            return self.lower_float_binop(ins, pos);
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let left = self.gpr_of(ins.left, pos)?;
        let right = self.gpr_of(ins.right, pos)?;
        let w = self.op_width(ins.ty);
        let op = match ins.op {
            Op::Add => MOp::Add,
            Op::Sub => MOp::Sub,
            Op::Mul => MOp::IMul,
            Op::And => MOp::And,
            Op::Or => MOp::Or,
            _ => unreachable!(),
        };
        let commutative = matches!(ins.op, Op::Add | Op::Mul | Op::And | Op::Or);

        if dst == left {
            self.emit(MInst::new(op, w, Operand::Gpr(dst), Operand::Gpr(right)));
        } else if dst == right {
            if commutative {
                self.emit(MInst::new(op, w, Operand::Gpr(dst), Operand::Gpr(left)));
            } else {
                self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(SCRATCH1), Operand::Gpr(left)));
                self.emit(MInst::new(op, w, Operand::Gpr(SCRATCH1), Operand::Gpr(right)));
                self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(SCRATCH1)));
            }
        } else {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(left)));
            self.emit(MInst::new(op, w, Operand::Gpr(dst), Operand::Gpr(right)));
        }
        Ok(())
    }

    fn lower_float_binop(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let Some(dst) = self.dest_xmm(ins, pos) else {
            return Ok(());
        };
        let left = self.xmm_of(ins.left, pos)?;
        let right = self.xmm_of(ins.right, pos)?;
        let single = ins.ty == crate::ir::ir::TYPE_F32;
        let (op, mov) = match (ins.op, single) {
            (Op::Add, true) => (MOp::Addss, MOp::Movss),
            (Op::Add, false) => (MOp::Addsd, MOp::Movsd),
            (Op::Sub, true) => (MOp::Subss, MOp::Movss),
            (Op::Sub, false) => (MOp::Subsd, MOp::Movsd),
            (Op::Mul, true) => (MOp::Mulss, MOp::Movss),
            (Op::Mul, false) => (MOp::Mulsd, MOp::Movsd),
            (Op::Div, true) => (MOp::Divss, MOp::Movss),
            (Op::Div, false) => (MOp::Divsd, MOp::Movsd),
            _ => {
                return Err(CompileError::Internal(format!(
                    "floating-point {:?} is not lowerable",
                    ins.op
                )))
            }
        };
        if dst == left {
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::Xmm(right)));
        } else if dst == right {
            self.emit(MInst::new(mov.clone(), Width::B64, Operand::Xmm(SSE_SCRATCH), Operand::Xmm(left)));
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(SSE_SCRATCH), Operand::Xmm(right)));
            self.emit(MInst::new(mov, Width::B64, Operand::Xmm(dst), Operand::Xmm(SSE_SCRATCH)));
        } else {
            self.emit(MInst::new(mov, Width::B64, Operand::Xmm(dst), Operand::Xmm(left)));
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::Xmm(right)));
        }
        Ok(())
    }

    /// Integer division through the RAX:RDX pair; sub-32-bit operands
    /// are widened into the scratch registers first.
    fn lower_div(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if is_float_type(ins.ty) {
            if ins.op == Op::Modulo {
                return Err(CompileError::Internal("floating-point modulo".to_string()));
            }
            return self.lower_float_binop(ins, pos);
        }
        let left = self.gpr_of(ins.left, pos)?;
        let right = self.gpr_of(ins.right, pos)?;
        let signed = !is_unsigned_type(self.module, ins.ty);
        let w = self.width_of(ins.ty);

        let divisor = if matches!(w, Width::B8 | Width::B16) {
            let extend = if signed { MOp::Movsx { from: w } } else { MOp::Movzx { from: w } };
            self.emit(MInst::new(extend.clone(), Width::B32, Operand::Gpr(Reg::Rax), Operand::Gpr(left)));
            self.emit(MInst::new(extend, Width::B32, Operand::Gpr(SCRATCH1), Operand::Gpr(right)));
            SCRATCH1
        } else {
            self.emit(MInst::new(MOp::Mov, w, Operand::Gpr(Reg::Rax), Operand::Gpr(left)));
            right
        };
        let op_w = self.op_width(ins.ty);
        if signed {
            self.emit(MInst::nullary(if op_w == Width::B64 { MOp::Cqo } else { MOp::Cdq }));
        } else {
            self.emit(MInst::new(MOp::Xor, Width::B32, Operand::Gpr(Reg::Rdx), Operand::Gpr(Reg::Rdx)));
        }
        let div = if signed { MOp::IDiv } else { MOp::Div };
        self.emit(MInst::new(div, op_w, Operand::Gpr(divisor), Operand::None));

        if let Some(dst) = self.dest_gpr(ins, pos) {
            let result = if ins.op == Op::Modulo { Reg::Rdx } else { Reg::Rax };
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(result)));
        }
        Ok(())
    }

    fn lower_shift(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let left = self.gpr_of(ins.left, pos)?;
        let right = self.gpr_of(ins.right, pos)?;
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let w = self.op_width(ins.ty);
        let op = match ins.op {
            Op::LeftShift => MOp::Sal,
            _ if is_unsigned_type(self.module, ins.ty) => MOp::Shr,
            _ => MOp::Sar,
        };
        // Shift count lives in CL.
        self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(Reg::Rcx), Operand::Gpr(right)));
        if dst == left {
            self.emit(MInst::new(op, w, Operand::Gpr(dst), Operand::None));
        } else {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(SCRATCH1), Operand::Gpr(left)));
            self.emit(MInst::new(op, w, Operand::Gpr(SCRATCH1), Operand::None));
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(SCRATCH1)));
        }
        Ok(())
    }

    fn lower_unary_minus(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            let src = self.xmm_of(ins.left, pos)?;
            let single = ins.ty == crate::ir::ir::TYPE_F32;
            if src != dst {
                let mov = if single { MOp::Movss } else { MOp::Movsd };
                self.emit(MInst::new(mov, Width::B64, Operand::Xmm(dst), Operand::Xmm(src)));
            }
            let (op, mask) = if single {
                (MOp::Xorps, self.data.f32_sign_mask())
            } else {
                (MOp::Xorpd, self.data.f64_sign_mask())
            };
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::RipData { offset: mask }));
            return Ok(());
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let src = self.gpr_of(ins.left, pos)?;
        if src != dst {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(src)));
        }
        self.emit(MInst::new(MOp::Neg, self.op_width(ins.ty), Operand::Gpr(dst), Operand::None));
        Ok(())
    }

    fn lower_extend(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let src = self.gpr_of(ins.left, pos)?;
        let from = Width::from_size(self.module.type_of(ins.imm).size);
        let to = self.width_of(ins.ty);
        if from == to {
            if src != dst {
                self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(src)));
            }
            return Ok(());
        }
        let op = if ins.op == Op::SignExtend {
            MOp::Movsx { from }
        } else {
            MOp::Movzx { from }
        };
        self.emit(MInst::new(op, to, Operand::Gpr(dst), Operand::Gpr(src)));
        Ok(())
    }

    fn lower_bitwise_cast(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let to_float = is_float_type(ins.ty);
        let from_float = is_float_type(ins.imm);
        match (from_float, to_float) {
            (false, true) => {
                let Some(dst) = self.dest_xmm(ins, pos) else {
                    return Ok(());
                };
                let src = self.gpr_of(ins.left, pos)?;
                self.emit(MInst::new(MOp::MovqToXmm, Width::B64, Operand::Xmm(dst), Operand::Gpr(src)));
            }
            (true, false) => {
                let Some(dst) = self.dest_gpr(ins, pos) else {
                    return Ok(());
                };
                let src = self.xmm_of(ins.left, pos)?;
                self.emit(MInst::new(MOp::MovqFromXmm, Width::B64, Operand::Gpr(dst), Operand::Xmm(src)));
            }
            _ => return self.lower_copy(ins, pos),
        }
        Ok(())
    }

    fn lower_convert(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let from_ty = ins.imm;
        let to_float = is_float_type(ins.ty);
        let from_float = is_float_type(from_ty);
        match (from_float, to_float) {
            (false, true) => {
                let Some(dst) = self.dest_xmm(ins, pos) else {
                    return Ok(());
                };
                let mut src = self.gpr_of(ins.left, pos)?;
                let mut from_w = Width::from_size(self.module.type_of(from_ty).size);
                if matches!(from_w, Width::B8 | Width::B16) {
                    let extend = if is_unsigned_type(self.module, from_ty) {
                        MOp::Movzx { from: from_w }
                    } else {
                        MOp::Movsx { from: from_w }
                    };
                    self.emit(MInst::new(extend, Width::B32, Operand::Gpr(SCRATCH1), Operand::Gpr(src)));
                    src = SCRATCH1;
                    from_w = Width::B32;
                }
                let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Cvtsi2ss } else { MOp::Cvtsi2sd };
                self.emit(MInst::new(op, from_w, Operand::Xmm(dst), Operand::Gpr(src)));
            }
            (true, false) => {
                let Some(dst) = self.dest_gpr(ins, pos) else {
                    return Ok(());
                };
                let src = self.xmm_of(ins.left, pos)?;
                let op = if from_ty == crate::ir::ir::TYPE_F32 { MOp::Cvtss2si } else { MOp::Cvtsd2si };
                self.emit(MInst::new(op, self.op_width(ins.ty), Operand::Gpr(dst), Operand::Xmm(src)));
            }
            (true, true) => {
                let Some(dst) = self.dest_xmm(ins, pos) else {
                    return Ok(());
                };
                let src = self.xmm_of(ins.left, pos)?;
                let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Cvtsd2ss } else { MOp::Cvtss2sd };
                self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::Xmm(src)));
            }
            (false, false) => return self.lower_extend(ins, pos),
        }
        Ok(())
    }

    fn lower_cmp(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let operand_ty = self.types.get(&ins.left).copied().unwrap_or(ins.ty);
        if is_float_type(operand_ty) {
            let left = self.xmm_of(ins.left, pos)?;
            let right = self.xmm_of(ins.right, pos)?;
            let op = if operand_ty == crate::ir::ir::TYPE_F32 { MOp::Ucomiss } else { MOp::Ucomisd };
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(left), Operand::Xmm(right)));
            // Unordered compares set the below/above flags.
            self.last_cmp_unsigned = true;
            return Ok(());
        }
        let left = self.gpr_of(ins.left, pos)?;
        let right = self.gpr_of(ins.right, pos)?;
        let w = self.width_of(operand_ty);
        self.emit(MInst::new(MOp::Cmp, w, Operand::Gpr(left), Operand::Gpr(right)));
        self.last_cmp_unsigned = is_unsigned_type(self.module, operand_ty);
        Ok(())
    }

    fn lower_br(&mut self, ins: &Instruction, id: BlockId) -> CompileResult<()> {
        let Some(target) = self.cfg.block(id).branch else {
            return Err(CompileError::Internal("branch without a target block".to_string()));
        };
        let jump = Jump::from_i32(ins.left);
        let unsigned = self.last_cmp_unsigned;
        self.mfunc.blocks.last_mut().unwrap().jump = Some(MJump { jump, unsigned, target });
        Ok(())
    }

    fn lower_return(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        if ins.left != -1 && ins.ty != TYPE_VOID {
            if is_float_type(ins.ty) {
                let src = self.xmm_of(ins.left, pos)?;
                if src != 0 {
                    self.emit(MInst::new(MOp::Movsd, Width::B64, Operand::Xmm(0), Operand::Xmm(src)));
                }
            } else {
                let src = self.gpr_of(ins.left, pos)?;
                if src != Reg::Rax {
                    self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(Reg::Rax), Operand::Gpr(src)));
                }
            }
        }
        self.emit_epilogue();
        Ok(())
    }

    fn lower_load(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let ptr = self.gpr_of(ins.left, pos)?;
        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::Mem { base: ptr, disp: 0 }));
            return Ok(());
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        self.emit(MInst::new(
            MOp::Mov,
            self.width_of(ins.ty),
            Operand::Gpr(dst),
            Operand::Mem { base: ptr, disp: 0 },
        ));
        Ok(())
    }

    fn lower_store(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let ptr = self.gpr_of(ins.left, pos)?;
        if is_float_type(ins.ty) {
            let value = self.xmm_of(ins.right, pos)?;
            let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
            self.emit(MInst::new(op, Width::B64, Operand::Mem { base: ptr, disp: 0 }, Operand::Xmm(value)));
            return Ok(());
        }
        let value = self.gpr_of(ins.right, pos)?;
        self.emit(MInst::new(
            MOp::Mov,
            self.width_of(ins.ty),
            Operand::Mem { base: ptr, disp: 0 },
            Operand::Gpr(value),
        ));
        Ok(())
    }

    fn lower_ptr(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        if self.alloca_names.contains(&ins.left) {
            let slot = self.alloc.slot_for(ins.left);
            if slot < 0 {
                return Err(CompileError::Internal(format!(
                    "alloca {} has no stack slot",
                    ins.left
                )));
            }
            let disp = self.frame.slot_offset(slot) + ins.imm;
            self.emit(MInst::new(
                MOp::Lea,
                Width::B64,
                Operand::Gpr(dst),
                Operand::Mem { base: Reg::Rsp, disp },
            ));
        } else {
            let base = self.gpr_of(ins.left, pos)?;
            self.emit(MInst::new(
                MOp::Lea,
                Width::B64,
                Operand::Gpr(dst),
                Operand::Mem { base, disp: ins.imm },
            ));
        }
        Ok(())
    }

    fn lower_element_ptr(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        let index = self.gpr_of(ins.right, pos)?;
        let elem_ty = self.module.type_of(ins.ty).base_type;
        let elem_size = self.module.type_of(elem_ty).size.max(1);

        // dst = base + index * element size.
        let index_ty = self.types.get(&ins.right).copied().unwrap_or(crate::ir::ir::TYPE_I64);
        let index_w = self.width_of(index_ty);
        if index_w == Width::B64 {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(SCRATCH1), Operand::Gpr(index)));
        } else {
            self.emit(MInst::new(
                MOp::Movsx { from: index_w },
                Width::B64,
                Operand::Gpr(SCRATCH1),
                Operand::Gpr(index),
            ));
        }
        if elem_size != 1 {
            self.emit(MInst::new(
                MOp::IMulImm(elem_size),
                Width::B64,
                Operand::Gpr(SCRATCH1),
                Operand::Gpr(SCRATCH1),
            ));
        }
        if self.alloca_names.contains(&ins.left) {
            let slot = self.alloc.slot_for(ins.left);
            let disp = self.frame.slot_offset(slot);
            self.emit(MInst::new(
                MOp::Lea,
                Width::B64,
                Operand::Gpr(SCRATCH2),
                Operand::Mem { base: Reg::Rsp, disp },
            ));
            self.emit(MInst::new(MOp::Add, Width::B64, Operand::Gpr(SCRATCH1), Operand::Gpr(SCRATCH2)));
        } else {
            let base = self.gpr_of(ins.left, pos)?;
            self.emit(MInst::new(MOp::Add, Width::B64, Operand::Gpr(SCRATCH1), Operand::Gpr(base)));
        }
        self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(SCRATCH1)));
        Ok(())
    }

    fn lower_load_global(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let offset = self.data.static_offset(ins.imm)?;
        if is_float_type(ins.ty) {
            let Some(dst) = self.dest_xmm(ins, pos) else {
                return Ok(());
            };
            let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
            self.emit(MInst::new(op, Width::B64, Operand::Xmm(dst), Operand::RipData { offset }));
            return Ok(());
        }
        let Some(dst) = self.dest_gpr(ins, pos) else {
            return Ok(());
        };
        self.emit(MInst::new(
            MOp::Mov,
            self.width_of(ins.ty),
            Operand::Gpr(dst),
            Operand::RipData { offset },
        ));
        Ok(())
    }

    fn lower_store_global(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let offset = self.data.static_offset(ins.imm)?;
        if is_float_type(ins.ty) {
            let value = self.xmm_of(ins.left, pos)?;
            let op = if ins.ty == crate::ir::ir::TYPE_F32 { MOp::Movss } else { MOp::Movsd };
            self.emit(MInst::new(op, Width::B64, Operand::RipData { offset }, Operand::Xmm(value)));
            return Ok(());
        }
        let value = self.gpr_of(ins.left, pos)?;
        self.emit(MInst::new(
            MOp::Mov,
            self.width_of(ins.ty),
            Operand::RipData { offset },
            Operand::Gpr(value),
        ));
        Ok(())
    }

    fn lower_malloc(&mut self, ins: &Instruction, pos: i32) -> CompileResult<()> {
        let size = self.module.constants.get(ins.imm).as_i64();
        let arg0 = self.target.int_arg_regs()[0];
        self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(arg0), Operand::Imm(size)));
        if self.target.os == TargetOs::Linux {
            self.emit(MInst::new(MOp::Xor, Width::B32, Operand::Gpr(Reg::Rax), Operand::Gpr(Reg::Rax)));
        }
        self.emit(MInst::nullary(MOp::Call { symbol: "malloc".to_string() }));
        if let Some(dst) = self.dest_gpr(ins, pos) {
            self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(Reg::Rax)));
        }
        Ok(())
    }

    /// Lower a call together with the argument run that follows it.
    /// Returns the number of consumed argument instructions.
    fn lower_call(
        &mut self,
        ins: &Instruction,
        pos: i32,
        following: Option<&[Instruction]>,
    ) -> CompileResult<usize> {
        let nargs = ins.left.max(0) as usize;
        let args: Vec<Instruction> = following
            .unwrap_or(&[])
            .iter()
            .take(nargs)
            .copied()
            .collect();
        if args.len() != nargs || args.iter().any(|a| a.op != Op::Arg) {
            return Err(CompileError::Internal(
                "call without a matching argument run".to_string(),
            ));
        }

        let int_regs = self.target.int_arg_regs();
        let shadow = self.target.shadow_space();
        let mut int_count = 0usize;
        let mut sse_count = 0usize;
        let mut overflow = 0i32;

        for (i, arg) in args.iter().enumerate() {
            let arg_pos = pos + 1 + i as i32;
            for restore in self.alloc.restores_at(arg_pos).to_vec() {
                self.emit_restore(&restore);
            }
            let float = is_float_type(arg.ty);
            let (in_register, register_index) = match self.target.os {
                TargetOs::Windows => (i < int_regs.len(), i),
                TargetOs::Linux => {
                    if float {
                        (sse_count < self.target.max_sse_args(), sse_count)
                    } else {
                        (int_count < int_regs.len(), int_count)
                    }
                }
            };
            if float {
                let src = self.xmm_of(arg.left, arg_pos)?;
                if in_register {
                    if src != register_index as u8 {
                        self.emit(MInst::new(
                            MOp::Movsd,
                            Width::B64,
                            Operand::Xmm(register_index as u8),
                            Operand::Xmm(src),
                        ));
                    }
                } else {
                    let disp = shadow + overflow * 8;
                    self.emit(MInst::new(
                        MOp::Movsd,
                        Width::B64,
                        Operand::Mem { base: Reg::Rsp, disp },
                        Operand::Xmm(src),
                    ));
                    overflow += 1;
                }
                sse_count += 1;
            } else {
                let src = self.gpr_of(arg.left, arg_pos)?;
                if in_register {
                    let dst = int_regs[register_index];
                    if dst != src {
                        self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(src)));
                    }
                } else {
                    let disp = shadow + overflow * 8;
                    self.emit(MInst::new(
                        MOp::Mov,
                        Width::B64,
                        Operand::Mem { base: Reg::Rsp, disp },
                        Operand::Gpr(src),
                    ));
                    overflow += 1;
                }
                int_count += 1;
            }
        }

        let Some(symbol) = self.module.get_symbol(ins.right) else {
            return Err(CompileError::UnresolvedSymbol(format!("call #{}", ins.right)));
        };
        if self.target.os == TargetOs::Linux {
            // Variadic convention: AL counts the vector arguments.
            self.emit(MInst::new(MOp::Xor, Width::B32, Operand::Gpr(Reg::Rax), Operand::Gpr(Reg::Rax)));
        }
        self.emit(MInst::nullary(MOp::Call { symbol: symbol.to_string() }));

        if ins.ty != TYPE_VOID {
            if is_float_type(ins.ty) {
                if let Some(dst) = self.dest_xmm(ins, pos) {
                    if dst != 0 {
                        self.emit(MInst::new(MOp::Movsd, Width::B64, Operand::Xmm(dst), Operand::Xmm(0)));
                    }
                }
            } else if let Some(dst) = self.dest_gpr(ins, pos) {
                if dst != Reg::Rax {
                    self.emit(MInst::new(MOp::Mov, Width::B64, Operand::Gpr(dst), Operand::Gpr(Reg::Rax)));
                }
            }
        }
        Ok(nargs)
    }
}
