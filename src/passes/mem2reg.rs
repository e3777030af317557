//! Memory-to-register promotion.
//!
//! A stack allocation can be promoted when its type is a pointer to a
//! scalar and its address never escapes: every use must be a `Ptr`
//! instruction whose own uses are loads and stores. The allocation is
//! replaced with a zero constant of the pointed-to primitive, each load
//! becomes a copy of the current scalar, each store a copy assigning the
//! scalar, and the pointer computations are erased. SSA reconstruction
//! then re-establishes the single-definition property for the promoted
//! names. Any allocation with a use outside `Ptr` is skipped silently and
//! keeps its stack slot.

use crate::analysis::uses::Uses;
use crate::ir::ir::{
    FlowGraph, FunctionAttributes, InstructionRef, Module, Op, TYPE_OBJECT, TYPE_VOID,
};
use crate::ssa;
use tracing::debug;

pub fn run(module: &mut Module) {
    for index in 0..module.functions.len() {
        if module.functions[index].has_attribute(FunctionAttributes::EXTERN) {
            continue;
        }
        let mut cfg = std::mem::take(&mut module.functions[index].cfg);
        let promoted = promote(module, &mut cfg);
        module.functions[index].cfg = cfg;
        if promoted > 0 {
            debug!(function = %module.functions[index].full_name, promoted, "promoted allocas");
        }
    }
}

struct AllocaCandidate {
    source: InstructionRef,
    uses: Vec<InstructionRef>,
    promote: bool,
}

fn promote(module: &mut Module, cfg: &mut FlowGraph) -> usize {
    let mut uses = Uses::new();
    uses.analyze(cfg);

    // 1. Find allocas of scalar pointers whose every use is a Ptr.
    let mut candidates: Vec<AllocaCandidate> = Vec::new();
    let mut pos = 0i32;
    let mut base_pos = 0i32;
    for id in cfg.block_order() {
        let bb = cfg.block(id);
        for ins in &bb.instructions {
            if ins.op != Op::Alloca {
                pos += 1;
                continue;
            }
            let ty = module.type_of(ins.ty);
            if !ty.is_pointer {
                pos += 1;
                continue;
            }
            let base = module.type_of(ty.base_type);
            if base.is_pointer || base.is_array || base.id >= TYPE_OBJECT || base.id == TYPE_VOID {
                pos += 1;
                continue;
            }
            if uses.has_uses(ins.name) {
                let mut candidate = AllocaCandidate {
                    source: InstructionRef::new(id, pos, base_pos),
                    uses: Vec::new(),
                    promote: true,
                };
                for &use_ref in uses.get_uses(ins.name) {
                    let use_ins =
                        cfg.block(use_ref.block).instructions[use_ref.adjusted()];
                    if use_ins.op != Op::Ptr {
                        candidate.promote = false;
                    }
                    candidate.uses.push(use_ref);
                }
                candidates.push(candidate);
            }
            pos += 1;
        }
        base_pos = pos;
    }

    // 2. Rewrite the promotable ones.
    let mut variables: Vec<i32> = Vec::new();
    for candidate in &candidates {
        if !candidate.promote {
            continue;
        }
        let source = candidate.source;
        let alloca = cfg.block(source.block).instructions[source.adjusted()];
        let base_type = module.type_of(alloca.ty).base_type;
        let zero = module.constants.intern_zero(base_type);

        {
            let ins = &mut cfg.block_mut(source.block).instructions[source.adjusted()];
            ins.op = Op::Constant;
            ins.ty = base_type;
            ins.left = -1;
            ins.right = -1;
            ins.imm = zero;
        }
        variables.push(alloca.name);

        for &use_ref in &candidate.uses {
            rewrite_ptr(cfg, &uses, use_ref);
        }
    }

    // 3. Sweep the erased pointer computations, then rebuild SSA for the
    // promoted names.
    cfg.compact();
    if !variables.is_empty() {
        ssa::reconstruct(cfg, &variables);
    }
    variables.len()
}

/// Turn the loads and stores reached through one `Ptr` into copies of the
/// promoted scalar, then erase the `Ptr` itself.
fn rewrite_ptr(cfg: &mut FlowGraph, uses: &Uses, ptr_ref: InstructionRef) {
    let ptr = cfg.block(ptr_ref.block).instructions[ptr_ref.adjusted()];
    let scalar = ptr.left;

    for &use_ref in uses.get_uses(ptr.name) {
        let ins = &mut cfg.block_mut(use_ref.block).instructions[use_ref.adjusted()];
        match ins.op {
            Op::Load => {
                ins.op = Op::Copy;
                ins.left = scalar;
                ins.right = -1;
                ins.imm = 0;
            }
            Op::Store => {
                ins.op = Op::Copy;
                ins.left = ins.right;
                ins.right = -1;
                ins.name = scalar;
                ins.imm = 0;
            }
            _ => {}
        }
    }

    let ins = &mut cfg.block_mut(ptr_ref.block).instructions[ptr_ref.adjusted()];
    ins.name = -1;
    ins.left = -1;
    ins.right = -1;
}
