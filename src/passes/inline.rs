//! Bottom-up function inlining.
//!
//! A call graph with strongly connected components drives the traversal:
//! a function is processed once every callee outside its own component
//! has been processed, so inlining never walks into a recursive cycle.
//! A function may be inlined when it is not extern, its body is at or
//! under the instruction threshold, and it contains no direct self-call.
//!
//! At a call site the caller block is split right after the argument run,
//! the callee blocks are cloned in textual order between the two halves
//! with every name rebased by a large constant offset, parameter
//! references are rewritten to the caller's argument values, and return
//! sites either branch to the join block or fall through from the last
//! clone. One value-returning site becomes a copy; several become a phi
//! in the join block. SSA reconstruction then renumbers the duplicated
//! definitions.

use crate::analysis::call_graph::CallGraph;
use crate::common::error::{CompileError, CompileResult};
use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{
    BlockId, FlowGraph, FunctionAttributes, Instruction, Jump, Module, Op, Phi, TYPE_VOID,
};
use crate::ssa;
use tracing::debug;

const INLINE_THRESHOLD: usize = 20;
const REBASE_OFFSET: i32 = 10000;
const MAX_INLINES_PER_FUNCTION: usize = 1000;

pub fn run(module: &mut Module) -> CompileResult<()> {
    let mut graph = CallGraph::new();
    graph.analyze(module);

    for index in 0..module.functions.len() {
        let can = !module.functions[index].has_attribute(FunctionAttributes::EXTERN)
            && should_inline(module, index);
        module.functions[index].can_inline = can;
    }

    let mut visited = vec![false; graph.nodes().len()];
    let mut changed = true;
    while changed {
        changed = false;
        for node_index in 0..graph.nodes().len() {
            let node = &graph.nodes()[node_index];
            if visited[node.id] {
                continue;
            }
            if node.is_leaf() {
                visited[node.id] = true;
                changed = true;
                continue;
            }
            let all_children_visited = node
                .children
                .iter()
                .all(|&child| visited[child] || graph.nodes()[child].scc_id == node.scc_id);
            if all_children_visited {
                if !module.functions[node.id].has_attribute(FunctionAttributes::EXTERN) {
                    optimize_function(module, &graph, node.id)?;
                }
                visited[node.id] = true;
                changed = true;
            }
        }
    }
    Ok(())
}

fn should_inline(module: &Module, index: usize) -> bool {
    let function = &module.functions[index];
    if function.cfg.num_instructions() > INLINE_THRESHOLD {
        return false;
    }
    for block in function.cfg.block_order() {
        for ins in &function.cfg.block(block).instructions {
            if ins.op != Op::Call {
                continue;
            }
            match module.get_symbol(ins.right) {
                Some(symbol) if symbol == function.full_name => return false,
                None => return false,
                _ => {}
            }
        }
    }
    true
}

fn can_inline_call(module: &Module, graph: &CallGraph, ins: &Instruction) -> Option<usize> {
    let symbol = module.get_symbol(ins.right)?;
    let node = graph.find_node_by_name(symbol)?;
    let callee = &module.functions[node.id];
    if callee.has_attribute(FunctionAttributes::EXTERN) || !callee.can_inline {
        return None;
    }
    Some(node.id)
}

fn optimize_function(module: &mut Module, graph: &CallGraph, index: usize) -> CompileResult<()> {
    let mut inlined = 0;
    loop {
        let site = find_call_site(module, graph, index);
        let Some((block, call_index, callee)) = site else {
            break;
        };
        inline_call(module, index, block, call_index, callee);
        inlined += 1;
        if inlined > MAX_INLINES_PER_FUNCTION {
            return Err(CompileError::Internal(format!(
                "inliner failed to terminate in {}",
                module.functions[index].full_name
            )));
        }
    }
    if inlined > 0 {
        debug!(function = %module.functions[index].full_name, inlined, "inlined calls");
    }
    Ok(())
}

fn find_call_site(
    module: &Module,
    graph: &CallGraph,
    index: usize,
) -> Option<(BlockId, usize, usize)> {
    let cfg = &module.functions[index].cfg;
    for block in cfg.block_order() {
        for (i, ins) in cfg.block(block).instructions.iter().enumerate() {
            if ins.op != Op::Call {
                continue;
            }
            if let Some(callee) = can_inline_call(module, graph, ins) {
                if callee != index {
                    return Some((block, i, callee));
                }
            }
        }
    }
    None
}

/// Move everything from `index` onward into a fresh block after `block`,
/// along with the branch.
fn split_block(cfg: &mut FlowGraph, block: BlockId, index: usize) -> BlockId {
    let after = cfg.insert_after(block);
    let tail: Vec<Instruction> = cfg.block_mut(block).instructions.split_off(index);
    let (branch, unconditional) = {
        let bb = cfg.block(block);
        (bb.branch, bb.unconditional)
    };
    cfg.set_branch(block, None, false);
    cfg.set_branch(after, branch, unconditional);
    cfg.block_mut(after).instructions = tail;
    after
}

fn inline_call(
    module: &mut Module,
    caller: usize,
    block: BlockId,
    call_index: usize,
    callee: usize,
) {
    let call = module.functions[caller].cfg.block(block).instructions[call_index];
    let num_arguments = call.left as usize;
    let callee_cfg: FlowGraph = module.functions[callee].cfg.clone();
    let callee_order = callee_cfg.block_order();

    let cfg = &mut module.functions[caller].cfg;
    let after = split_block(cfg, block, call_index + num_arguments + 1);

    // Map callee parameters to the caller's argument values. The argument
    // run sits at the end of the first half, right after the call.
    let mut param_to_arg: FxHashMap<i32, i32> = FxHashMap::default();
    {
        let mut params: Vec<(i32, i32)> = Vec::new();
        if let Some(entry) = callee_cfg.first() {
            for ins in &callee_cfg.block(entry).instructions {
                if ins.op == Op::Param {
                    params.push((ins.imm, ins.name));
                }
            }
        }
        params.sort_by_key(|&(index, _)| index);
        let bb = cfg.block(block);
        let first_arg = bb.instructions.len() - num_arguments;
        for (i, &(_, param)) in params.iter().enumerate().take(num_arguments) {
            let arg = bb.instructions[first_arg + i];
            debug_assert_eq!(arg.op, Op::Arg);
            param_to_arg.insert(param, arg.left);
        }
    }

    let map_value = |value: i32, param_to_arg: &FxHashMap<i32, i32>| -> i32 {
        if value == -1 {
            return -1;
        }
        match param_to_arg.get(&value) {
            Some(&arg) => arg,
            None => value + REBASE_OFFSET,
        }
    };

    // Clone the callee blocks between the two halves, in textual order.
    let mut new_ids: Vec<BlockId> = Vec::new();
    let mut previous = block;
    for _ in &callee_order {
        let id = cfg.insert_after(previous);
        new_ids.push(id);
        previous = id;
    }
    let block_map: FxHashMap<BlockId, BlockId> = callee_order
        .iter()
        .copied()
        .zip(new_ids.iter().copied())
        .collect();

    let mut return_values: Vec<(i32, BlockId)> = Vec::new();
    for (i, &old_id) in callee_order.iter().enumerate() {
        let new_id = new_ids[i];
        let last = i + 1 == callee_order.len();
        let source = callee_cfg.block(old_id);

        for ins in &source.instructions {
            let mut ins = *ins;
            if ins.op == Op::Param {
                continue;
            }
            if !ins.is_special() {
                ins.left = map_value(ins.left, &param_to_arg);
                ins.right = map_value(ins.right, &param_to_arg);
            }
            if ins.name != -1 {
                ins.name += REBASE_OFFSET;
            }
            if ins.op == Op::Return {
                if ins.ty != TYPE_VOID && ins.left != -1 {
                    return_values.push((ins.left, new_id));
                }
                if last {
                    // The last clone falls through into the join block.
                    continue;
                }
                ins.op = Op::Br;
                ins.ty = TYPE_VOID;
                ins.left = Jump::Unconditional as i32;
                ins.right = -1;
                cfg.set_branch(new_id, Some(after), true);
            }
            cfg.block_mut(new_id).add_instruction(ins);
        }

        for phi in &source.phis {
            let mut phi = phi.clone();
            phi.name += REBASE_OFFSET;
            for value in phi.values.iter_mut() {
                *value = map_value(*value, &param_to_arg);
            }
            for pred in phi.blocks.iter_mut() {
                *pred = block_map[pred];
            }
            cfg.block_mut(new_id).add_phi(phi);
        }

        // Mirror the callee's branch edges.
        if let Some(target) = source.branch {
            cfg.set_branch(new_id, Some(block_map[&target]), source.unconditional);
        }
    }

    // Reconcile the returned value in the join block.
    if return_values.len() >= 2 {
        let mut phi = Phi::new(call.name, call.ty);
        for &(value, ret_block) in &return_values {
            phi.add_value(value, ret_block);
        }
        let bb = cfg.block_mut(after);
        bb.insert_instruction(
            bb.phis.len(),
            Instruction::new(call.name, call.ty, -1, -1, Op::Phi),
        );
        bb.add_phi(phi);
    } else if let Some(&(value, ret_block)) = return_values.first() {
        let copy = Instruction::new(call.name, call.ty, value, -1, Op::Copy);
        let bb = cfg.block_mut(ret_block);
        let at = match bb.instructions.last() {
            Some(last) if last.op == Op::Br => bb.instructions.len() - 1,
            _ => bb.instructions.len(),
        };
        bb.insert_instruction(at, copy);
    }

    // Drop the call and its argument run from the first half.
    {
        let bb = cfg.block_mut(block);
        let keep = bb.instructions.len() - num_arguments - 1;
        bb.instructions.truncate(keep);
    }

    cfg.recompute_incoming();
    ssa::sync_phi_mirrors(cfg);
    ssa::reconstruct(cfg, &[]);
}
