//! SSA construction, reconstruction, and destruction.
//!
//! Construction places phis at the iterated dominance frontier of each
//! variable's definition blocks, then renames by a preorder walk of the
//! dominator tree with a per-variable stack of generated names.
//!
//! Reconstruction re-establishes the single-definition property after a
//! pass has duplicated or replaced definitions (inlining, memory
//! promotion): it is construction restricted to the affected variables,
//! where any name with more than one definition counts as affected.
//!
//! Destruction splits critical edges, computes phi webs, renames every
//! web member to the web's representative, and lowers each phi mirror to
//! a self-copy so instruction positions remain stable for the register
//! allocator's spill and restore schedule.

use crate::analysis::dom::Dom;
use crate::analysis::phi_web::PhiWeb;
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::{
    BlockId, FlowGraph, Instruction, Jump, Module, Op, Phi, FunctionAttributes, TYPE_VOID,
};
use tracing::trace;

pub fn construct(module: &mut Module) {
    for function in &mut module.functions {
        if function.has_attribute(FunctionAttributes::EXTERN) {
            continue;
        }
        let variables = function.variables.clone();
        construct_function(&variables, &mut function.cfg);
    }
}

pub fn construct_function(variables: &[i32], cfg: &mut FlowGraph) {
    Renamer::new(variables).run(cfg);
}

/// Rebuild SSA form for the given variables plus every name that has more
/// than one definition.
pub fn reconstruct(cfg: &mut FlowGraph, variables: &[i32]) {
    let mut vars: Vec<i32> = variables.to_vec();
    let mut seen: FxHashSet<i32> = variables.iter().copied().collect();
    let mut defined: FxHashSet<i32> = FxHashSet::default();
    for id in cfg.block_order() {
        let bb = cfg.block(id);
        for phi in &bb.phis {
            if !defined.insert(phi.name) && seen.insert(phi.name) {
                vars.push(phi.name);
            }
        }
        for ins in &bb.instructions {
            if ins.op == Op::Phi || ins.name == -1 {
                continue;
            }
            if !defined.insert(ins.name) && seen.insert(ins.name) {
                vars.push(ins.name);
            }
        }
    }
    trace!(variables = vars.len(), "ssa reconstruct");
    Renamer::new(&vars).run(cfg);
}

struct Renamer {
    variables: FxHashSet<i32>,
    stacks: FxHashMap<i32, Vec<i32>>,
    /// (block, phi index) -> the variable a phi merges.
    phi_vars: FxHashMap<(BlockId, usize), i32>,
    counter: i32,
}

impl Renamer {
    fn new(variables: &[i32]) -> Self {
        Self {
            variables: variables.iter().copied().collect(),
            stacks: FxHashMap::default(),
            phi_vars: FxHashMap::default(),
            counter: 0,
        }
    }

    fn run(&mut self, cfg: &mut FlowGraph) {
        if self.variables.is_empty() || cfg.first().is_none() {
            return;
        }
        cfg.recompute_incoming();

        let mut dom = Dom::new();
        dom.compute(cfg);

        self.counter = cfg.max_name() + 1;
        self.register_existing_phis(cfg);
        self.insert_phi_nodes(cfg, &dom);
        self.rename(cfg, &dom, dom.start());
        sync_phi_mirrors(cfg);
    }

    /// A phi that already defines one of the variables belongs to that
    /// variable's renaming.
    fn register_existing_phis(&mut self, cfg: &FlowGraph) {
        for id in cfg.block_order() {
            for (index, phi) in cfg.block(id).phis.iter().enumerate() {
                if self.variables.contains(&phi.name) {
                    self.phi_vars.insert((id, index), phi.name);
                }
            }
        }
    }

    fn insert_phi_nodes(&mut self, cfg: &mut FlowGraph, dom: &Dom) {
        for &variable in &self.variables.iter().copied().collect::<Vec<_>>() {
            let mut def_nodes: Vec<usize> = Vec::new();
            let mut ty = TYPE_VOID;
            for node in 0..dom.num() {
                let bb = cfg.block(dom.get(node).block());
                let mut defines = false;
                for ins in &bb.instructions {
                    if ins.name == variable && ins.op != Op::Phi {
                        defines = true;
                        ty = ins.ty;
                    }
                }
                for phi in &bb.phis {
                    if phi.name == variable {
                        defines = true;
                        ty = phi.ty;
                    }
                }
                if defines {
                    def_nodes.push(node);
                }
            }
            if def_nodes.len() < 2 {
                // A single definition dominates every use it has.
                continue;
            }

            let mut idf = FxHashSet::default();
            dom.iterated_dominance_frontier(&def_nodes, &mut idf);

            for node in idf {
                let id = dom.get(node).block();
                let already = cfg.block(id).phis.iter().enumerate().any(|(index, _phi)| {
                    self.phi_vars.get(&(id, index)) == Some(&variable)
                });
                if already {
                    continue;
                }
                let incoming = cfg.block(id).incoming.clone();
                if incoming.len() < 2 {
                    continue;
                }
                let mut phi = Phi::new(variable, ty);
                for &pred in &incoming {
                    phi.add_value(variable, pred);
                }
                let bb = cfg.block_mut(id);
                let index = bb.phis.len();
                bb.insert_instruction(index, Instruction::new(variable, ty, -1, -1, Op::Phi));
                bb.add_phi(phi);
                self.phi_vars.insert((id, index), variable);
            }
        }
    }

    fn gen_name(&mut self, variable: i32) -> i32 {
        let name = self.counter;
        self.counter += 1;
        self.stacks.entry(variable).or_default().push(name);
        name
    }

    fn top(&self, variable: i32) -> i32 {
        match self.stacks.get(&variable) {
            Some(stack) if !stack.is_empty() => *stack.last().unwrap(),
            // Before any definition the base name stands for itself.
            _ => variable,
        }
    }

    fn rename(&mut self, cfg: &mut FlowGraph, dom: &Dom, node: usize) {
        let id = dom.get(node).block();
        let mut pushed: Vec<i32> = Vec::new();

        // Phi definitions first: they execute at the top of the block.
        for index in 0..cfg.block(id).phis.len() {
            let Some(&variable) = self.phi_vars.get(&(id, index)) else {
                continue;
            };
            let new_name = self.gen_name(variable);
            pushed.push(variable);
            let bb = cfg.block_mut(id);
            bb.phis[index].name = new_name;
            bb.instructions[index].name = new_name;
        }

        for index in 0..cfg.block(id).instructions.len() {
            let ins = cfg.block(id).instructions[index];
            if ins.op == Op::Phi {
                continue;
            }
            let mut ins = ins;
            if !ins.is_special() {
                if ins.left != -1 && self.variables.contains(&ins.left) {
                    ins.left = self.top(ins.left);
                }
                if ins.right != -1 && self.variables.contains(&ins.right) {
                    ins.right = self.top(ins.right);
                }
            }
            if ins.name != -1 && self.variables.contains(&ins.name) {
                let variable = ins.name;
                ins.name = self.gen_name(variable);
                pushed.push(variable);
            }
            cfg.block_mut(id).instructions[index] = ins;
        }

        // Update the phi operand slot for this predecessor in every
        // successor, including operands that merely reference a variable.
        for succ in cfg.successors(id) {
            let incoming = cfg.block(succ).incoming.clone();
            let Some(slot) = incoming.iter().position(|&p| p == id) else {
                continue;
            };
            for index in 0..cfg.block(succ).phis.len() {
                let value = cfg.block(succ).phis[index].values[slot];
                if let Some(&variable) = self.phi_vars.get(&(succ, index)) {
                    cfg.block_mut(succ).phis[index].values[slot] = self.top(variable);
                } else if self.variables.contains(&value) {
                    cfg.block_mut(succ).phis[index].values[slot] = self.top(value);
                }
            }
        }

        for &child in dom.get(node).children() {
            self.rename(cfg, dom, child);
        }

        for variable in pushed {
            if let Some(stack) = self.stacks.get_mut(&variable) {
                stack.pop();
            }
        }
    }
}

/// Keep the phi mirror instructions at the front of each block aligned
/// with their side records.
pub fn sync_phi_mirrors(cfg: &mut FlowGraph) {
    for id in cfg.block_order() {
        let bb = cfg.block_mut(id);
        for index in 0..bb.phis.len() {
            let name = bb.phis[index].name;
            let ty = bb.phis[index].ty;
            let left = bb.phis[index].values.first().copied().unwrap_or(-1);
            let right = bb.phis[index].values.get(1).copied().unwrap_or(-1);
            let ins = &mut bb.instructions[index];
            ins.name = name;
            ins.ty = ty;
            ins.left = left;
            ins.right = right;
        }
    }
}

/// Split every edge from a block with multiple successors into a block
/// with multiple predecessors, so a phi move never lands on an edge
/// shared with another path.
pub fn split_critical_edges(cfg: &mut FlowGraph) {
    cfg.recompute_incoming();
    let mut counter = cfg.max_name() + 1;

    for p in cfg.block_order() {
        let succs = cfg.successors(p);
        if succs.len() < 2 {
            continue;
        }
        for s in succs {
            if cfg.block(s).incoming.len() < 2 {
                continue;
            }
            let split = if cfg.block(p).branch == Some(s) {
                // Branch edge: a new block at the end of the textual
                // order, jumping unconditionally to the old target.
                let split = cfg.add_block();
                cfg.block_mut(split).add_instruction(Instruction::new(
                    counter,
                    TYPE_VOID,
                    Jump::Unconditional as i32,
                    -1,
                    Op::Br,
                ));
                counter += 1;
                cfg.set_branch(split, Some(s), true);
                cfg.set_branch(p, Some(split), false);
                split
            } else {
                // Fall-through edge: an empty block threaded between the
                // two, preserving the fall-through path.
                cfg.insert_after(p)
            };
            cfg.block_mut(split).add_incoming(p);
            let bb = cfg.block_mut(s);
            for pred in bb.incoming.iter_mut() {
                if *pred == p {
                    *pred = split;
                }
            }
            for phi in bb.phis.iter_mut() {
                for block in phi.blocks.iter_mut() {
                    if *block == p {
                        *block = split;
                    }
                }
            }
        }
    }
}

/// SSA destruction: rewrite every phi-web member to the web's
/// representative name and lower the phis away.
pub fn destruct(cfg: &mut FlowGraph) {
    split_critical_edges(cfg);

    let mut web = PhiWeb::new();
    web.find_phi_webs(cfg);

    for id in cfg.block_order() {
        let bb = cfg.block_mut(id);
        for ins in bb.instructions.iter_mut() {
            if ins.op == Op::Phi {
                // Materialize the phi in place as a self-copy so the
                // linear position schedule stays intact.
                let rep = resolve(&web, ins.name);
                *ins = Instruction::new(rep, ins.ty, rep, -1, Op::Copy);
                continue;
            }
            if !ins.is_special() {
                if ins.left != -1 {
                    ins.left = resolve(&web, ins.left);
                }
                if ins.right != -1 {
                    ins.right = resolve(&web, ins.right);
                }
            }
            if ins.name != -1 {
                ins.name = resolve(&web, ins.name);
            }
        }
        bb.phis.clear();
    }
}

fn resolve(web: &PhiWeb, name: i32) -> i32 {
    let rep = web.find(name);
    if rep == -1 {
        name
    } else {
        rep
    }
}
