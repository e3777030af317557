//! Liveness: block-level live-in/live-out sets and per-instruction
//! live-range widths.
//!
//! The block-level pass classifies edges as forward or backward (an edge
//! is backward when its target dominates its source), solves the loop-free
//! graph by a postorder walk over forward edges, then widens the sets of
//! every loop body with the values live into its header. Phi operands
//! contribute uses at the incoming predecessor, not at the phi block; a
//! phi's result is live into its own block.
//!
//! Live-range widths drive the register allocators: the width at a
//! definition's position is the distance to its last use in linearized
//! order, capped at the end of the enclosing loop when the value is live
//! across a back edge.

use crate::analysis::dom::Dom;
use crate::analysis::nlf::{Nlf, NlfType};
use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::{FlowGraph, Op};

#[derive(Debug, Default)]
pub struct LiveNode {
    forward_edges: Vec<usize>,
    back_edges: Vec<usize>,
    live_in: FxHashSet<i32>,
    live_out: FxHashSet<i32>,
}

impl LiveNode {
    pub fn forward_edges(&self) -> &[usize] {
        &self.forward_edges
    }

    pub fn back_edges(&self) -> &[usize] {
        &self.back_edges
    }

    pub fn live_in(&self) -> &FxHashSet<i32> {
        &self.live_in
    }

    pub fn live_out(&self) -> &FxHashSet<i32> {
        &self.live_out
    }
}

#[derive(Debug, Default)]
pub struct Live {
    nodes: Vec<LiveNode>,
    visited: FxHashSet<usize>,
}

impl Live {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[LiveNode] {
        &self.nodes
    }

    pub fn compute(&mut self, cfg: &FlowGraph, dom: &Dom) {
        let n = dom.num();
        self.nodes = (0..n).map(|_| LiveNode::default()).collect();
        self.visited.clear();

        for i in 0..n {
            for &succ in dom.get(i).successors() {
                if dom.dominates(succ, i) || succ == i {
                    self.nodes[i].back_edges.push(succ);
                } else {
                    self.nodes[i].forward_edges.push(succ);
                }
            }
        }

        let (defs, uses, phi_defs, phi_uses) = collect_block_facts(cfg, dom);
        self.dag_dfs(dom.start(), &defs, &uses, &phi_defs, &phi_uses);
        self.widen_loops(cfg, dom, &phi_defs);
    }

    /// Postorder over forward edges: a block's sets are computed after
    /// all of its forward successors.
    fn dag_dfs(
        &mut self,
        id: usize,
        defs: &[FxHashSet<i32>],
        uses: &[FxHashSet<i32>],
        phi_defs: &[FxHashSet<i32>],
        phi_uses: &[FxHashMap<usize, Vec<i32>>],
    ) {
        self.visited.insert(id);
        for i in 0..self.nodes[id].forward_edges.len() {
            let succ = self.nodes[id].forward_edges[i];
            if !self.visited.contains(&succ) {
                self.dag_dfs(succ, defs, uses, phi_defs, phi_uses);
            }
        }

        let mut live_out: FxHashSet<i32> = FxHashSet::default();
        for &succ in &self.nodes[id].forward_edges {
            for &v in &self.nodes[succ].live_in {
                if !phi_defs[succ].contains(&v) {
                    live_out.insert(v);
                }
            }
        }
        for (&_succ, values) in phi_uses[id].iter() {
            for &v in values {
                live_out.insert(v);
            }
        }

        let mut live_in: FxHashSet<i32> = phi_defs[id].clone();
        for &v in &uses[id] {
            live_in.insert(v);
        }
        for &v in &live_out {
            if !defs[id].contains(&v) {
                live_in.insert(v);
            }
        }

        self.nodes[id].live_out = live_out;
        self.nodes[id].live_in = live_in;
    }

    /// Values live into a loop header (other than the header's own phi
    /// results) are live throughout the whole loop body.
    fn widen_loops(&mut self, cfg: &FlowGraph, dom: &Dom, phi_defs: &[FxHashSet<i32>]) {
        let mut nlf = Nlf::new();
        nlf.compute(dom);
        let _ = cfg;

        for header in 0..self.nodes.len() {
            match nlf.get_type(header) {
                NlfType::Reducible | NlfType::NonReducible | NlfType::SelfLoop => {}
                NlfType::NonHeader => continue,
            }
            let live_loop: Vec<i32> = self.nodes[header]
                .live_in
                .iter()
                .copied()
                .filter(|v| !phi_defs[header].contains(v))
                .collect();
            if live_loop.is_empty() {
                continue;
            }
            for member in 0..self.nodes.len() {
                if member == header || !in_loop(&nlf, member, header) {
                    continue;
                }
                for &v in &live_loop {
                    self.nodes[member].live_in.insert(v);
                    self.nodes[member].live_out.insert(v);
                }
            }
            for &v in &live_loop {
                self.nodes[header].live_out.insert(v);
            }
        }
    }
}

fn in_loop(nlf: &Nlf, node: usize, header: usize) -> bool {
    let mut cur = node;
    loop {
        let h = nlf.get_header(cur);
        if h == header {
            return true;
        }
        if h == cur {
            return false;
        }
        cur = h;
    }
}

type BlockFacts = (
    Vec<FxHashSet<i32>>,
    Vec<FxHashSet<i32>>,
    Vec<FxHashSet<i32>>,
    Vec<FxHashMap<usize, Vec<i32>>>,
);

/// Per block: defs, upward-exposed uses, phi defs, and phi uses keyed by
/// the predecessor contributing the operand.
fn collect_block_facts(cfg: &FlowGraph, dom: &Dom) -> BlockFacts {
    let n = dom.num();
    let mut defs = vec![FxHashSet::default(); n];
    let mut uses = vec![FxHashSet::default(); n];
    let mut phi_defs = vec![FxHashSet::default(); n];
    let mut phi_uses: Vec<FxHashMap<usize, Vec<i32>>> = vec![FxHashMap::default(); n];

    for i in 0..n {
        let bb = cfg.block(dom.get(i).block());
        for phi in &bb.phis {
            phi_defs[i].insert(phi.name);
            for (k, &value) in phi.values.iter().enumerate() {
                let pred = dom.node_of(phi.blocks[k]);
                phi_uses[pred].entry(i).or_default().push(value);
            }
        }
        for ins in &bb.instructions {
            if ins.op == Op::Phi {
                continue;
            }
            if !ins.is_special() {
                if ins.left != -1 && !defs[i].contains(&ins.left) {
                    uses[i].insert(ins.left);
                }
                if ins.right != -1 && !defs[i].contains(&ins.right) {
                    uses[i].insert(ins.right);
                }
            }
            if ins.name != -1 {
                defs[i].insert(ins.name);
            }
        }
    }
    (defs, uses, phi_defs, phi_uses)
}

/// Per-instruction live-range widths over the linearized function.
#[derive(Debug, Default)]
pub struct LiveRange {
    range: Vec<i32>,
}

impl LiveRange {
    pub fn new() -> Self {
        Self::default()
    }

    /// The width of the range starting at `index`, or 0 when no value is
    /// defined there.
    pub fn get_live_range(&self, index: usize) -> i32 {
        self.range.get(index).copied().unwrap_or(0)
    }

    pub fn compute(&mut self, cfg: &FlowGraph) {
        let mut dom = Dom::new();
        dom.compute(cfg);
        let mut nlf = Nlf::new();
        nlf.compute(&dom);

        let order = cfg.block_order();
        let num_positions = cfg.num_instructions();
        self.range = vec![0; num_positions];

        // Per-block position bounds, for capping back-edge ranges at the
        // end of the enclosing loop.
        let mut block_end: FxHashMap<usize, i32> = FxHashMap::default();
        let mut pos_block: Vec<usize> = Vec::with_capacity(num_positions);
        {
            let mut pos = 0i32;
            for &id in &order {
                let node = dom.node_of(id);
                let len = cfg.block(id).instructions.len() as i32;
                for _ in 0..len {
                    pos_block.push(node);
                }
                block_end.insert(node, pos + len - 1);
                pos += len;
            }
        }

        let mut defs: FxHashMap<i32, Vec<i32>> = FxHashMap::default();
        let mut all_uses: Vec<(i32, i32)> = Vec::new();

        let mut pos = 0i32;
        for &id in &order {
            let bb = cfg.block(id);
            for (index, ins) in bb.instructions.iter().enumerate() {
                let mut operands: Vec<i32> = Vec::new();
                if ins.op == Op::Phi {
                    // The side record carries the full operand list.
                    if let Some(phi) = bb.phis.get(index) {
                        operands.extend(phi.values.iter().copied());
                    } else {
                        if ins.left != -1 {
                            operands.push(ins.left);
                        }
                        if ins.right != -1 {
                            operands.push(ins.right);
                        }
                    }
                } else if !ins.is_special() {
                    if ins.left != -1 {
                        operands.push(ins.left);
                    }
                    if ins.right != -1 {
                        operands.push(ins.right);
                    }
                }

                for &operand in &operands {
                    if let Some(def_list) = defs.get(&operand) {
                        for &d in def_list {
                            self.range[d as usize] = self.range[d as usize].max(pos - d);
                        }
                    }
                    all_uses.push((operand, pos));
                }

                if ins.name != -1 {
                    defs.entry(ins.name).or_default().push(pos);
                }
                pos += 1;
            }
        }

        // A use positioned before one of its name's definitions is a
        // value flowing around a back edge: that definition stays live to
        // the end of the loop enclosing the use. Outside a loop the cap
        // is a no-op because the loop end precedes the definition.
        let mut loop_end_memo: FxHashMap<usize, i32> = FxHashMap::default();
        for (name, use_pos) in all_uses {
            let Some(def_list) = defs.get(&name) else {
                continue;
            };
            if def_list.iter().all(|&d| d <= use_pos) {
                continue;
            }
            let use_node = pos_block[use_pos as usize];
            let header = enclosing_header(&nlf, use_node);
            let loop_end = *loop_end_memo.entry(header).or_insert_with(|| {
                let mut end = 0i32;
                for node in 0..dom.num() {
                    if node == header || in_loop(&nlf, node, header) {
                        if let Some(&block_last) = block_end.get(&node) {
                            end = end.max(block_last);
                        }
                    }
                }
                end
            });
            for &d in def_list {
                if d > use_pos {
                    self.range[d as usize] = self.range[d as usize].max(loop_end - d);
                }
            }
        }
    }
}

fn enclosing_header(nlf: &Nlf, node: usize) -> usize {
    match nlf.get_type(node) {
        NlfType::Reducible | NlfType::NonReducible | NlfType::SelfLoop => node,
        NlfType::NonHeader => {
            let h = nlf.get_header(node);
            if h == node {
                node
            } else {
                h
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::*;

    #[test]
    fn test_live_range_straight_line() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1001, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Add));

        let mut live = LiveRange::new();
        live.compute(&cfg);
        assert_eq!(live.get_live_range(0), 2);
        assert_eq!(live.get_live_range(1), 1);
        assert_eq!(live.get_live_range(2), 0);
    }

    #[test]
    fn test_live_range_across_blocks() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        let bb4 = cfg.add_block();
        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1001, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Add));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::with_imm(1003, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1004, TYPE_I64, 1003, 1002, Op::Add));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::with_imm(1005, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(1004, TYPE_I64, 1002, 1005, Op::Add));
        cfg.block_mut(bb4)
            .add_instruction(Instruction::with_imm(1006, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb4)
            .add_instruction(Instruction::new(1004, TYPE_I64, 1004, 1006, Op::Add));

        let mut live = LiveRange::new();
        live.compute(&cfg);
        assert_eq!(live.get_live_range(0), 2);
        assert_eq!(live.get_live_range(1), 1);
        assert_eq!(live.get_live_range(2), 4);
        assert_eq!(live.get_live_range(3), 1);
        assert_eq!(live.get_live_range(4), 4);
        assert_eq!(live.get_live_range(5), 1);
        assert_eq!(live.get_live_range(6), 2);
        assert_eq!(live.get_live_range(7), 1);
    }

    // CFG in SSA form: the phi result is live into its block, and each
    // operand is live out of the predecessor supplying it.
    #[test]
    fn test_block_liveness_with_phi() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        let bb4 = cfg.add_block();

        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1001, TYPE_I64, 1, Op::Param));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1002, TYPE_BOOLEAN, 1000, 1001, Op::Cmp));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1003, TYPE_VOID, 0, -1, Op::Br));
        cfg.set_branch(bb1, Some(bb3), false);

        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1004, TYPE_I64, 0, 0, Op::Call));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1005, TYPE_I64, 1001, -1, Op::Arg));
        cfg.set_branch(bb2, Some(bb4), true);
        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1009, TYPE_VOID, 0, -1, Op::Br));

        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(1006, TYPE_I64, 0, 0, Op::Call));
        cfg.block_mut(bb3)
            .add_instruction(Instruction::new(1007, TYPE_I64, 1001, -1, Op::Arg));

        let mut phi = Phi::new(1008, TYPE_I64);
        phi.add_value(1004, bb2);
        phi.add_value(1006, bb3);
        cfg.block_mut(bb4).add_phi(phi);
        cfg.block_mut(bb4)
            .add_instruction(Instruction::new(1008, TYPE_I64, 1004, 1006, Op::Phi));

        let mut dom = Dom::new();
        dom.compute(&cfg);
        let mut live = Live::new();
        live.compute(&cfg, &dom);

        let l1 = &live.nodes()[0];
        assert!(l1.live_out().contains(&1001));
        assert!(!l1.live_out().contains(&1000));
        assert!(l1.live_in().is_empty());

        let l2 = &live.nodes()[1];
        assert_eq!(l2.live_in().len(), 1);
        assert!(l2.live_in().contains(&1001));
        assert_eq!(l2.live_out().len(), 1);
        assert!(l2.live_out().contains(&1004));

        let l3 = &live.nodes()[2];
        assert_eq!(l3.live_in().len(), 1);
        assert!(l3.live_in().contains(&1001));

        let l4 = &live.nodes()[3];
        assert!(l4.live_out().is_empty());
        assert_eq!(l4.live_in().len(), 1);
        assert!(l4.live_in().contains(&1008));
    }

    // Same shape with the join pushed one level deeper on one side.
    #[test]
    fn test_block_liveness_deeper_join() {
        let mut cfg = FlowGraph::new();
        let bb1 = cfg.add_block();
        let bb2 = cfg.add_block();
        let bb3 = cfg.add_block();
        let bb4 = cfg.add_block();
        let bb5 = cfg.add_block();
        let bb6 = cfg.add_block();

        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::with_imm(1001, TYPE_I64, 1, Op::Param));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1002, TYPE_BOOLEAN, 1000, 1001, Op::Cmp));
        cfg.block_mut(bb1)
            .add_instruction(Instruction::new(1003, TYPE_VOID, 0, -1, Op::Br));
        cfg.set_branch(bb1, Some(bb5), false);

        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1004, TYPE_I64, 0, 0, Op::Call));
        cfg.block_mut(bb2)
            .add_instruction(Instruction::new(1005, TYPE_I64, 1001, -1, Op::Arg));
        cfg.set_branch(bb2, Some(bb4), false);

        cfg.set_branch(bb3, Some(bb6), true);
        cfg.set_branch(bb4, Some(bb6), true);

        cfg.block_mut(bb5)
            .add_instruction(Instruction::new(1006, TYPE_I64, 0, 0, Op::Call));
        cfg.block_mut(bb5)
            .add_instruction(Instruction::new(1007, TYPE_I64, 1001, -1, Op::Arg));

        let mut phi = Phi::new(1008, TYPE_I64);
        phi.add_value(1004, bb4);
        phi.add_value(1006, bb5);
        cfg.block_mut(bb6).add_phi(phi);
        cfg.block_mut(bb6)
            .add_instruction(Instruction::new(1008, TYPE_I64, 1004, 1006, Op::Phi));

        let mut dom = Dom::new();
        dom.compute(&cfg);
        let mut live = Live::new();
        live.compute(&cfg, &dom);

        let l1 = &live.nodes()[0];
        assert!(l1.live_out().contains(&1001));
        assert!(!l1.live_out().contains(&1000));
        assert!(l1.live_in().is_empty());

        let l2 = &live.nodes()[1];
        assert!(l2.live_in().contains(&1001));
        assert!(l2.live_out().contains(&1004));

        let l5 = &live.nodes()[4];
        assert_eq!(l5.live_in().len(), 1);
        assert!(l5.live_in().contains(&1001));

        let l6 = &live.nodes()[5];
        assert!(l6.live_out().is_empty());
        assert_eq!(l6.live_in().len(), 1);
        assert!(l6.live_in().contains(&1008));
    }

    // A value defined before a loop and updated inside it: the inner
    // definition feeds the header phi around the back edge, so its range
    // runs to the end of the loop.
    #[test]
    fn test_live_range_back_edge_caps_at_loop_end() {
        let mut cfg = FlowGraph::new();
        let entry = cfg.add_block();
        let header = cfg.add_block();
        let body = cfg.add_block();
        let exit = cfg.add_block();

        // entry: 0: c0 = const
        cfg.block_mut(entry)
            .add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        // header: 1: phi(c0, add); 2: cmp; 3: br exit
        let mut phi = Phi::new(1001, TYPE_I64);
        phi.add_value(1000, entry);
        phi.add_value(1003, body);
        cfg.block_mut(header).add_phi(phi);
        cfg.block_mut(header)
            .add_instruction(Instruction::new(1001, TYPE_I64, 1000, 1003, Op::Phi));
        cfg.block_mut(header)
            .add_instruction(Instruction::new(1002, TYPE_BOOLEAN, 1001, 1001, Op::Cmp));
        cfg.block_mut(header)
            .add_instruction(Instruction::new(1004, TYPE_VOID, 1, -1, Op::Br));
        cfg.set_branch(header, Some(exit), false);
        // body: 4: add = phi + phi; 5: br header
        cfg.block_mut(body)
            .add_instruction(Instruction::new(1003, TYPE_I64, 1001, 1001, Op::Add));
        cfg.block_mut(body)
            .add_instruction(Instruction::new(1005, TYPE_VOID, 0, -1, Op::Br));
        cfg.set_branch(body, Some(header), true);
        // exit: 6: return
        cfg.block_mut(exit)
            .add_instruction(Instruction::new(1006, TYPE_VOID, 1001, -1, Op::Return));

        let mut live = LiveRange::new();
        live.compute(&cfg);
        // The add at position 4 feeds the phi at position 1 around the
        // back edge: its range is capped at the loop end (position 5).
        assert_eq!(live.get_live_range(4), 1);
        // The phi at position 1 is used at 2, 4 and by the return at 6.
        assert_eq!(live.get_live_range(1), 5);
    }
}
