//! Graph-coloring register allocator.
//!
//! Interference is built in one scan of the linearized function: nodes
//! arrive in position order, entries whose range ended are dropped from
//! the live set, and the newcomer interferes with everything still live.
//! Phi webs become coalescing affinities; affine nodes are merged
//! aggressively (no interference re-check) and colored together. A node
//! with too many neighbours is spilled and detached until the graph
//! simplifies; the first spill reserves two registers of the class as
//! spill/restore scratch. After coloring, SSA destruction rewrites the
//! webs in place, and the spill plan is generated against the resulting
//! use positions.

use crate::analysis::live::LiveRange;
use crate::analysis::phi_web::PhiWeb;
use crate::analysis::uses::Uses;
use crate::common::error::{CompileError, CompileResult};
use crate::ir::ir::{FlowGraph, Module, Op};
use crate::regalloc::stack::StackAllocator;
use crate::regalloc::{
    class_of_type, Allocator, RegClass, RegisterFile, RestoreRecord, SpillRecord,
};
use crate::ssa;
use crate::common::fx_hash::FxHashMap;
use tracing::trace;

const NUM_SPILL_SCRATCH: usize = 2;

#[derive(Debug, Clone)]
pub struct InterferenceNode {
    name: i32,
    is_phi: bool,
    live_start: i32,
    live_end: i32,
    color: i32,
    spilled: bool,
    neighbours: Vec<usize>,
    affinities: Vec<usize>,
    merged: Vec<usize>,
}

impl InterferenceNode {
    pub fn new(name: i32, is_phi: bool, live_start: i32, live_end: i32) -> Self {
        Self {
            name,
            is_phi,
            live_start,
            live_end,
            color: -1,
            spilled: false,
            neighbours: Vec::new(),
            affinities: Vec::new(),
            merged: Vec::new(),
        }
    }

    pub fn name(&self) -> i32 {
        self.name
    }

    pub fn is_phi(&self) -> bool {
        self.is_phi
    }

    pub fn color(&self) -> i32 {
        self.color
    }

    pub fn spilled(&self) -> bool {
        self.spilled
    }

    pub fn live_start(&self) -> i32 {
        self.live_start
    }

    pub fn live_end(&self) -> i32 {
        self.live_end
    }

    pub fn neighbours(&self) -> &[usize] {
        &self.neighbours
    }

    pub fn merged(&self) -> &[usize] {
        &self.merged
    }

    fn remove_neighbour(&mut self, id: usize) {
        if let Some(at) = self.neighbours.iter().position(|&n| n == id) {
            self.neighbours.remove(at);
        }
    }
}

#[derive(Debug, Default)]
pub struct InterferenceGraph {
    nodes: Vec<InterferenceNode>,
    live_nodes: Vec<usize>,
}

impl InterferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[InterferenceNode] {
        &self.nodes
    }

    /// Insert a node in position order: expire live entries that end
    /// before it starts, then record mutual interference with the rest.
    pub fn insert(&mut self, node: InterferenceNode) {
        self.nodes.push(node);
        let cur_id = self.nodes.len() - 1;

        let mut to_remove = Vec::new();
        for &id in &self.live_nodes {
            if self.nodes[id].live_end < self.nodes[cur_id].live_start {
                to_remove.push(id);
            }
        }
        for id in to_remove {
            if let Ok(at) = self.live_nodes.binary_search(&id) {
                self.live_nodes.remove(at);
            }
        }

        for i in 0..self.live_nodes.len() {
            let id = self.live_nodes[i];
            self.nodes[cur_id].neighbours.push(id);
            self.nodes[id].neighbours.push(cur_id);
        }

        let at = self.live_nodes.partition_point(|&id| id < cur_id);
        self.live_nodes.insert(at, cur_id);
    }

    /// Record coalescing affinities between nodes whose names share a phi
    /// web.
    pub fn calculate_affinity(&mut self, web: &PhiWeb) {
        let mut web_variables: FxHashMap<i32, i32> = FxHashMap::default();
        for i in 0..self.nodes.len() {
            let web_id = web.find(self.nodes[i].name);
            if web_id == -1 {
                continue;
            }
            let affinity_name = match web_variables.get(&web_id) {
                None => {
                    web_variables.insert(web_id, self.nodes[i].name);
                    continue;
                }
                Some(&name) => name,
            };
            for j in 0..self.nodes.len() {
                if i == j || self.nodes[j].name != affinity_name {
                    continue;
                }
                self.nodes[i].affinities.push(j);
                self.nodes[j].affinities.push(i);
            }
        }
    }

    /// Coalesce affine nodes, spill until the graph is simple enough,
    /// then greedily color.
    pub fn color_graph(&mut self, num_colors: usize, num_spills: usize) {
        // Aggressive coalescing: merge neighbour sets both ways without
        // re-checking interference.
        for i in 0..self.nodes.len() {
            for a in 0..self.nodes[i].affinities.len() {
                let affinity_id = self.nodes[i].affinities[a];
                if self.nodes[i].merged.contains(&affinity_id) {
                    continue;
                }
                let from_affinity: Vec<usize> = self.nodes[affinity_id]
                    .neighbours
                    .iter()
                    .copied()
                    .filter(|&n| n != i)
                    .collect();
                for n in from_affinity {
                    if !self.nodes[i].neighbours.contains(&n) {
                        self.nodes[i].neighbours.push(n);
                    }
                }
                let from_node: Vec<usize> = self.nodes[i]
                    .neighbours
                    .iter()
                    .copied()
                    .filter(|&n| n != affinity_id)
                    .collect();
                for n in from_node {
                    if !self.nodes[affinity_id].neighbours.contains(&n) {
                        self.nodes[affinity_id].neighbours.push(n);
                    }
                }
                self.nodes[i].merged.push(affinity_id);
                self.nodes[affinity_id].merged.push(i);
            }
        }

        // Simplification by spilling: two registers of the class are set
        // aside as spill scratch, and any node with at least as many
        // neighbours as the remaining colors is spilled and detached,
        // until a fixed point.
        let colors_to_use = num_colors.saturating_sub(num_spills);
        let mut changes = true;
        while changes {
            changes = false;
            for i in 0..self.nodes.len() {
                if self.nodes[i].spilled || self.nodes[i].neighbours.len() < colors_to_use {
                    continue;
                }
                let neighbours = self.nodes[i].neighbours.clone();
                for n in neighbours {
                    self.nodes[n].remove_neighbour(i);
                }
                self.nodes[i].spilled = true;
                self.nodes[i].neighbours.clear();
                changes = true;
            }
        }

        // Greedy coloring, propagating the color across merged partners.
        for i in 0..self.nodes.len() {
            if self.nodes[i].spilled || self.nodes[i].color != -1 {
                continue;
            }
            let mut used = vec![false; colors_to_use];
            for &n in &self.nodes[i].neighbours {
                let color = self.nodes[n].color;
                if color >= 0 && (color as usize) < colors_to_use {
                    used[color as usize] = true;
                }
            }
            for c in 0..colors_to_use {
                if used[c] {
                    continue;
                }
                self.nodes[i].color = c as i32;
                let merged = self.nodes[i].merged.clone();
                for m in merged {
                    self.nodes[m].color = c as i32;
                }
                break;
            }
        }
    }

    /// The node covering `(name, pos)`, either directly or through a
    /// merged partner's range.
    pub fn find_node(&self, name: i32, pos: i32) -> i32 {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.name != name {
                continue;
            }
            if pos >= node.live_start && node.live_end >= pos {
                return i as i32;
            }
            for &m in &node.merged {
                let merge_node = &self.nodes[m];
                if pos >= merge_node.live_start && merge_node.live_end >= pos {
                    return i as i32;
                }
            }
        }
        -1
    }
}

/// The graph-coloring allocator: interference per class, coalescing via
/// phi webs, greedy coloring, and a spill plan shared with the linear
/// allocator's record format.
pub struct GraphAllocator {
    file: RegisterFile,
    general: InterferenceGraph,
    sse: InterferenceGraph,
    general_registers: Vec<usize>,
    sse_registers: Vec<usize>,
    stack: StackAllocator,
    spills: FxHashMap<i32, Vec<SpillRecord>>,
    restores: FxHashMap<i32, Vec<RestoreRecord>>,
    registers_set: Vec<bool>,
}

impl GraphAllocator {
    pub fn new(file: RegisterFile) -> Self {
        let num_registers = file.num_registers();
        let general_registers = file.allocatable(RegClass::General);
        let sse_registers = file.allocatable(RegClass::Sse);
        Self {
            file,
            general: InterferenceGraph::new(),
            sse: InterferenceGraph::new(),
            general_registers,
            sse_registers,
            stack: StackAllocator::new(),
            spills: FxHashMap::default(),
            restores: FxHashMap::default(),
            registers_set: vec![false; num_registers],
        }
    }

    fn registers(&self, class: RegClass) -> &[usize] {
        match class {
            RegClass::General => &self.general_registers,
            RegClass::Sse => &self.sse_registers,
        }
    }

    fn graph(&self, class: RegClass) -> &InterferenceGraph {
        match class {
            RegClass::General => &self.general,
            RegClass::Sse => &self.sse,
        }
    }

    fn build_interference(&mut self, module: &Module, cfg: &FlowGraph) {
        let mut live_range = LiveRange::new();
        live_range.compute(cfg);

        let mut pos = 0i32;
        for id in cfg.block_order() {
            let bb = cfg.block(id);
            for ins in &bb.instructions {
                match ins.op {
                    Op::Br | Op::Arg | Op::Cmp | Op::Return | Op::Store => {
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
                let live = live_range.get_live_range(pos as usize);
                let node =
                    InterferenceNode::new(ins.name, ins.op == Op::Phi, pos, pos + live);
                match class {
                    RegClass::General => self.general.insert(node),
                    RegClass::Sse => self.sse.insert(node),
                }
                pos += 1;
            }
        }
    }

    fn generate_spills_and_restores(
        &mut self,
        uses: &Uses,
        class: RegClass,
    ) -> CompileResult<()> {
        let registers = self.registers(class);
        let has_spills = match class {
            RegClass::General => self.general.nodes().iter().any(|n| n.color() == -1),
            RegClass::Sse => self.sse.nodes().iter().any(|n| n.color() == -1),
        };
        if !has_spills {
            return Ok(());
        }
        if registers.len() < NUM_SPILL_SCRATCH {
            return Err(CompileError::Allocator(
                "ran out of registers and spill fallbacks".to_string(),
            ));
        }
        let reg1 = registers[registers.len() - 1];
        let reg2 = registers[registers.len() - 2];
        self.registers_set[reg1] = true;
        self.registers_set[reg2] = true;

        let num_nodes = self.graph(class).nodes().len();
        for i in 0..num_nodes {
            let node = &self.graph(class).nodes()[i];
            if node.color() != -1 {
                continue;
            }
            let name = node.name();
            let is_phi = node.is_phi();
            let live_start = node.live_start();

            // Merged nodes share one slot.
            let mut slot = -1;
            for &m in self.graph(class).nodes()[i].merged() {
                let merge_name = self.graph(class).nodes()[m].name();
                let merge_slot = self.stack.find_slot(merge_name);
                if merge_slot != -1 {
                    slot = merge_slot;
                    break;
                }
            }
            if slot == -1 {
                slot = self.stack.allocate_slot(name, 8);
            }

            for use_ref in uses.get_uses(name) {
                let use_pos = use_ref.pos;
                match self.restores.get_mut(&use_pos) {
                    Some(list) => list.push(RestoreRecord { register: reg1, name, slot }),
                    None => {
                        self.restores.insert(
                            use_pos,
                            vec![RestoreRecord { register: reg2, name, slot }],
                        );
                    }
                }
            }

            // A phi is materialized in place; only real definitions store
            // their value out.
            if is_phi {
                continue;
            }
            self.spills.entry(live_start).or_insert_with(|| {
                vec![SpillRecord { register: reg1, name, slot }]
            });
        }
        Ok(())
    }

    fn gather_used_registers(&mut self, class: RegClass) {
        let registers = self.registers(class).to_vec();
        let colors: Vec<i32> = self.graph(class).nodes().iter().map(|n| n.color()).collect();
        for color in colors {
            if color >= 0 && (color as usize) < registers.len() {
                self.registers_set[registers[color as usize]] = true;
            }
        }
    }
}

impl Allocator for GraphAllocator {
    fn allocate(&mut self, module: &Module, cfg: &mut FlowGraph) -> CompileResult<()> {
        // Critical edges must be split before positions are fixed, so the
        // later web rewrite cannot move a value onto a shared edge.
        ssa::split_critical_edges(cfg);

        self.registers_set = vec![false; self.file.num_registers()];
        self.build_interference(module, cfg);

        let mut web = PhiWeb::new();
        web.find_phi_webs(cfg);
        self.general.calculate_affinity(&web);
        self.sse.calculate_affinity(&web);

        self.general
            .color_graph(self.general_registers.len(), NUM_SPILL_SCRATCH);
        self.sse.color_graph(self.sse_registers.len(), NUM_SPILL_SCRATCH);

        // Out of SSA: webs collapse onto their representative names while
        // every instruction keeps its linear position.
        ssa::destruct(cfg);

        let mut uses = Uses::new();
        uses.analyze(cfg);
        self.generate_spills_and_restores(&uses, RegClass::General)?;
        self.generate_spills_and_restores(&uses, RegClass::Sse)?;

        self.gather_used_registers(RegClass::General);
        self.gather_used_registers(RegClass::Sse);
        trace!(
            stack_slots = self.stack.num_slots(),
            "graph allocation complete"
        );
        Ok(())
    }

    fn register_for(&self, name: i32, pos: i32) -> i32 {
        let general_pos = self.general.find_node(name, pos);
        if general_pos != -1 {
            let node = &self.general.nodes()[general_pos as usize];
            if node.color() != -1 {
                return self.general_registers[node.color() as usize] as i32;
            }
        }
        let sse_pos = self.sse.find_node(name, pos);
        if sse_pos != -1 {
            let node = &self.sse.nodes()[sse_pos as usize];
            if node.color() != -1 {
                return self.sse_registers[node.color() as usize] as i32;
            }
        }

        if let Some(restores) = self.restores.get(&pos) {
            for r in restores {
                if r.name == name {
                    return r.register as i32;
                }
            }
            for (graph, node_pos) in
                [(&self.general, general_pos), (&self.sse, sse_pos)]
            {
                if node_pos == -1 {
                    continue;
                }
                for &m in graph.nodes()[node_pos as usize].merged() {
                    let merge_name = graph.nodes()[m].name();
                    for r in restores {
                        if r.name == merge_name {
                            return r.register as i32;
                        }
                    }
                }
            }
        }

        if let Some(spills) = self.spills.get(&pos) {
            for s in spills {
                if s.name == name {
                    return s.register as i32;
                }
            }
            for (graph, node_pos) in
                [(&self.general, general_pos), (&self.sse, sse_pos)]
            {
                if node_pos == -1 {
                    continue;
                }
                for &m in graph.nodes()[node_pos as usize].merged() {
                    let merge_name = graph.nodes()[m].name();
                    for s in spills {
                        if s.name == merge_name {
                            return s.register as i32;
                        }
                    }
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
    fn test_insert_builds_neighbours() {
        let mut graph = InterferenceGraph::new();
        graph.insert(InterferenceNode::new(1000, false, 0, 5));
        graph.insert(InterferenceNode::new(1001, false, 1, 3));
        graph.insert(InterferenceNode::new(1002, false, 4, 6));
        graph.insert(InterferenceNode::new(1003, false, 5, 7));

        let nodes = graph.nodes();
        assert_eq!(nodes[0].neighbours().len(), 3);
        assert_eq!(nodes[0].neighbours()[0], 1);
        assert_eq!(nodes[1].neighbours(), &[0]);
        assert_eq!(nodes[2].neighbours().len(), 2);
        assert_eq!(nodes[3].neighbours().len(), 2);
    }

    #[test]
    fn test_greedy_coloring() {
        let mut graph = InterferenceGraph::new();
        graph.insert(InterferenceNode::new(1000, false, 0, 5));
        graph.insert(InterferenceNode::new(1001, false, 1, 3));
        graph.insert(InterferenceNode::new(1002, false, 4, 6));
        graph.insert(InterferenceNode::new(1003, false, 5, 7));
        graph.color_graph(6, 2);

        let nodes = graph.nodes();
        assert_eq!(nodes[0].color(), 0);
        assert_eq!(nodes[1].color(), 1);
        assert_eq!(nodes[2].color(), 1);
        assert_eq!(nodes[3].color(), 2);
    }

    #[test]
    fn test_spilling_when_colors_exhausted() {
        let mut graph = InterferenceGraph::new();
        for i in 0..8 {
            graph.insert(InterferenceNode::new(1000 + i, false, i, 15));
        }
        graph.color_graph(6, 2);

        let nodes = graph.nodes();
        assert!(nodes[0].spilled());
        assert!(nodes[1].spilled());
        assert_eq!(nodes[4].color(), 0);
        assert_eq!(nodes[5].color(), 1);
        assert_eq!(nodes[6].color(), 2);
        assert_eq!(nodes[7].color(), 3);
    }

    #[test]
    fn test_affinity_merges_phi_web() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1001, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Phi));

        let mut web = PhiWeb::new();
        web.find_phi_webs(&cfg);

        let mut graph = InterferenceGraph::new();
        graph.insert(InterferenceNode::new(1000, false, 0, 2));
        graph.insert(InterferenceNode::new(1001, false, 1, 2));
        graph.insert(InterferenceNode::new(1002, true, 2, 2));
        graph.calculate_affinity(&web);
        graph.color_graph(8, 2);

        assert_eq!(graph.nodes()[0].merged().len(), 2);
        assert_eq!(graph.nodes()[0].neighbours().len(), 2);
        assert_eq!(graph.nodes()[0].color(), 0);
        assert_eq!(graph.nodes()[1].color(), 0);
        assert_eq!(graph.nodes()[2].color(), 0);
    }

    #[test]
    fn test_affinity_with_loop_carried_phi() {
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1001, TYPE_I64, 1000, 1002, Op::Phi));
        b.add_instruction(Instruction::with_imm(1002, TYPE_I64, 0, Op::Constant));

        let mut web = PhiWeb::new();
        web.find_phi_webs(&cfg);

        let mut graph = InterferenceGraph::new();
        graph.insert(InterferenceNode::new(1000, false, 0, 2));
        graph.insert(InterferenceNode::new(1001, true, 1, 2));
        graph.insert(InterferenceNode::new(1002, false, 2, 2));
        graph.calculate_affinity(&web);
        graph.color_graph(8, 2);

        assert_eq!(graph.nodes()[0].merged().len(), 2);
        assert_eq!(graph.nodes()[0].color(), 0);
        assert_eq!(graph.nodes()[1].color(), 0);
        assert_eq!(graph.nodes()[2].color(), 0);
    }

    #[test]
    fn test_end_to_end_straight_line() {
        let mut module = Module::new();
        module.constants.intern_i64(100);
        module.constants.intern_i64(200);
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1001, TYPE_I64, 1, Op::Constant));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Add));
        b.add_instruction(Instruction::new(1003, TYPE_I64, 1001, 1002, Op::Add));
        b.add_instruction(Instruction::new(1004, TYPE_I64, 1003, 1002, Op::Add));

        let mut alloc = GraphAllocator::new(general_file(8));
        alloc.allocate(&module, &mut cfg).unwrap();

        assert_eq!(alloc.register_for(1000, 0), 0);
        assert_eq!(alloc.register_for(1001, 1), 1);
        assert_eq!(alloc.register_for(1002, 2), 2);
        assert_eq!(alloc.register_for(1003, 3), 0);
        assert_eq!(alloc.register_for(1004, 4), 1);
    }

    #[test]
    fn test_spill_plan_records() {
        let mut module = Module::new();
        let mut cfg = FlowGraph::new();
        let bb = cfg.add_block();
        let b = cfg.block_mut(bb);
        b.add_instruction(Instruction::with_imm(1000, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1001, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1002, TYPE_I64, 1000, 1001, Op::Add));
        b.add_instruction(Instruction::with_imm(1003, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::with_imm(1004, TYPE_I64, 0, Op::Constant));
        b.add_instruction(Instruction::new(1005, TYPE_I64, 1003, 1004, Op::Add));
        b.add_instruction(Instruction::new(1006, TYPE_I64, 1005, 1002, Op::Add));
        b.add_instruction(Instruction::new(1007, TYPE_I64, 1006, 1000, Op::Add));
        b.add_instruction(Instruction::new(1008, TYPE_I64, 1007, 1001, Op::Add));

        let mut alloc = GraphAllocator::new(general_file(8));
        alloc.allocate(&module, &mut cfg).unwrap();

        let spill0 = alloc.spills_at(0);
        assert_eq!(spill0.len(), 1);
        assert_eq!(spill0[0].name, 1000);
        let spill1 = alloc.spills_at(1);
        assert_eq!(spill1.len(), 1);
        assert_eq!(spill1[0].name, 1001);

        let restore2 = alloc.restores_at(2);
        assert_eq!(restore2.len(), 2);
        assert_eq!(restore2[0].name, 1000);
        assert_eq!(restore2[1].name, 1001);
        let restore7 = alloc.restores_at(7);
        assert_eq!(restore7[0].name, 1000);
        let restore8 = alloc.restores_at(8);
        assert_eq!(restore8[0].name, 1001);
        // Restores land in the two scratch registers only.
        for pos in [2, 7, 8] {
            for r in alloc.restores_at(pos) {
                assert!(r.register == 6 || r.register == 7);
            }
        }
    }

    // Two colors plus two scratch: four overlapping ranges spill exactly
    // the excess.
    #[test]
    fn test_four_overlapping_ranges_with_two_usable_colors() {
        let mut graph = InterferenceGraph::new();
        for i in 0..4 {
            graph.insert(InterferenceNode::new(2000 + i, false, i, 9));
        }
        graph.color_graph(4, 2);
        let spilled = graph.nodes().iter().filter(|n| n.spilled()).count();
        assert_eq!(spilled, 2);
        let colored = graph.nodes().iter().filter(|n| n.color() != -1).count();
        assert_eq!(colored, 2);
    }
}
