//! Phi webs: union-find with path compression over value names, where a
//! phi's result is unioned with each of its operands. Names in the same
//! web should receive the same register if possible; the graph-coloring
//! allocator turns webs into coalescing affinities and SSA destruction
//! picks one representative name per web.

use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{FlowGraph, Op};

#[derive(Debug, Default)]
pub struct PhiWeb {
    parent: FxHashMap<i32, i32>,
}

impl PhiWeb {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: i32) {
        self.parent.entry(name).or_insert(name);
    }

    /// The representative name of the web containing `name`, or -1 when
    /// the name belongs to no web.
    pub fn find(&self, name: i32) -> i32 {
        let mut cur = name;
        loop {
            match self.parent.get(&cur) {
                None => return if cur == name { -1 } else { cur },
                Some(&p) if p == cur => return cur,
                Some(&p) => cur = p,
            }
        }
    }

    fn find_mut(&mut self, name: i32) -> i32 {
        let mut root = name;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        // Path compression.
        let mut cur = name;
        while let Some(&p) = self.parent.get(&cur) {
            if p == root {
                break;
            }
            self.parent.insert(cur, root);
            cur = p;
        }
        root
    }

    pub fn union(&mut self, left: i32, right: i32) {
        self.add(left);
        self.add(right);
        let left_root = self.find_mut(left);
        let right_root = self.find_mut(right);
        if left_root != right_root {
            self.parent.insert(right_root, left_root);
        }
    }

    /// Union every phi's result with each of its operands.
    pub fn find_phi_webs(&mut self, cfg: &FlowGraph) {
        for id in cfg.block_order() {
            let bb = cfg.block(id);
            for phi in &bb.phis {
                for &value in &phi.values {
                    self.union(phi.name, value);
                }
            }
            for ins in &bb.instructions {
                if ins.op != Op::Phi {
                    continue;
                }
                if ins.left != -1 {
                    self.union(ins.name, ins.left);
                }
                if ins.right != -1 {
                    self.union(ins.name, ins.right);
                }
            }
        }
    }
}
