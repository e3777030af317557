//! Dominator analysis: dominator sets, immediate dominators, the
//! dominance frontier, and iterated dominance frontier queries.
//!
//! Nodes are numbered by the flow graph's textual block order; node 0 is
//! the entry block. Dominators are computed by the iterative fixed point
//! `Dom(n) = {n} ∪ ⋂ Dom(p)` over predecessors, seeded with the full node
//! set for every non-entry node.

use crate::common::fx_hash::{FxHashMap, FxHashSet};
use crate::ir::ir::{BlockId, FlowGraph};

/// Per-block dominance facts. All block references are node indices into
/// the analysis, not arena ids.
#[derive(Debug, Default)]
pub struct DomNode {
    block: BlockId,
    predecessors: Vec<usize>,
    successors: Vec<usize>,
    /// Nodes which dominate this node, ascending.
    dominators: Vec<usize>,
    /// Children in the dominator tree, ascending.
    children: Vec<usize>,
    dominance_frontier: Vec<usize>,
    immediate_dominator: Option<usize>,
}

impl DomNode {
    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn predecessors(&self) -> &[usize] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[usize] {
        &self.successors
    }

    pub fn dominators(&self) -> &[usize] {
        &self.dominators
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn dominance_frontier(&self) -> &[usize] {
        &self.dominance_frontier
    }

    pub fn immediate_dominator(&self) -> Option<usize> {
        self.immediate_dominator
    }
}

#[derive(Debug, Default)]
pub struct Dom {
    nodes: Vec<DomNode>,
    block_to_node: FxHashMap<BlockId, usize>,
}

impl Dom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(&mut self, cfg: &FlowGraph) {
        self.nodes.clear();
        self.block_to_node.clear();

        let order = cfg.block_order();
        for (i, &id) in order.iter().enumerate() {
            self.block_to_node.insert(id, i);
            self.nodes.push(DomNode { block: id, ..Default::default() });
        }

        self.compute_edges(cfg, &order);
        self.compute_dominators();
        self.compute_immediate_dominators();
        self.compute_dominance_frontier();
    }

    pub fn start(&self) -> usize {
        0
    }

    pub fn num(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, index: usize) -> &DomNode {
        &self.nodes[index]
    }

    pub fn node_of(&self, block: BlockId) -> usize {
        self.block_to_node[&block]
    }

    /// Whether node `d` dominates node `n`.
    pub fn dominates(&self, d: usize, n: usize) -> bool {
        self.nodes[n].dominators.binary_search(&d).is_ok()
    }

    fn compute_edges(&mut self, cfg: &FlowGraph, order: &[BlockId]) {
        for (i, &id) in order.iter().enumerate() {
            for succ in cfg.successors(id) {
                let j = self.block_to_node[&succ];
                self.nodes[i].successors.push(j);
                self.nodes[j].predecessors.push(i);
            }
        }
    }

    fn compute_dominators(&mut self) {
        let n = self.nodes.len();
        let all: FxHashSet<usize> = (0..n).collect();
        let mut doms: Vec<FxHashSet<usize>> = (0..n)
            .map(|i| {
                if i == 0 {
                    std::iter::once(0).collect()
                } else {
                    all.clone()
                }
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..n {
                let mut new_doms: Option<FxHashSet<usize>> = None;
                for &p in &self.nodes[i].predecessors {
                    match &mut new_doms {
                        None => new_doms = Some(doms[p].clone()),
                        Some(set) => set.retain(|d| doms[p].contains(d)),
                    }
                }
                let mut new_doms = new_doms.unwrap_or_default();
                new_doms.insert(i);
                if new_doms != doms[i] {
                    doms[i] = new_doms;
                    changed = true;
                }
            }
        }

        for (i, set) in doms.into_iter().enumerate() {
            let mut sorted: Vec<usize> = set.into_iter().collect();
            sorted.sort_unstable();
            self.nodes[i].dominators = sorted;
        }
    }

    /// The immediate dominator of `n` is the strict dominator of `n` that
    /// is dominated by every other strict dominator of `n`.
    fn compute_immediate_dominators(&mut self) {
        for i in 0..self.nodes.len() {
            let strict: Vec<usize> = self.nodes[i]
                .dominators
                .iter()
                .copied()
                .filter(|&d| d != i)
                .collect();
            let idom = strict
                .iter()
                .copied()
                .find(|&d| strict.iter().all(|&other| self.dominates(other, d)));
            self.nodes[i].immediate_dominator = idom;
            if let Some(idom) = idom {
                self.nodes[idom].children.push(i);
            }
        }
        for node in &mut self.nodes {
            node.children.sort_unstable();
        }
    }

    /// DF(n) = {y : ∃ p ∈ preds(y). n ∈ Dom(p) ∧ (n = y ∨ n ∉ strictDom(y))},
    /// computed by walking from each predecessor of a join up the dominator
    /// tree until the join's immediate dominator is reached.
    fn compute_dominance_frontier(&mut self) {
        let n = self.nodes.len();
        let mut frontier: Vec<FxHashSet<usize>> = vec![FxHashSet::default(); n];
        for y in 0..n {
            let Some(idom) = self.nodes[y].immediate_dominator else {
                continue;
            };
            for p in self.nodes[y].predecessors.clone() {
                let mut runner = p;
                while runner != idom {
                    frontier[runner].insert(y);
                    match self.nodes[runner].immediate_dominator {
                        Some(next) => runner = next,
                        None => break,
                    }
                }
            }
        }
        for (i, set) in frontier.into_iter().enumerate() {
            let mut sorted: Vec<usize> = set.into_iter().collect();
            sorted.sort_unstable();
            self.nodes[i].dominance_frontier = sorted;
        }
    }

    /// The closure of the dominance-frontier operation over a set of nodes.
    pub fn iterated_dominance_frontier(&self, nodes: &[usize], out: &mut FxHashSet<usize>) {
        let mut worklist: Vec<usize> = nodes.to_vec();
        while let Some(node) = worklist.pop() {
            for &df in &self.nodes[node].dominance_frontier {
                if out.insert(df) {
                    worklist.push(df);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ir::FlowGraph;

    // A small harness mirroring the CFGs the dominator analysis is
    // exercised with: blocks in textual order, branches by index.
    fn build_cfg(num_blocks: usize, branches: &[(usize, usize, bool)]) -> FlowGraph {
        let mut cfg = FlowGraph::new();
        let ids: Vec<_> = (0..num_blocks).map(|_| cfg.add_block()).collect();
        for &(from, to, unconditional) in branches {
            cfg.set_branch(ids[from], Some(ids[to]), unconditional);
        }
        cfg
    }

    #[test]
    fn test_dominators_diamond() {
        // a -> b (fall) and a -> c (branch); b -> d (unconditional).
        let cfg = build_cfg(4, &[(0, 2, false), (1, 3, true)]);
        let mut dom = Dom::new();
        dom.compute(&cfg);
        assert_eq!(dom.get(3).dominators(), &[0, 3]);
    }

    #[test]
    fn test_dominators_chain() {
        // a -> c (unconditional), c -> b (branch) and c -> d (fall),
        // b -> d (branch) and b -> c (fall).
        let cfg = build_cfg(4, &[(0, 2, true), (1, 3, false), (2, 1, false)]);
        let mut dom = Dom::new();
        dom.compute(&cfg);
        assert_eq!(dom.get(0).dominators(), &[0]);
        assert_eq!(dom.get(1).dominators(), &[0, 1, 2]);
        assert_eq!(dom.get(2).dominators(), &[0, 2]);
        assert_eq!(dom.get(3).dominators(), &[0, 2, 3]);
    }

    #[test]
    fn test_immediate_dominators() {
        let cfg = build_cfg(5, &[(1, 3, false), (2, 4, true)]);
        let mut dom = Dom::new();
        dom.compute(&cfg);
        assert_eq!(dom.get(0).children(), &[1]);
        assert_eq!(dom.get(1).children(), &[2, 3, 4]);
        assert_eq!(dom.get(2).children(), &[] as &[usize]);
        assert_eq!(dom.get(1).immediate_dominator(), Some(0));
        assert_eq!(dom.get(2).immediate_dominator(), Some(1));
        assert_eq!(dom.get(3).immediate_dominator(), Some(1));
        assert_eq!(dom.get(4).immediate_dominator(), Some(1));
        assert_eq!(dom.get(0).immediate_dominator(), None);
    }

    #[test]
    fn test_dominance_frontier() {
        let cfg = build_cfg(4, &[(0, 2, true), (1, 3, false), (2, 1, false)]);
        let mut dom = Dom::new();
        dom.compute(&cfg);
        assert_eq!(dom.get(0).dominance_frontier(), &[] as &[usize]);
        assert_eq!(dom.get(1).dominance_frontier(), &[2, 3]);
        assert_eq!(dom.get(2).dominance_frontier(), &[2]);
        assert_eq!(dom.get(3).dominance_frontier(), &[] as &[usize]);
    }

    #[test]
    fn test_iterated_dominance_frontier() {
        let cfg = build_cfg(4, &[(0, 2, true), (1, 3, false), (2, 1, false)]);
        let mut dom = Dom::new();
        dom.compute(&cfg);
        let mut idf = FxHashSet::default();
        dom.iterated_dominance_frontier(&[1], &mut idf);
        assert_eq!(idf.len(), 2);
        assert!(idf.contains(&2));
        assert!(idf.contains(&3));
    }
}
