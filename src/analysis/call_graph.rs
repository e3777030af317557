//! Static call graph over the module's functions, with strongly connected
//! components attached so the inliner can iterate bottom-up and refuse to
//! inline across recursive cycles.

use crate::analysis::scc::Scc;
use crate::common::fx_hash::FxHashMap;
use crate::ir::ir::{Module, Op};

#[derive(Debug)]
pub struct CallGraphNode {
    /// Index of the function in the module.
    pub id: usize,
    pub name: String,
    /// Callee function indices.
    pub children: Vec<usize>,
    pub scc_id: usize,
}

impl CallGraphNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CallGraph {
    nodes: Vec<CallGraphNode>,
    by_name: FxHashMap<String, usize>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[CallGraphNode] {
        &self.nodes
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<&CallGraphNode> {
        self.by_name.get(name).map(|&i| &self.nodes[i])
    }

    pub fn analyze(&mut self, module: &Module) {
        self.nodes.clear();
        self.by_name.clear();

        for (id, function) in module.functions.iter().enumerate() {
            self.by_name.insert(function.full_name.clone(), id);
            self.nodes.push(CallGraphNode {
                id,
                name: function.full_name.clone(),
                children: Vec::new(),
                scc_id: id,
            });
        }

        for (id, function) in module.functions.iter().enumerate() {
            for block in function.cfg.block_order() {
                for ins in &function.cfg.block(block).instructions {
                    if ins.op != Op::Call {
                        continue;
                    }
                    let Some(symbol) = module.get_symbol(ins.right) else {
                        continue;
                    };
                    if let Some(&callee) = self.by_name.get(symbol) {
                        if !self.nodes[id].children.contains(&callee) {
                            self.nodes[id].children.push(callee);
                        }
                    }
                }
            }
        }

        let mut scc = Scc::new();
        scc.init(self.nodes.len());
        for node in &self.nodes {
            for &child in &node.children {
                scc.add_edge(node.id, child);
            }
        }
        scc.compute();
        for node in &mut self.nodes {
            node.scc_id = scc.header(node.id);
        }
    }
}
