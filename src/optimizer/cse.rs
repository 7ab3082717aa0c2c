// Merge (Common Subexpression Elimination)
//
// Two constants are equal when they share a type and a value signature. Two
// nodes are equal when they apply the same op (compared by name, which
// carries the op's parameters) to the same inputs. Nodes are visited in
// topological order, so once a node's inputs are merged its own duplicates
// become visible. Ops that overwrite an input are never merged.

use crate::core::error::Result;
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::traversal::io_toposort;
use crate::ir::types::TensorType;
use crate::optimizer::pass::OptimizationPass;
use std::collections::HashMap;

/// Merges equal constants and equal nodes
#[derive(Debug, Default)]
pub struct MergeOptimizer;

impl MergeOptimizer {
    pub fn new() -> Self {
        MergeOptimizer
    }

    fn merge_constants(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let constants: Vec<VarId> = fgraph
            .variables()
            .filter(|v| fgraph.graph().is_constant(*v))
            .collect();
        let mut seen: HashMap<(TensorType, String), VarId> = HashMap::new();
        let mut changed = false;
        for c in constants {
            if !fgraph.contains_var(c) {
                continue;
            }
            let key = match fgraph.graph().constant_value(c) {
                Some(value) => (fgraph.graph().ty(c).clone(), value.signature()),
                None => continue,
            };
            match seen.get(&key) {
                Some(&keep) => changed |= self.try_replace(fgraph, &[(c, keep)])?,
                None => {
                    seen.insert(key, c);
                }
            }
        }
        Ok(changed)
    }

    fn merge_nodes(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let order = io_toposort(fgraph.graph(), fgraph.inputs(), fgraph.outputs());
        let mut seen: HashMap<(String, Vec<VarId>), NodeId> = HashMap::new();
        let mut changed = false;
        for node in order {
            if !fgraph.contains_node(node) {
                continue;
            }
            let apply = fgraph.graph().node(node);
            if !apply.op.destroy_map().is_empty() {
                continue;
            }
            let key = (apply.op.name(), apply.inputs.clone());
            match seen.get(&key).copied() {
                Some(keep) if fgraph.contains_node(keep) => {
                    let pairs: Vec<(VarId, VarId)> = apply
                        .outputs
                        .iter()
                        .copied()
                        .zip(fgraph.graph().node(keep).outputs.iter().copied())
                        .collect();
                    if self.try_replace(fgraph, &pairs)? {
                        log::trace!("merge: {} into {}", node, keep);
                        changed = true;
                    }
                }
                _ => {
                    seen.insert(key, node);
                }
            }
        }
        Ok(changed)
    }

    fn try_replace(&self, fgraph: &mut FunctionGraph, pairs: &[(VarId, VarId)]) -> Result<bool> {
        match fgraph.replace_validate(pairs, "merge") {
            Ok(()) => Ok(true),
            Err(err) if err.is_inconsistency() => {
                log::debug!("merge: skipped {:?}: {}", pairs, err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl OptimizationPass for MergeOptimizer {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let constants = self.merge_constants(fgraph)?;
        let nodes = self.merge_nodes(fgraph)?;
        Ok(constants || nodes)
    }

    fn name(&self) -> &str {
        "merge"
    }
}
