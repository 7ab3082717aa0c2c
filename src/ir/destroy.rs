// Destroy Handler
//
// Tracks which variables are overwritten by in-place ops and which are views
// of others. Validation rejects destroying protected storage, two destroyers
// of one buffer, and a destroyer that also reads an alias of the buffer it
// overwrites. Every other reader of the buffer is ordered before the
// destroyer; if that ordering is impossible the graph is inconsistent.

use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::{Client, Feature, FunctionGraph};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::traversal::io_toposort_with_orderings;
use std::any::Any;
use std::collections::{HashMap, HashSet};

/// Follow view and destroy maps back to the variable that owns the storage
pub fn view_root(graph: &Graph, var: VarId) -> VarId {
    let mut current = var;
    loop {
        let Some(owner) = graph.owner(current) else {
            return current;
        };
        let apply = graph.node(owner);
        let index = graph.var(current).index;
        let view_map = apply.op.view_map();
        let destroy_map = apply.op.destroy_map();
        let aliased = view_map
            .get(&index)
            .or_else(|| destroy_map.get(&index))
            .and_then(|ins| ins.first().copied());
        match aliased {
            Some(i) => current = apply.inputs[i],
            None => return current,
        }
    }
}

/// Feature validating destructive operations
#[derive(Debug, Default)]
pub struct DestroyHandler {
    /// Graph inputs that may be overwritten
    mutable_inputs: HashSet<VarId>,
}

struct Analysis {
    orderings: HashMap<NodeId, Vec<NodeId>>,
}

impl DestroyHandler {
    pub fn new(mutable_inputs: impl IntoIterator<Item = VarId>) -> Self {
        DestroyHandler {
            mutable_inputs: mutable_inputs.into_iter().collect(),
        }
    }

    pub fn is_mutable(&self, var: VarId) -> bool {
        self.mutable_inputs.contains(&var)
    }

    fn analyze(&self, fgraph: &FunctionGraph) -> Result<Analysis> {
        let graph = fgraph.graph();
        let mut destroyer_of: HashMap<VarId, NodeId> = HashMap::new();

        for node in fgraph.apply_nodes() {
            let apply = graph.node(node);
            for destroyed in apply.op.destroy_map().values() {
                for &i in destroyed {
                    let var = apply.inputs[i];
                    let root = view_root(graph, var);
                    if graph.is_constant(root) {
                        return Err(GraphError::Inconsistency(format!(
                            "{} overwrites a constant",
                            apply.op.name()
                        )));
                    }
                    if fgraph.is_input(root) && !self.mutable_inputs.contains(&root) {
                        return Err(GraphError::Inconsistency(format!(
                            "{} overwrites protected input {}",
                            apply.op.name(),
                            graph.label(root)
                        )));
                    }
                    if let Some(other) = destroyer_of.insert(root, node) {
                        if other != node {
                            return Err(GraphError::Inconsistency(format!(
                                "{} is overwritten by both {} and {}",
                                graph.label(root),
                                other,
                                node
                            )));
                        }
                    }
                    for (j, other_input) in apply.inputs.iter().enumerate() {
                        if j != i && view_root(graph, *other_input) == root {
                            return Err(GraphError::Inconsistency(format!(
                                "input {} of {} aliases the input {} it overwrites",
                                j,
                                apply.op.name(),
                                i
                            )));
                        }
                    }
                }
            }
        }

        let mut orderings: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        if destroyer_of.is_empty() {
            return Ok(Analysis { orderings });
        }

        // alias classes of every live variable
        let mut aliases: HashMap<VarId, Vec<VarId>> = HashMap::new();
        for var in fgraph.variables() {
            aliases.entry(view_root(graph, var)).or_default().push(var);
        }

        for (root, destroyer) in &destroyer_of {
            let after = descendants(fgraph, *destroyer);
            for alias in aliases.get(root).map(Vec::as_slice).unwrap_or(&[]) {
                if graph.owner(*alias).map_or(false, |o| after.contains(&o) || o == *destroyer) {
                    continue;
                }
                if fgraph.is_output(*alias) {
                    return Err(GraphError::Inconsistency(format!(
                        "{} is a graph output but is overwritten by {}",
                        graph.label(*alias),
                        graph.op(*destroyer).name()
                    )));
                }
                for client in fgraph.clients(*alias) {
                    let Client::Node(reader, _) = *client else {
                        continue;
                    };
                    if reader == *destroyer {
                        continue;
                    }
                    if after.contains(&reader) {
                        return Err(GraphError::Inconsistency(format!(
                            "{} reads {} after {} overwrites it",
                            graph.op(reader).name(),
                            graph.label(*alias),
                            graph.op(*destroyer).name()
                        )));
                    }
                    let before = orderings.entry(*destroyer).or_default();
                    if !before.contains(&reader) {
                        before.push(reader);
                    }
                }
            }
        }

        io_toposort_with_orderings(graph, fgraph.inputs(), fgraph.outputs(), &orderings).map_err(
            |err| GraphError::Inconsistency(format!("destroy orderings are unsatisfiable: {}", err)),
        )?;
        Ok(Analysis { orderings })
    }
}

/// Nodes that consume, directly or transitively, an output of `node`
fn descendants(fgraph: &FunctionGraph, node: NodeId) -> HashSet<NodeId> {
    let graph = fgraph.graph();
    let mut seen = HashSet::new();
    let mut todo: Vec<VarId> = graph.node(node).outputs.clone();
    while let Some(var) = todo.pop() {
        for client in fgraph.clients(var) {
            if let Client::Node(n, _) = client {
                if seen.insert(*n) {
                    todo.extend(graph.node(*n).outputs.iter().copied());
                }
            }
        }
    }
    seen
}

impl Feature for DestroyHandler {
    fn name(&self) -> &str {
        "DestroyHandler"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn on_attach(&mut self, fgraph: &FunctionGraph) -> Result<()> {
        if fgraph.has_feature("DestroyHandler") {
            return Err(GraphError::InvalidValue(
                "a DestroyHandler is already attached".to_string(),
            ));
        }
        self.analyze(fgraph).map(|_| ())
    }

    fn validate(&self, fgraph: &FunctionGraph) -> Result<()> {
        self.analyze(fgraph).map(|_| ())
    }

    fn orderings(&self, fgraph: &FunctionGraph) -> HashMap<NodeId, Vec<NodeId>> {
        match self.analyze(fgraph) {
            Ok(analysis) => analysis.orderings,
            Err(err) => {
                log::warn!("destroy handler: no orderings for an invalid graph: {}", err);
                HashMap::new()
            }
        }
    }
}
