// Local Rewrites and their Schedulers
//
// A local rewriter looks at one node and proposes replacement outputs. The
// topological scheduler offers every live node to a list of rewriters once;
// the equilibrium scheduler repeats sweeps until nothing fires, failing
// when the sweep cap is reached first.

use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::traversal::io_toposort;
use crate::optimizer::pass::OptimizationPass;
use std::sync::Arc;

/// Rule matching a single node
pub trait LocalRewriter: Send + Sync {
    fn name(&self) -> &str;

    /// Replacement for each output of `node`, or None when the rule does not
    /// match. New nodes are built in `fgraph.graph_mut()`; the caller does
    /// the replacement.
    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>>;
}

/// Run one rewriter on one node and commit its proposal.
///
/// A proposal rejected by the destroy handler is rolled back and counts as
/// no change; every other failure propagates.
pub fn apply_local(
    rewriter: &dyn LocalRewriter,
    fgraph: &mut FunctionGraph,
    node: NodeId,
) -> Result<bool> {
    if !fgraph.contains_node(node) {
        return Ok(false);
    }
    let Some(new_outputs) = rewriter.transform(fgraph, node)? else {
        return Ok(false);
    };
    let old_outputs = fgraph.graph().node(node).outputs.clone();
    if new_outputs.len() != old_outputs.len() {
        return Err(GraphError::InvalidValue(format!(
            "{} proposed {} outputs for a node with {}",
            rewriter.name(),
            new_outputs.len(),
            old_outputs.len()
        )));
    }
    let pairs: Vec<(VarId, VarId)> = old_outputs
        .into_iter()
        .zip(new_outputs)
        .filter(|(old, new)| old != new)
        .collect();
    if pairs.is_empty() {
        return Ok(false);
    }
    match fgraph.replace_validate(&pairs, rewriter.name()) {
        Ok(()) => {
            log::trace!("{} rewrote {}", rewriter.name(), node);
            Ok(true)
        }
        Err(err) if err.is_inconsistency() => {
            log::warn!("{}: rejected rewrite of {}: {}", rewriter.name(), node, err);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// One pass over the nodes in topological order (or reversed)
fn sweep(
    rewriters: &[Arc<dyn LocalRewriter>],
    fgraph: &mut FunctionGraph,
    reverse: bool,
) -> Result<bool> {
    let mut order = io_toposort(fgraph.graph(), fgraph.inputs(), fgraph.outputs());
    if reverse {
        order.reverse();
    }
    let mut changed = false;
    for node in order {
        for rewriter in rewriters {
            if apply_local(rewriter.as_ref(), fgraph, node)? {
                changed = true;
                break;
            }
        }
    }
    Ok(changed)
}

/// Offers each node to the rewriters once
pub struct TopoRewriter {
    name: String,
    rewriters: Vec<Arc<dyn LocalRewriter>>,
    reverse: bool,
}

impl TopoRewriter {
    pub fn new(name: impl Into<String>, rewriters: Vec<Arc<dyn LocalRewriter>>) -> Self {
        TopoRewriter {
            name: name.into(),
            rewriters,
            reverse: false,
        }
    }

    /// Visit outputs before inputs
    pub fn out_to_in(mut self) -> Self {
        self.reverse = true;
        self
    }
}

impl OptimizationPass for TopoRewriter {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        sweep(&self.rewriters, fgraph, self.reverse)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Repeats global passes and a local sweep until nothing changes
pub struct EquilibriumRewriter {
    name: String,
    local: Vec<Arc<dyn LocalRewriter>>,
    global: Vec<Box<dyn OptimizationPass>>,
    max_iterations: usize,
}

impl EquilibriumRewriter {
    pub fn new(name: impl Into<String>, max_iterations: usize) -> Self {
        EquilibriumRewriter {
            name: name.into(),
            local: Vec::new(),
            global: Vec::new(),
            max_iterations,
        }
    }

    pub fn with_local(mut self, rewriter: Arc<dyn LocalRewriter>) -> Self {
        self.local.push(rewriter);
        self
    }

    pub fn with_global(mut self, pass: Box<dyn OptimizationPass>) -> Self {
        self.global.push(pass);
        self
    }
}

impl OptimizationPass for EquilibriumRewriter {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let mut any = false;
        for iteration in 0..self.max_iterations {
            let mut changed = false;
            for pass in &self.global {
                changed |= pass.apply(fgraph)?;
            }
            changed |= sweep(&self.local, fgraph, false)?;
            if !changed {
                log::debug!("{}: fixpoint after {} sweeps", self.name, iteration + 1);
                return Ok(any);
            }
            any = true;
        }
        Err(GraphError::FixpointNotReached {
            rewriter: self.name.clone(),
            iterations: self.max_iterations,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
