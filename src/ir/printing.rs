// Graph Printing
//
// Textual renderings used in logs and tests. Shared subexpressions print once
// as `*k -> expr` and afterwards as `*k`.

use crate::core::error::Result;
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::traversal::{applys_between, orphans_between};
use std::collections::HashSet;
use std::fmt::Write;

/// One expression string per output, leaves shown by name
pub fn as_string(graph: &Graph, inputs: &[VarId], outputs: &[VarId]) -> Vec<String> {
    let iset: HashSet<VarId> = inputs.iter().copied().collect();
    let orphans: HashSet<VarId> = orphans_between(graph, inputs, outputs).into_iter().collect();

    // nodes reached more than once get a back-reference index
    let mut multi: Vec<NodeId> = Vec::new();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut note = |node: NodeId, multi: &mut Vec<NodeId>| {
        if !seen.insert(node) && !multi.contains(&node) {
            multi.push(node);
        }
    };
    for output in outputs {
        if let Some(node) = graph.owner(*output) {
            note(node, &mut multi);
        }
    }
    for node in applys_between(graph, inputs, outputs) {
        for input in &graph.node(node).inputs {
            if iset.contains(input) || orphans.contains(input) {
                continue;
            }
            if let Some(owner) = graph.owner(*input) {
                note(owner, &mut multi);
            }
        }
    }

    let mut done: HashSet<NodeId> = HashSet::new();
    outputs
        .iter()
        .map(|o| describe(graph, *o, &iset, &orphans, &multi, &mut done))
        .collect()
}

fn describe(
    graph: &Graph,
    var: VarId,
    iset: &HashSet<VarId>,
    orphans: &HashSet<VarId>,
    multi: &[NodeId],
    done: &mut HashSet<NodeId>,
) -> String {
    let owner = match graph.owner(var) {
        Some(node) if !iset.contains(&var) && !orphans.contains(&var) => node,
        _ => return leaf_label(graph, var),
    };
    let apply = graph.node(owner);
    let suffix = if apply.outputs.len() == 1 {
        String::new()
    } else {
        format!("::{}", graph.var(var).index)
    };
    let index = multi.iter().position(|n| *n == owner).map(|p| p + 1);
    if !done.insert(owner) {
        return format!("*{}{}", index.unwrap_or(0), suffix);
    }
    let args: Vec<String> = apply
        .inputs
        .clone()
        .iter()
        .map(|i| describe(graph, *i, iset, orphans, multi, done))
        .collect();
    let body = format!("{}({})", apply.op.name(), args.join(", "));
    match index {
        Some(k) => format!("*{} -> {}", k, body),
        None => body,
    }
}

fn leaf_label(graph: &Graph, var: VarId) -> String {
    match (&graph.var(var).name, graph.constant_value(var)) {
        (Some(name), _) => name.clone(),
        (None, Some(value)) => value.to_string(),
        (None, None) => var.to_string(),
    }
}

/// One line per node in execution order, with its inputs and outputs
pub fn debugprint(fgraph: &FunctionGraph) -> Result<String> {
    let graph = fgraph.graph();
    let mut out = String::new();
    for node in fgraph.toposort()? {
        let apply = graph.node(node);
        let ins: Vec<String> = apply.inputs.iter().map(|v| leaf_label(graph, *v)).collect();
        let outs: Vec<String> = apply.outputs.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(
            out,
            "{} [id {}] ({}) -> ({})",
            apply.op.name(),
            node,
            ins.join(", "),
            outs.join(", ")
        );
    }
    let outs: Vec<String> = fgraph.outputs().iter().map(|v| leaf_label(graph, *v)).collect();
    let _ = writeln!(out, "outputs: {}", outs.join(", "));
    Ok(out)
}
