// Canonicalization
//
// Local rules that put graphs in a normal form the specialization passes can
// pattern match: constant subexpressions are evaluated, chains of
// DimShuffles collapse into one, a transposed matrix product is rewritten
// as the product of the transposes, and nested sums and products become a
// single variadic node.

use crate::core::error::Result;
use crate::ir::fgraph::{Client, FunctionGraph};
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{op_as, OpRef};
use crate::ir::value::TensorValue;
use crate::ops::blas::{self, Dot};
use crate::ops::dimshuffle::{self, DimShuffle};
use crate::ops::elemwise::{self, Elemwise};
use crate::ops::scalar::ScalarOp;
use crate::optimizer::cse::MergeOptimizer;
use crate::optimizer::local::{EquilibriumRewriter, LocalRewriter};
use std::sync::Arc;

/// Evaluate nodes whose inputs are all constants
#[derive(Debug, Default)]
pub struct ConstantFolding;

impl LocalRewriter for ConstantFolding {
    fn name(&self) -> &str {
        "constant_folding"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let graph = fgraph.graph();
        let apply = graph.node(node);
        if apply.inputs.is_empty() || !apply.op.destroy_map().is_empty() {
            return Ok(None);
        }
        let mut values: Vec<&TensorValue> = Vec::with_capacity(apply.inputs.len());
        for input in &apply.inputs {
            match graph.constant_value(*input) {
                Some(v) => values.push(v),
                None => return Ok(None),
            }
        }
        let mut outputs: Vec<Option<TensorValue>> = vec![None; apply.outputs.len()];
        if let Err(err) = apply.op.perform(&values, &mut outputs) {
            // left for run time, where the failure is reported against the node
            log::debug!("constant_folding: {} ({}) not folded: {}", node, apply.op.name(), err);
            return Ok(None);
        }
        let Some(folded) = outputs.into_iter().collect::<Option<Vec<TensorValue>>>() else {
            return Ok(None);
        };
        let graph = fgraph.graph_mut();
        Ok(Some(folded.into_iter().map(|v| graph.constant(v)).collect()))
    }
}

/// Collapse DimShuffle chains and drop identity shuffles
#[derive(Debug, Default)]
pub struct DimShuffleCanonicalize;

impl LocalRewriter for DimShuffleCanonicalize {
    fn name(&self) -> &str {
        "dimshuffle_canonicalize"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let apply = fgraph.graph().node(node);
        let Some(outer) = op_as::<DimShuffle>(&apply.op) else {
            return Ok(None);
        };
        let input = apply.inputs[0];
        if outer.is_identity() {
            return Ok(Some(vec![input]));
        }
        let Some(producer) = fgraph.graph().owner(input) else {
            return Ok(None);
        };
        let inner_apply = fgraph.graph().node(producer);
        let Some(inner) = op_as::<DimShuffle>(&inner_apply.op) else {
            return Ok(None);
        };
        let source = inner_apply.inputs[0];
        let composed = inner.compose(outer)?;
        if composed.is_identity() {
            return Ok(Some(vec![source]));
        }
        let op: OpRef = Arc::new(composed);
        Ok(Some(vec![fgraph.graph_mut().apply1(op, &[source])?]))
    }
}

/// `dot(x, y).T` becomes `dot(y.T, x.T)`
#[derive(Debug, Default)]
pub struct TransposeThroughDot;

impl LocalRewriter for TransposeThroughDot {
    fn name(&self) -> &str {
        "transpose_through_dot"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let graph = fgraph.graph();
        let apply = graph.node(node);
        match op_as::<DimShuffle>(&apply.op) {
            Some(ds) if ds.is_transpose() => {}
            _ => return Ok(None),
        }
        let product = apply.inputs[0];
        let Some(producer) = graph.owner(product) else {
            return Ok(None);
        };
        let dot_apply = graph.node(producer);
        if op_as::<Dot>(&dot_apply.op).is_none() || fgraph.clients(product).len() != 1 {
            return Ok(None);
        }
        let (x, y) = (dot_apply.inputs[0], dot_apply.inputs[1]);
        if graph.ty(x).ndim() != 2 || graph.ty(y).ndim() != 2 {
            return Ok(None);
        }
        let graph = fgraph.graph_mut();
        let yt = dimshuffle::transpose(graph, y)?;
        let xt = dimshuffle::transpose(graph, x)?;
        Ok(Some(vec![blas::dot(graph, yt, xt)?]))
    }
}

/// `add(add(a, b), c)` becomes `add(a, b, c)`, and likewise for `mul`
#[derive(Debug, Default)]
pub struct FlattenAssociative;

impl LocalRewriter for FlattenAssociative {
    fn name(&self) -> &str {
        "flatten_associative"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let graph = fgraph.graph();
        let apply = graph.node(node);
        let op = match op_as::<Elemwise>(&apply.op) {
            Some(e) if e.inplace_input().is_none() => match e.scalar_op() {
                Some(op @ (ScalarOp::Add | ScalarOp::Mul)) => op,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        let out_ty = graph.ty(apply.outputs[0]).clone();
        let mut flattened = Vec::with_capacity(apply.inputs.len() + 2);
        let mut changed = false;
        for (slot, &input) in apply.inputs.iter().enumerate() {
            let nested = graph.owner(input).and_then(|producer| {
                let inner = graph.node(producer);
                let same_op = op_as::<Elemwise>(&inner.op)
                    .map(|e| e.inplace_input().is_none() && e.scalar_op() == Some(op))
                    .unwrap_or(false);
                let only_here = fgraph.clients(input) == [Client::Node(node, slot)];
                (same_op && only_here && graph.ty(input).dtype == out_ty.dtype)
                    .then(|| inner.inputs.clone())
            });
            match nested {
                Some(inner_inputs) => {
                    flattened.extend(inner_inputs);
                    changed = true;
                }
                None => flattened.push(input),
            }
        }
        if !changed {
            return Ok(None);
        }
        let graph = fgraph.graph_mut();
        let out = elemwise::elemwise(graph, op, &flattened)?;
        if *graph.ty(out) != out_ty {
            return Ok(None);
        }
        Ok(Some(vec![out]))
    }
}

/// The canonicalize group: merge plus every local rule above, to a fixpoint
pub fn canonicalize(max_iterations: usize) -> EquilibriumRewriter {
    EquilibriumRewriter::new("canonicalize", max_iterations)
        .with_global(Box::new(MergeOptimizer::new()))
        .with_local(Arc::new(ConstantFolding))
        .with_local(Arc::new(DimShuffleCanonicalize))
        .with_local(Arc::new(TransposeThroughDot))
        .with_local(Arc::new(FlattenAssociative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::Graph;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::basic;
    use crate::optimizer::pass::OptimizationPass;

    const F64: ScalarType = ScalarType::Float64;

    fn op_names(fg: &FunctionGraph) -> Vec<String> {
        let order = fg.toposort().unwrap();
        order.iter().map(|n| fg.graph().op(*n).name()).collect()
    }

    #[test]
    fn test_constants_fold() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let two = g.scalar_constant(F64, 2.0);
        let three = g.scalar_constant(F64, 3.0);
        let six = elemwise::mul(&mut g, &[two, three]).unwrap();
        let out = elemwise::add(&mut g, &[x, six]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();

        canonicalize(16).apply(&mut fg).unwrap();
        let names = op_names(&fg);
        assert!(names.iter().all(|n| !n.contains("mul")), "{:?}", names);
        let add = fg.graph().owner(fg.outputs()[0]).unwrap();
        let folded = fg
            .graph()
            .node(add)
            .inputs
            .iter()
            .find_map(|v| fg.graph().constant_value(*v).cloned())
            .unwrap();
        assert_eq!(folded.data(), &[6.0]);
    }

    #[test]
    fn test_failing_assert_is_not_folded() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let zero = g.scalar_constant(F64, 0.0);
        let checked = basic::assert_op(&mut g, zero, &[zero], "never").unwrap();
        let out = elemwise::add(&mut g, &[x, checked]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();
        canonicalize(16).apply(&mut fg).unwrap();
        assert!(op_names(&fg).iter().any(|n| n.starts_with("Assert")));
    }

    #[test]
    fn test_double_transpose_disappears() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let t = dimshuffle::transpose(&mut g, x).unwrap();
        let tt = dimshuffle::transpose(&mut g, t).unwrap();
        let out = elemwise::exp(&mut g, tt).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();
        canonicalize(16).apply(&mut fg).unwrap();
        assert_eq!(op_names(&fg), vec!["Elemwise{exp}".to_string()]);
        let exp = fg.graph().owner(fg.outputs()[0]).unwrap();
        assert_eq!(fg.graph().node(exp).inputs, vec![x]);
    }

    #[test]
    fn test_transpose_moves_into_dot() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let y = g.input("y", TensorType::matrix(F64));
        let xy = blas::dot(&mut g, x, y).unwrap();
        let out = dimshuffle::transpose(&mut g, xy).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, y], vec![out]).unwrap();
        canonicalize(16).apply(&mut fg).unwrap();
        let root = fg.graph().owner(fg.outputs()[0]).unwrap();
        assert_eq!(fg.graph().op(root).name(), "dot");
        fg.check_integrity().unwrap();
    }

    #[test]
    fn test_nested_adds_flatten() {
        let mut g = Graph::new();
        let a = g.input("a", TensorType::vector(F64));
        let b = g.input("b", TensorType::vector(F64));
        let c = g.input("c", TensorType::vector(F64));
        let ab = elemwise::add(&mut g, &[a, b]).unwrap();
        let abc = elemwise::add(&mut g, &[ab, c]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![a, b, c], vec![abc]).unwrap();
        canonicalize(16).apply(&mut fg).unwrap();
        let root = fg.graph().owner(fg.outputs()[0]).unwrap();
        assert_eq!(fg.graph().node(root).inputs, vec![a, b, c]);
        assert_eq!(fg.num_nodes(), 1);
    }

    #[test]
    fn test_shared_inner_add_is_kept() {
        let mut g = Graph::new();
        let a = g.input("a", TensorType::vector(F64));
        let b = g.input("b", TensorType::vector(F64));
        let ab = elemwise::add(&mut g, &[a, b]).unwrap();
        let twice = elemwise::add(&mut g, &[ab, a]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![a, b], vec![twice, ab]).unwrap();
        canonicalize(16).apply(&mut fg).unwrap();
        assert_eq!(fg.num_nodes(), 2);
    }
}
