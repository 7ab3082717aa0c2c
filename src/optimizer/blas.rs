// BLAS Specialization
//
// `Dot` becomes `Dot22` (vectors are lifted to rows or columns first), sums
// of scaled products become `Gemm`, and a scalar times a lone `Dot22`
// becomes `Dot22Scalar`.
//
// The gemm search flattens an elementwise expression into a list of
// (scale, term) pairs, merges pairs that share a term, and then looks for a
// pair `beta * L + alpha * M` where M is computed by a `Dot22`. Nested terms
// are only expanded when the intermediate has no other client, so shared
// subexpressions are never duplicated.

use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::op_as;
use crate::ir::traversal::io_toposort;
use crate::ir::types::ScalarType;
use crate::ops::blas::{self, Dot, Dot22};
use crate::ops::dimshuffle::{self, DimShuffle, ShuffleDim};
use crate::ops::elemwise::{self, Elemwise};
use crate::ops::scalar::ScalarOp;
use crate::optimizer::local::LocalRewriter;
use crate::optimizer::pass::OptimizationPass;

/// `dot` on float operands of one dtype becomes `Dot22`
#[derive(Debug, Default)]
pub struct DotToDot22;

impl LocalRewriter for DotToDot22 {
    fn name(&self) -> &str {
        "dot_to_dot22"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let graph = fgraph.graph();
        let apply = graph.node(node);
        if op_as::<Dot>(&apply.op).is_none() {
            return Ok(None);
        }
        let (x, y) = (apply.inputs[0], apply.inputs[1]);
        let (xt, yt) = (graph.ty(x), graph.ty(y));
        if !xt.dtype.is_float() || xt.dtype != yt.dtype {
            return Ok(None);
        }
        let (xn, yn) = (xt.ndim(), yt.ndim());
        let graph = fgraph.graph_mut();
        let out = match (xn, yn) {
            (2, 2) => blas::dot22(graph, x, y)?,
            (2, 1) => {
                let y_col = dimshuffle::dimshuffle(graph, y, &[ShuffleDim::Axis(0), ShuffleDim::Broadcast])?;
                let product = blas::dot22(graph, x, y_col)?;
                dimshuffle::dimshuffle(graph, product, &[ShuffleDim::Axis(0)])?
            }
            (1, 2) => {
                let x_row = dimshuffle::dimshuffle(graph, x, &[ShuffleDim::Broadcast, ShuffleDim::Axis(0)])?;
                let product = blas::dot22(graph, x_row, y)?;
                dimshuffle::dimshuffle(graph, product, &[ShuffleDim::Axis(1)])?
            }
            (1, 1) => {
                let x_row = dimshuffle::dimshuffle(graph, x, &[ShuffleDim::Broadcast, ShuffleDim::Axis(0)])?;
                let y_col = dimshuffle::dimshuffle(graph, y, &[ShuffleDim::Axis(0), ShuffleDim::Broadcast])?;
                let product = blas::dot22(graph, x_row, y_col)?;
                dimshuffle::dimshuffle(graph, product, &[])?
            }
            _ => return Ok(None),
        };
        Ok(Some(vec![out]))
    }
}

/// Scale of a term: folded while it is a known constant
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scale {
    Const(f64),
    /// 0-d variable
    Var(VarId),
}

impl Scale {
    fn negate(self, graph: &mut Graph) -> Result<Scale> {
        Ok(match self {
            Scale::Const(c) => Scale::Const(-c),
            Scale::Var(v) => Scale::Var(elemwise::neg(graph, v)?),
        })
    }

    /// This scale times the 0-d factor `s`
    fn times(self, graph: &mut Graph, s: Scale) -> Result<Scale> {
        Ok(match (self, s) {
            (Scale::Const(a), Scale::Const(b)) => Scale::Const(a * b),
            (Scale::Const(c), Scale::Var(v)) | (Scale::Var(v), Scale::Const(c)) => {
                let dtype = graph.ty(v).dtype;
                if c == 1.0 {
                    Scale::Var(v)
                } else if c == -1.0 && dtype != ScalarType::Bool {
                    Scale::Var(elemwise::neg(graph, v)?)
                } else {
                    let k = graph.scalar_constant(literal_dtype(dtype), c);
                    Scale::Var(elemwise::mul(graph, &[k, v])?)
                }
            }
            (Scale::Var(a), Scale::Var(b)) => Scale::Var(elemwise::mul(graph, &[a, b])?),
        })
    }

    fn plus(self, graph: &mut Graph, other: Scale) -> Result<Scale> {
        Ok(match (self, other) {
            (Scale::Const(a), Scale::Const(b)) => Scale::Const(a + b),
            (Scale::Const(c), Scale::Var(v)) | (Scale::Var(v), Scale::Const(c)) => {
                let dtype = graph.ty(v).dtype;
                let k = graph.scalar_constant(literal_dtype(dtype), c);
                Scale::Var(elemwise::add(graph, &[v, k])?)
            }
            (Scale::Var(a), Scale::Var(b)) => Scale::Var(elemwise::add(graph, &[a, b])?),
        })
    }

    /// 0-d variable of `dtype` holding this scale
    fn to_var(self, graph: &mut Graph, dtype: ScalarType) -> Result<VarId> {
        match self {
            Scale::Const(c) => Ok(graph.scalar_constant(dtype, c)),
            Scale::Var(v) => elemwise::cast(graph, v, dtype),
        }
    }
}

/// Dtype for a literal combined with a variable of `dtype`
fn literal_dtype(dtype: ScalarType) -> ScalarType {
    if dtype.is_float() {
        dtype
    } else {
        ScalarType::Float64
    }
}

fn elemwise_scalar_op(graph: &Graph, node: NodeId) -> Option<ScalarOp> {
    op_as::<Elemwise>(graph.op(node))
        .filter(|e| e.inplace_input().is_none())
        .and_then(|e| e.scalar_op())
}

/// The 0-d scale carried by an all-broadcastable factor
fn as_scale(graph: &mut Graph, var: VarId) -> Result<Scale> {
    let mut v = var;
    while let Some(owner) = graph.owner(v) {
        if op_as::<DimShuffle>(graph.op(owner)).is_none() {
            break;
        }
        v = graph.node(owner).inputs[0];
    }
    if let Some(value) = graph.constant_value(v) {
        if let Ok(c) = value.as_scalar() {
            return Ok(Scale::Const(c));
        }
    }
    Ok(Scale::Var(dimshuffle::to_scalar(graph, v)?))
}

/// Flatten `r` into (scale, term) pairs.
///
/// Intermediates with more than `max_clients` clients are kept whole; the
/// root is called with zero, meaning no limit.
fn gemm_canonicalize(
    fgraph: &mut FunctionGraph,
    r: VarId,
    scale: Scale,
    terms: &mut Vec<(Scale, VarId)>,
    max_clients: usize,
) -> Result<()> {
    let ty = fgraph.graph().ty(r).clone();
    if !(ty.ndim() == 1 || ty.ndim() == 2) {
        terms.push((scale, r));
        return Ok(());
    }
    if max_clients > 0 && fgraph.clients(r).len() > max_clients {
        terms.push((scale, r));
        return Ok(());
    }
    let Some(owner) = fgraph.graph().owner(r) else {
        terms.push((scale, r));
        return Ok(());
    };
    let inputs = fgraph.graph().node(owner).inputs.clone();
    match elemwise_scalar_op(fgraph.graph(), owner) {
        Some(ScalarOp::Sub) => {
            gemm_canonicalize(fgraph, inputs[0], scale, terms, 1)?;
            let negated = scale.negate(fgraph.graph_mut())?;
            gemm_canonicalize(fgraph, inputs[1], negated, terms, 1)?;
        }
        Some(ScalarOp::Add) => {
            for input in inputs {
                gemm_canonicalize(fgraph, input, scale, terms, 1)?;
            }
        }
        Some(ScalarOp::Neg) => {
            let negated = scale.negate(fgraph.graph_mut())?;
            gemm_canonicalize(fgraph, inputs[0], negated, terms, 1)?;
        }
        Some(ScalarOp::Mul) => {
            let mut scalars = Vec::new();
            let mut vectors = Vec::new();
            let mut matrices = Vec::new();
            for input in inputs {
                let ity = fgraph.graph().ty(input).clone();
                if ity.all_broadcastable() {
                    scalars.push(as_scale(fgraph.graph_mut(), input)?);
                } else if ity.is_real_vector() {
                    vectors.push(input);
                } else if ity.is_real_matrix() {
                    matrices.push(input);
                } else {
                    terms.push((scale, r));
                    return Ok(());
                }
            }
            let term = match (matrices.as_slice(), vectors.as_slice()) {
                ([m], []) => *m,
                ([], [v]) => *v,
                _ => {
                    terms.push((scale, r));
                    return Ok(());
                }
            };
            let mut combined = scale;
            for s in scalars {
                combined = combined.times(fgraph.graph_mut(), s)?;
            }
            gemm_canonicalize(fgraph, term, combined, terms, 1)?;
        }
        _ => terms.push((scale, r)),
    }
    Ok(())
}

/// Merge pairs that share a term, adding their scales
fn factor_canonicalized(graph: &mut Graph, terms: Vec<(Scale, VarId)>) -> Result<Vec<(Scale, VarId)>> {
    let mut out: Vec<(Scale, VarId)> = Vec::with_capacity(terms.len());
    for (scale, term) in terms {
        match out.iter().position(|(_, t)| *t == term) {
            Some(k) => out[k].0 = out[k].0.plus(graph, scale)?,
            None => out.push((scale, term)),
        }
    }
    Ok(out)
}

/// `scale * term` as a variable
fn item_to_var(graph: &mut Graph, scale: Scale, term: VarId) -> Result<VarId> {
    let dtype = graph.ty(term).dtype;
    match scale {
        Scale::Const(c) if c == 1.0 => Ok(term),
        Scale::Const(c) if c == -1.0 => elemwise::neg(graph, term),
        other => {
            let s = other.to_var(graph, dtype)?;
            elemwise::mul(graph, &[s, term])
        }
    }
}

/// Build `beta * l + alpha * m` as a gemm when m comes from a `Dot22`.
///
/// Returns the replacement and the `Dot22` node it makes redundant.
fn beta_l_plus_alpha_m(
    graph: &mut Graph,
    beta: Scale,
    l: VarId,
    alpha: Scale,
    m: VarId,
    flip: bool,
) -> Result<Option<(VarId, NodeId)>> {
    let dtype = graph.ty(m).dtype;
    if let Some(owner) = graph.owner(m) {
        if op_as::<Dot22>(graph.op(owner)).is_some() {
            let (ml, mr) = (graph.node(owner).inputs[0], graph.node(owner).inputs[1]);
            let a = alpha.to_var(graph, dtype)?;
            let b = beta.to_var(graph, dtype)?;
            return Ok(Some((blas::gemm_no_inplace(graph, l, a, ml, mr, b)?, owner)));
        }
        // a DimShuffle between the sum and the product, as left by dot_to_dot22
        if let Some(order) = op_as::<DimShuffle>(graph.op(owner)).map(|ds| ds.new_order().to_vec()) {
            let mm = graph.node(owner).inputs[0];
            let dot_node = graph
                .owner(mm)
                .filter(|n| op_as::<Dot22>(graph.op(*n)).is_some());
            if let Some(dot_node) = dot_node {
                let (mml, mmr) = (graph.node(dot_node).inputs[0], graph.node(dot_node).inputs[1]);
                let rewritten = match order.as_slice() {
                    [ShuffleDim::Axis(0)] => {
                        let a = alpha.to_var(graph, dtype)?;
                        let b = beta.to_var(graph, dtype)?;
                        let l_col = dimshuffle::dimshuffle(graph, l, &[ShuffleDim::Axis(0), ShuffleDim::Broadcast])?;
                        let g = blas::gemm_no_inplace(graph, l_col, a, mml, mmr, b)?;
                        Some(dimshuffle::dimshuffle(graph, g, &[ShuffleDim::Axis(0)])?)
                    }
                    [ShuffleDim::Axis(1)] => {
                        let a = alpha.to_var(graph, dtype)?;
                        let b = beta.to_var(graph, dtype)?;
                        let l_row = dimshuffle::dimshuffle(graph, l, &[ShuffleDim::Broadcast, ShuffleDim::Axis(0)])?;
                        let g = blas::gemm_no_inplace(graph, l_row, a, mml, mmr, b)?;
                        Some(dimshuffle::dimshuffle(graph, g, &[ShuffleDim::Axis(1)])?)
                    }
                    [ShuffleDim::Axis(1), ShuffleDim::Axis(0)] => {
                        let a = alpha.to_var(graph, dtype)?;
                        let b = beta.to_var(graph, dtype)?;
                        let rt = dimshuffle::transpose(graph, mmr)?;
                        let lt = dimshuffle::transpose(graph, mml)?;
                        Some(blas::gemm_no_inplace(graph, l, a, rt, lt, b)?)
                    }
                    _ => None,
                };
                if let Some(out) = rewritten {
                    return Ok(Some((out, dot_node)));
                }
            }
        }
    }
    if flip {
        return beta_l_plus_alpha_m(graph, alpha, m, beta, l, false);
    }
    Ok(None)
}

/// First gemm found among the factored terms, with the rest added back
fn gemm_from_factored_list(
    graph: &mut Graph,
    terms: &[(Scale, VarId)],
) -> Result<Option<(VarId, NodeId)>> {
    // a scale that would upcast its term changes the result type
    for (scale, term) in terms {
        if let Scale::Var(v) = scale {
            let target = graph.ty(*term).dtype;
            if ScalarType::upcast(graph.ty(*v).dtype, target) != target {
                return Ok(None);
            }
        }
    }
    for i in 0..terms.len().saturating_sub(1) {
        for j in i + 1..terms.len() {
            let (s_i, m_i) = terms[i];
            let (s_j, m_j) = terms[j];
            if !graph.ty(m_j).in_same_class(graph.ty(m_i)) {
                continue;
            }
            let Some((fused, old_dot)) = beta_l_plus_alpha_m(graph, s_i, m_i, s_j, m_j, true)? else {
                continue;
            };
            let mut add_inputs = Vec::with_capacity(terms.len() - 1);
            for (k, (s, m)) in terms.iter().enumerate() {
                if k != i && k != j {
                    add_inputs.push(item_to_var(graph, *s, *m)?);
                }
            }
            let out = if add_inputs.is_empty() {
                fused
            } else {
                add_inputs.push(fused);
                elemwise::add(graph, &add_inputs)?
            };
            return Ok(Some((out, old_dot)));
        }
    }
    Ok(None)
}

fn gemm_from_node(fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<(VarId, NodeId)>> {
    let out = fgraph.graph().node(node).outputs[0];
    let out_ty = fgraph.graph().ty(out).clone();
    if !out_ty.dtype.is_float() || !(out_ty.ndim() == 1 || out_ty.ndim() == 2) {
        return Ok(None);
    }
    let mut terms = Vec::new();
    gemm_canonicalize(fgraph, out, Scale::Const(1.0), &mut terms, 0)?;
    if terms.len() < 2 {
        return Ok(None);
    }
    let graph = fgraph.graph_mut();
    let terms = factor_canonicalized(graph, terms)?;
    match gemm_from_factored_list(graph, &terms)? {
        // a scale may still have widened the sum; such candidates are skipped
        Some((new, old_dot)) if *graph.ty(new) == out_ty => Ok(Some((new, old_dot))),
        _ => Ok(None),
    }
}

/// Fuses sums of scaled `Dot22` products into `Gemm`
#[derive(Debug, Default)]
pub struct GemmOptimizer;

impl GemmOptimizer {
    pub fn new() -> Self {
        GemmOptimizer
    }
}

impl OptimizationPass for GemmOptimizer {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let mut any = false;
        loop {
            let mut did_something = false;
            let mut order = io_toposort(fgraph.graph(), fgraph.inputs(), fgraph.outputs());
            order.reverse();
            for node in order {
                if !fgraph.contains_node(node) {
                    continue;
                }
                match elemwise_scalar_op(fgraph.graph(), node) {
                    Some(ScalarOp::Add | ScalarOp::Sub | ScalarOp::Neg | ScalarOp::Mul) => {}
                    _ => continue,
                }
                let (new, old_dot) = match gemm_from_node(fgraph, node) {
                    Ok(Some(found)) => found,
                    Ok(None) => continue,
                    Err(err @ (GraphError::Inconsistency(_) | GraphError::TypeMismatch(_))) => {
                        log::debug!("gemm: candidate {} skipped: {}", node, err);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let old = fgraph.graph().node(node).outputs[0];
                match fgraph.replace_validate_remove(&[(old, new)], &[old_dot], "gemm") {
                    Ok(true) => {
                        log::trace!("gemm: fused {} into {}", old_dot, node);
                        did_something = true;
                    }
                    Ok(false) => log::debug!("gemm: {} is still used elsewhere", old_dot),
                    Err(err) if err.is_inconsistency() => {
                        log::debug!("gemm: replacement of {} rejected: {}", node, err)
                    }
                    Err(err) => return Err(err),
                }
            }
            if !did_something {
                break;
            }
            any = true;
        }
        Ok(any)
    }

    fn name(&self) -> &str {
        "gemm"
    }
}

/// `mul(scalar, dot22(x, y))` becomes `Dot22Scalar(x, y, scalar)`
#[derive(Debug, Default)]
pub struct Dot22ToDot22Scalar;

impl LocalRewriter for Dot22ToDot22Scalar {
    fn name(&self) -> &str {
        "dot22_to_dot22scalar"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        if elemwise_scalar_op(fgraph.graph(), node) != Some(ScalarOp::Mul) {
            return Ok(None);
        }
        let apply = fgraph.graph().node(node);
        let [a, b] = apply.inputs.as_slice() else {
            return Ok(None);
        };
        let out_ty = fgraph.graph().ty(apply.outputs[0]).clone();
        let is_dot22 = |v: VarId| {
            fgraph
                .graph()
                .owner(v)
                .filter(|n| op_as::<Dot22>(fgraph.graph().op(*n)).is_some())
        };
        let (scalar, dot_node) = match (is_dot22(*a), is_dot22(*b)) {
            (Some(n), _) if fgraph.graph().ty(*b).all_broadcastable() => (*b, n),
            (_, Some(n)) if fgraph.graph().ty(*a).all_broadcastable() => (*a, n),
            _ => return Ok(None),
        };
        let product = fgraph.graph().node(dot_node).outputs[0];
        if fgraph.clients(product).len() != 1 || fgraph.graph().ty(product).dtype != out_ty.dtype {
            return Ok(None);
        }
        let (x, y) = (fgraph.graph().node(dot_node).inputs[0], fgraph.graph().node(dot_node).inputs[1]);
        let graph = fgraph.graph_mut();
        let scale = as_scale(graph, scalar)?.to_var(graph, out_ty.dtype)?;
        let out = blas::dot22scalar(graph, x, y, scale)?;
        if *graph.ty(out) != out_ty {
            return Ok(None);
        }
        Ok(Some(vec![out]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::TensorType;
    use crate::optimizer::local::TopoRewriter;
    use std::sync::Arc;

    const F64: ScalarType = ScalarType::Float64;

    fn op_names(fg: &FunctionGraph) -> Vec<String> {
        let order = fg.toposort().unwrap();
        order.iter().map(|n| fg.graph().op(*n).name()).collect()
    }

    fn specialize(fg: &mut FunctionGraph) {
        TopoRewriter::new("dot_to_dot22", vec![Arc::new(DotToDot22)])
            .apply(fg)
            .unwrap();
        GemmOptimizer::new().apply(fg).unwrap();
    }

    #[test]
    fn test_dot_matrix_vector_lifts_to_dot22() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let v = g.input("v", TensorType::vector(F64));
        let xv = blas::dot(&mut g, x, v).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, v], vec![xv]).unwrap();
        let changed = TopoRewriter::new("dot_to_dot22", vec![Arc::new(DotToDot22)])
            .apply(&mut fg)
            .unwrap();
        assert!(changed);
        let names = op_names(&fg);
        assert!(names.contains(&"Dot22".to_string()), "{:?}", names);
        assert!(!names.contains(&"dot".to_string()));
        assert_eq!(fg.graph().ty(fg.outputs()[0]), &TensorType::vector(F64));
    }

    #[test]
    fn test_sum_of_product_and_matrix_fuses() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let y = g.input("y", TensorType::matrix(F64));
        let z = g.input("z", TensorType::matrix(F64));
        let a = g.input("a", TensorType::scalar(F64));
        let xy = blas::dot(&mut g, x, y).unwrap();
        let scaled = elemwise::mul(&mut g, &[a, xy]).unwrap();
        let out = elemwise::sub(&mut g, z, scaled).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, y, z, a], vec![out]).unwrap();
        specialize(&mut fg);

        let names = op_names(&fg);
        assert_eq!(names.iter().filter(|n| n.starts_with("Gemm")).count(), 1, "{:?}", names);
        assert!(!names.contains(&"Dot22".to_string()));
        let gemm = fg.graph().owner(fg.outputs()[0]).unwrap();
        assert_eq!(fg.graph().node(gemm).inputs[0], z);
        fg.check_integrity().unwrap();
    }

    #[test]
    fn test_shared_product_is_not_fused() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let y = g.input("y", TensorType::matrix(F64));
        let z = g.input("z", TensorType::matrix(F64));
        let xy = blas::dot(&mut g, x, y).unwrap();
        let out = elemwise::add(&mut g, &[z, xy]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, y, z], vec![out, xy]).unwrap();
        specialize(&mut fg);
        let names = op_names(&fg);
        assert!(names.iter().all(|n| !n.starts_with("Gemm")), "{:?}", names);
    }

    #[test]
    fn test_upcasting_scale_is_skipped() {
        let mut g = Graph::new();
        let f32m = TensorType::matrix(ScalarType::Float32);
        let x = g.input("x", f32m.clone());
        let y = g.input("y", f32m.clone());
        let z = g.input("z", f32m);
        let a = g.input("a", TensorType::scalar(ScalarType::Int32));
        let xy = blas::dot(&mut g, x, y).unwrap();
        let scaled = elemwise::mul(&mut g, &[a, xy]).unwrap();
        let out = elemwise::add(&mut g, &[z, scaled]).unwrap();
        let out_ty = g.ty(out).clone();
        let mut fg = FunctionGraph::new(g, vec![x, y, z, a], vec![out]).unwrap();
        specialize(&mut fg);
        assert!(op_names(&fg).iter().all(|n| !n.starts_with("Gemm")));
        assert_eq!(fg.graph().ty(fg.outputs()[0]), &out_ty);
    }

    #[test]
    fn test_scaled_dot22_becomes_dot22scalar() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let y = g.input("y", TensorType::matrix(F64));
        let a = g.input("a", TensorType::scalar(F64));
        let xy = blas::dot22(&mut g, x, y).unwrap();
        let out = elemwise::mul(&mut g, &[a, xy]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, y, a], vec![out]).unwrap();
        TopoRewriter::new("dot22scalar", vec![Arc::new(Dot22ToDot22Scalar)])
            .apply(&mut fg)
            .unwrap();
        assert_eq!(op_names(&fg), vec!["Dot22Scalar".to_string()]);
    }
}
