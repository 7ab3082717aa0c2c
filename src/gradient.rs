// Reverse-mode gradient driver
//
// Walks the nodes between `wrt` and the cost in reverse topological order,
// asking each op for the gradient of its inputs. Gradient markers returned
// by an op only fail when the input they belong to lies on a path from a
// `wrt` variable to the cost. Outputs of a node that do not reach the cost
// are handed to the op as zeros.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::Gradient;
use crate::ir::traversal::io_toposort;
use crate::ops::elemwise;
use std::collections::{HashMap, HashSet};

/// Symbolic gradients of a 0-d `cost` with respect to each of `wrt`.
///
/// A `wrt` variable the cost does not depend on gets zeros of its own type.
pub fn grad(graph: &mut Graph, cost: VarId, wrt: &[VarId]) -> Result<Vec<VarId>> {
    let cost_ty = graph.ty(cost).clone();
    if !cost_ty.is_scalar() {
        return Err(GraphError::TypeMismatch(format!(
            "cost must be a scalar, got {}",
            cost_ty
        )));
    }
    if !cost_ty.dtype.is_float() {
        return Err(GraphError::TypeMismatch(format!(
            "cost must be floating point, got {}",
            cost_ty.dtype
        )));
    }

    let order = io_toposort(graph, &[], &[cost]);

    // variables that depend on some wrt; their gradients are demanded
    let mut demanded: HashSet<VarId> = wrt.iter().copied().collect();
    let mut connected: Vec<NodeId> = Vec::new();
    for &node in &order {
        let apply = graph.node(node);
        if apply.inputs.iter().any(|i| demanded.contains(i)) {
            demanded.extend(apply.outputs.iter().copied());
            connected.push(node);
        }
    }

    let mut contributions: HashMap<VarId, Vec<VarId>> = HashMap::new();
    let mut totals: HashMap<VarId, VarId> = HashMap::new();
    let one = graph.scalar_constant(cost_ty.dtype, 1.0);
    contributions.insert(cost, vec![one]);

    for &node in connected.iter().rev() {
        let outputs = graph.node(node).outputs.clone();
        let mut output_grads = Vec::with_capacity(outputs.len());
        for out in &outputs {
            output_grads.push(total(graph, *out, &contributions, &mut totals)?);
        }
        if output_grads.iter().all(Option::is_none) {
            continue;
        }
        // siblings off the cost path contribute nothing
        for (out, g) in outputs.iter().zip(output_grads.iter_mut()) {
            if g.is_none() {
                *g = Some(elemwise::zeros_like(graph, *out)?);
            }
        }
        let op = graph.op(node).clone();
        log::trace!("grad: {} ({})", node, op.name());
        let input_grads = op.grad(graph, node, &output_grads)?;
        let inputs = graph.node(node).inputs.clone();
        if input_grads.len() != inputs.len() {
            return Err(GraphError::InvalidValue(format!(
                "{} returned {} gradients for {} inputs",
                op.name(),
                input_grads.len(),
                inputs.len()
            )));
        }
        for (input, g) in inputs.iter().zip(input_grads) {
            if !demanded.contains(input) {
                continue;
            }
            match g {
                Gradient::Value(v) => contributions.entry(*input).or_default().push(v),
                Gradient::Disconnected => {}
                Gradient::NotImplemented(why) => {
                    return Err(GraphError::GradNotImplemented(format!(
                        "{} (input {} of {})",
                        why,
                        graph.label(*input),
                        op.name()
                    )))
                }
                Gradient::Undefined(why) => {
                    return Err(GraphError::GradUndefined(format!(
                        "{} (input {} of {})",
                        why,
                        graph.label(*input),
                        op.name()
                    )))
                }
            }
        }
    }

    let mut result = Vec::with_capacity(wrt.len());
    for &w in wrt {
        let g = match total(graph, w, &contributions, &mut totals)? {
            Some(g) => g,
            None => elemwise::zeros_like(graph, w)?,
        };
        let dtype = graph.ty(w).dtype;
        result.push(elemwise::cast(graph, g, dtype)?);
    }
    Ok(result)
}

/// Sum of the gradient contributions reaching `var`, built once
fn total(
    graph: &mut Graph,
    var: VarId,
    contributions: &HashMap<VarId, Vec<VarId>>,
    totals: &mut HashMap<VarId, VarId>,
) -> Result<Option<VarId>> {
    if let Some(t) = totals.get(&var) {
        return Ok(Some(*t));
    }
    let t = match contributions.get(&var).map(Vec::as_slice) {
        None | Some([]) => return Ok(None),
        Some([single]) => *single,
        Some(many) => elemwise::add(graph, many)?,
    };
    totals.insert(var, t);
    Ok(Some(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::reduction::sum;

    #[test]
    fn test_cost_must_be_scalar() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        assert!(matches!(grad(&mut g, x, &[x]), Err(GraphError::TypeMismatch(_))));
    }

    #[test]
    fn test_unrelated_wrt_gets_zeros() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        let y = g.input("y", TensorType::vector(ScalarType::Float64));
        let cost = sum(&mut g, x, None).unwrap();
        let grads = grad(&mut g, cost, &[y]).unwrap();
        assert_eq!(g.ty(grads[0]), g.ty(y));
    }
}
