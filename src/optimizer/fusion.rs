// Elementwise Fusion
//
// A chain of elementwise nodes becomes one `Composite` kernel, so the
// intermediate arrays are never materialized. A producer is folded into its
// consumer only when the consumer is its sole client. Elementwise maps
// commute with broadcasting, so the producer's inputs can be broadcast
// straight to the consumer's output shape.

use crate::core::error::Result;
use crate::ir::fgraph::{Client, FunctionGraph};
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{op_as, OpRef};
use crate::ir::types::ScalarType;
use crate::ops::elemwise::Elemwise;
use crate::optimizer::local::{EquilibriumRewriter, LocalRewriter};
use std::sync::Arc;

/// Upper bound on the inputs of a fused kernel
pub const MAX_FUSED_INPUTS: usize = 32;

/// Fold one elementwise producer into an elementwise consumer
#[derive(Debug)]
pub struct ElemwiseFusion {
    max_inputs: usize,
}

impl Default for ElemwiseFusion {
    fn default() -> Self {
        ElemwiseFusion {
            max_inputs: MAX_FUSED_INPUTS,
        }
    }
}

impl ElemwiseFusion {
    pub fn new(max_inputs: usize) -> Self {
        ElemwiseFusion { max_inputs }
    }

    /// Input slot of `node` whose producer can be folded in
    fn fusable_input(&self, fgraph: &FunctionGraph, node: NodeId) -> Option<(usize, NodeId)> {
        let graph = fgraph.graph();
        let inputs = &graph.node(node).inputs;
        inputs.iter().enumerate().find_map(|(slot, &input)| {
            let producer = graph.owner(input)?;
            let apply = graph.node(producer);
            let e = op_as::<Elemwise>(&apply.op)?;
            let fusable = e.inplace_input().is_none()
                && apply.outputs.len() == 1
                && fgraph.clients(input) == [Client::Node(node, slot)]
                && inputs.len() - 1 + apply.inputs.len() <= self.max_inputs;
            fusable.then_some((slot, producer))
        })
    }
}

fn dtypes(fgraph: &FunctionGraph, vars: &[VarId]) -> Vec<ScalarType> {
    vars.iter().map(|v| fgraph.graph().ty(*v).dtype).collect()
}

impl LocalRewriter for ElemwiseFusion {
    fn name(&self) -> &str {
        "elemwise_fusion"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        let consumer = match op_as::<Elemwise>(fgraph.graph().op(node)) {
            Some(e) if e.inplace_input().is_none() => e.clone(),
            _ => return Ok(None),
        };
        let Some((slot, producer_node)) = self.fusable_input(fgraph, node) else {
            return Ok(None);
        };
        let Some(producer) = op_as::<Elemwise>(fgraph.graph().op(producer_node)).cloned() else {
            return Ok(None);
        };
        let consumer_inputs = fgraph.graph().node(node).inputs.clone();
        let producer_inputs = fgraph.graph().node(producer_node).inputs.clone();
        let old_ty = fgraph.graph().ty(fgraph.graph().node(node).outputs[0]).clone();

        let outer = consumer.program(&dtypes(fgraph, &consumer_inputs))?;
        let inner = producer.program(&dtypes(fgraph, &producer_inputs))?;
        let mut program = outer.inline_input(slot, &inner);
        let mut inputs: Vec<VarId> = consumer_inputs
            .iter()
            .enumerate()
            .filter(|(k, _)| *k != slot)
            .map(|(_, v)| *v)
            .collect();
        inputs.extend(producer_inputs);

        // one kernel argument per distinct variable
        let mut b = 1;
        while b < inputs.len() {
            match inputs[..b].iter().position(|v| *v == inputs[b]) {
                Some(a) => {
                    program = program.merge_inputs(a, b);
                    inputs.remove(b);
                }
                None => b += 1,
            }
        }

        let op: OpRef = Arc::new(Elemwise::composite(program)?);
        let graph = fgraph.graph_mut();
        let out = graph.apply1(op, &inputs)?;
        if *graph.ty(out) != old_ty {
            return Ok(None);
        }
        log::trace!("elemwise_fusion: {} folded into {}", producer_node, node);
        Ok(Some(vec![out]))
    }
}

/// Fusion group: fold producers until no chain is left
pub fn fusion(max_iterations: usize) -> EquilibriumRewriter {
    EquilibriumRewriter::new("fusion", max_iterations).with_local(Arc::new(ElemwiseFusion::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::Graph;
    use crate::ir::types::TensorType;
    use crate::ir::value::TensorValue;
    use crate::ops::elemwise;
    use crate::optimizer::pass::OptimizationPass;

    const F64: ScalarType = ScalarType::Float64;

    #[test]
    fn test_chain_becomes_one_kernel() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let y = g.input("y", TensorType::vector(F64));
        let s = elemwise::add(&mut g, &[x, y]).unwrap();
        let e = elemwise::exp(&mut g, s).unwrap();
        let out = elemwise::mul(&mut g, &[e, x]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x, y], vec![out]).unwrap();

        assert!(fusion(16).apply(&mut fg).unwrap());
        assert_eq!(fg.num_nodes(), 1);
        let root = fg.graph().owner(fg.outputs()[0]).unwrap();
        let apply = fg.graph().node(root);
        // x is read twice but passed once
        assert_eq!(apply.inputs.len(), 2);

        let xv = TensorValue::vector(F64, vec![0.0, 1.0]);
        let yv = TensorValue::vector(F64, vec![1.0, -1.0]);
        let by_input = |v: VarId| if v == x { &xv } else { &yv };
        let args: Vec<&TensorValue> = apply.inputs.iter().map(|v| by_input(*v)).collect();
        let mut result = vec![None];
        apply.op.perform(&args, &mut result).unwrap();
        let result = result[0].take().unwrap();
        assert_eq!(result.data(), &[1.0f64.exp() * 0.0, 0.0f64.exp() * 1.0]);
    }

    #[test]
    fn test_shared_intermediate_is_not_fused() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let e = elemwise::exp(&mut g, x).unwrap();
        let out = elemwise::neg(&mut g, e).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x], vec![out, e]).unwrap();
        assert!(!fusion(16).apply(&mut fg).unwrap());
        assert_eq!(fg.num_nodes(), 2);
    }
}
