// In-place Assignment
//
// Swaps ops for variants that overwrite one of their inputs. Every swap goes
// through a transactional replacement checked by the destroy handler, so a
// candidate that would clobber a protected input, a constant or a buffer
// still read elsewhere is rolled back and the op keeps its fresh output.

use crate::core::error::{GraphError, Result};
use crate::ir::destroy::DestroyHandler;
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{op_as, OpRef};
use crate::ir::traversal::io_toposort;
use crate::ops::blas::Gemm;
use crate::ops::elemwise::Elemwise;
use crate::optimizer::local::{apply_local, LocalRewriter};
use crate::optimizer::pass::OptimizationPass;
use std::sync::Arc;

/// Attach a destroy handler protecting every input, unless one is present
pub fn ensure_destroy_handler(fgraph: &mut FunctionGraph) -> Result<()> {
    if !fgraph.has_feature("DestroyHandler") {
        fgraph.attach_feature(Box::new(DestroyHandler::new(Vec::<VarId>::new())))?;
    }
    Ok(())
}

/// `Gemm{no_inplace}` becomes `Gemm{inplace}`
#[derive(Debug, Default)]
pub struct GemmInplace;

impl LocalRewriter for GemmInplace {
    fn name(&self) -> &str {
        "gemm_inplace"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> Result<Option<Vec<VarId>>> {
        match op_as::<Gemm>(fgraph.graph().op(node)) {
            Some(gemm) if !gemm.is_inplace() => {}
            _ => return Ok(None),
        }
        let inputs = fgraph.graph().node(node).inputs.clone();
        let op: OpRef = Arc::new(Gemm::new(true));
        match fgraph.graph_mut().apply1(op, &inputs) {
            Ok(out) => Ok(Some(vec![out])),
            // z aliases x or y
            Err(GraphError::Inconsistency(msg)) => {
                log::debug!("gemm_inplace: {} stays out of place: {}", node, msg);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Runs `GemmInplace` over the graph with a destroy handler attached
#[derive(Debug, Default)]
pub struct GemmInplacePass;

impl OptimizationPass for GemmInplacePass {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        ensure_destroy_handler(fgraph)?;
        let mut changed = false;
        for node in io_toposort(fgraph.graph(), fgraph.inputs(), fgraph.outputs()) {
            changed |= apply_local(&GemmInplace, fgraph, node)?;
        }
        Ok(changed)
    }

    fn name(&self) -> &str {
        "gemm_inplace"
    }
}

/// Make elementwise nodes overwrite the first input that can hold their output
#[derive(Debug, Default)]
pub struct ElemwiseInplace;

impl ElemwiseInplace {
    fn candidates(fgraph: &FunctionGraph, node: NodeId) -> Vec<usize> {
        let graph = fgraph.graph();
        let apply = graph.node(node);
        let out_ty = graph.ty(apply.outputs[0]);
        apply
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, v)| !graph.is_constant(**v) && graph.ty(**v) == out_ty)
            .map(|(i, _)| i)
            .collect()
    }
}

impl OptimizationPass for ElemwiseInplace {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        ensure_destroy_handler(fgraph)?;
        let mut changed = false;
        for node in io_toposort(fgraph.graph(), fgraph.inputs(), fgraph.outputs()) {
            if !fgraph.contains_node(node) {
                continue;
            }
            let elemwise = match op_as::<Elemwise>(fgraph.graph().op(node)) {
                Some(e) if e.inplace_input().is_none() => e.clone(),
                _ => continue,
            };
            let inputs = fgraph.graph().node(node).inputs.clone();
            let old = fgraph.graph().node(node).outputs[0];
            for candidate in Self::candidates(fgraph, node) {
                let op: OpRef = Arc::new(elemwise.with_inplace(candidate));
                let new = fgraph.graph_mut().apply1(op, &inputs)?;
                match fgraph.replace_validate(&[(old, new)], "elemwise_inplace") {
                    Ok(()) => {
                        log::trace!("elemwise_inplace: {} overwrites input {}", node, candidate);
                        changed = true;
                        break;
                    }
                    Err(err) if err.is_inconsistency() => {
                        log::warn!(
                            "elemwise_inplace: input {} of {} rejected: {}",
                            candidate,
                            node,
                            err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(changed)
    }

    fn name(&self) -> &str {
        "elemwise_inplace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::Graph;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::{blas, elemwise};

    const F64: ScalarType = ScalarType::Float64;

    fn op_names(fg: &FunctionGraph) -> Vec<String> {
        let order = fg.toposort().unwrap();
        order.iter().map(|n| fg.graph().op(*n).name()).collect()
    }

    #[test]
    fn test_protected_inputs_are_not_destroyed() {
        let mut g = Graph::new();
        let z = g.input("z", TensorType::matrix(F64));
        let x = g.input("x", TensorType::matrix(F64));
        let one = g.scalar_constant(F64, 1.0);
        let out = blas::gemm_no_inplace(&mut g, z, one, x, x, one).unwrap();
        let mut fg = FunctionGraph::new(g, vec![z, x], vec![out]).unwrap();
        assert!(!GemmInplacePass.apply(&mut fg).unwrap());
        assert_eq!(op_names(&fg), vec!["Gemm{no_inplace}".to_string()]);
    }

    #[test]
    fn test_mutable_input_is_destroyed() {
        let mut g = Graph::new();
        let z = g.input("z", TensorType::matrix(F64));
        let x = g.input("x", TensorType::matrix(F64));
        let one = g.scalar_constant(F64, 1.0);
        let out = blas::gemm_no_inplace(&mut g, z, one, x, x, one).unwrap();
        let mut fg = FunctionGraph::new(g, vec![z, x], vec![out]).unwrap();
        fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap();
        assert!(GemmInplacePass.apply(&mut fg).unwrap());
        assert_eq!(op_names(&fg), vec!["Gemm{inplace}".to_string()]);
    }

    #[test]
    fn test_intermediate_is_overwritten() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let e = elemwise::exp(&mut g, x).unwrap();
        let out = elemwise::add(&mut g, &[e, x]).unwrap();
        let mut fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();
        assert!(ElemwiseInplace.apply(&mut fg).unwrap());
        assert_eq!(
            op_names(&fg),
            vec![
                "Elemwise{exp}".to_string(),
                "Elemwise{add}[inplace:0]".to_string()
            ]
        );
    }
}
