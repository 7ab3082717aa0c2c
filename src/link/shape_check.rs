// Infer-shape checking: compare what a node produced with what its op
// predicted from the input shapes.

use crate::compiler::c_backend::concrete_output_shapes;
use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::value::TensorValue;

/// Fail with `CheckerMismatch` when `outputs` disagree with `infer_shape`
pub fn verify_shapes(
    graph: &Graph,
    node: NodeId,
    inputs: &[&TensorValue],
    outputs: &[TensorValue],
) -> Result<()> {
    let apply = graph.node(node);
    let input_shapes: Vec<&[usize]> = inputs.iter().map(|v| v.shape()).collect();
    let expected = concrete_output_shapes(graph, node, &input_shapes).map_err(|err| {
        GraphError::CheckerMismatch {
            node: node.to_string(),
            variable: apply
                .outputs
                .first()
                .map(|v| graph.label(*v))
                .unwrap_or_default(),
            message: format!("infer_shape failed where perform succeeded: {}", err),
        }
    })?;
    for ((var, value), shape) in apply.outputs.iter().zip(outputs).zip(&expected) {
        if value.shape() != shape.as_slice() {
            return Err(GraphError::CheckerMismatch {
                node: node.to_string(),
                variable: graph.label(*var),
                message: format!(
                    "{} infers shape {:?} but produced {:?}",
                    apply.op.name(),
                    shape,
                    value.shape()
                ),
            });
        }
    }
    log::trace!("node {}: shapes agree with infer_shape", node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::dimshuffle::transpose;

    #[test]
    fn test_transpose_shapes_agree() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(ScalarType::Float64));
        let t = transpose(&mut g, x).unwrap();
        let node = g.owner(t).unwrap();
        let input = TensorValue::zeros(ScalarType::Float64, vec![2, 3]);
        let good = TensorValue::zeros(ScalarType::Float64, vec![3, 2]);
        assert!(verify_shapes(&g, node, &[&input], &[good]).is_ok());

        let bad = TensorValue::zeros(ScalarType::Float64, vec![2, 3]);
        let err = verify_shapes(&g, node, &[&input], &[bad]).unwrap_err();
        assert!(matches!(err, GraphError::CheckerMismatch { .. }));
    }
}
