// Shape and Check Operations

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{AliasMap, CNode, Gradient, NodeSpec, Op, OpRef};
use crate::ir::shape::{Dim, Shape};
use crate::ir::types::TensorType;
use crate::ir::value::TensorValue;
use std::any::Any;
use std::sync::Arc;

/// Reshape to a fixed target; at most one entry may be -1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshape {
    target: Vec<i64>,
}

impl Reshape {
    pub fn new(target: Vec<i64>) -> Result<Self> {
        if target.iter().filter(|d| **d == -1).count() > 1 {
            return Err(GraphError::InvalidValue(
                "reshape: at most one dimension may be -1".to_string(),
            ));
        }
        if let Some(bad) = target.iter().find(|d| **d < -1) {
            return Err(GraphError::InvalidValue(format!(
                "reshape: invalid dimension {}",
                bad
            )));
        }
        Ok(Reshape { target })
    }

    /// Concrete output shape for an input of `size` elements
    fn resolve(&self, size: usize) -> Result<Vec<usize>> {
        let known: usize = self
            .target
            .iter()
            .filter(|d| **d >= 0)
            .map(|d| *d as usize)
            .product();
        let mismatch = || {
            GraphError::DimensionMismatch(format!(
                "cannot reshape {} elements into {:?}",
                size, self.target
            ))
        };
        let mut out = Vec::with_capacity(self.target.len());
        for d in &self.target {
            if *d >= 0 {
                out.push(*d as usize);
            } else if known == 0 || size % known != 0 {
                return Err(mismatch());
            } else {
                out.push(size / known);
            }
        }
        if out.iter().product::<usize>() != size {
            return Err(mismatch());
        }
        Ok(out)
    }
}

impl Op for Reshape {
    fn name(&self) -> String {
        let dims: Vec<String> = self.target.iter().map(|d| d.to_string()).collect();
        format!("Reshape{{{}}}", dims.join(","))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x] = inputs else {
            return Err(GraphError::TypeMismatch("Reshape takes one input".to_string()));
        };
        let dtype = graph.ty(*x).dtype;
        let broadcastable = self.target.iter().map(|d| *d == 1).collect();
        Ok(NodeSpec::new(vec![*x], vec![TensorType::new(dtype, broadcastable)]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let x = inputs[0];
        let shape = self.resolve(x.size())?;
        outputs[0] = Some(TensorValue::from_raw(x.dtype(), shape, x.data().to_vec()));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let input = &input_shapes[0];
        if input.is_concrete() {
            let size = input.to_concrete()?.iter().product();
            return Ok(vec![Shape::concrete(&self.resolve(size)?)]);
        }
        Ok(vec![Shape(
            self.target
                .iter()
                .map(|d| {
                    if *d >= 0 {
                        Dim::Concrete(*d as usize)
                    } else {
                        Dim::Symbolic(format!("{}.inferred", node))
                    }
                })
                .collect(),
        )])
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        Some(format!(
            "const sg_array* in = {i};\nsg_array* out = {o};\n\
             if (in->size != out->size) {{\n\
             snprintf(err->msg, sizeof(err->msg), \"cannot reshape %lld elements into %lld\", (long long)in->size, (long long)out->size);\n\
             {fail}\n}}\n\
             for (int64_t k = 0; k < in->size; ++k) out->data[k] = in->data[k];\n",
            i = node.inputs[0],
            o = node.outputs[0],
            fail = node.fail
        ))
    }
}

/// Pass `x` through after checking that every condition is nonzero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assert {
    message: String,
}

impl Assert {
    pub fn new(message: &str) -> Self {
        Assert {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Op for Assert {
    fn name(&self) -> String {
        format!("Assert{{msg='{}'}}", self.message)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let Some((x, conds)) = inputs.split_first() else {
            return Err(GraphError::TypeMismatch("Assert needs an input".to_string()));
        };
        if let Some(c) = conds.iter().find(|c| !graph.ty(**c).is_scalar()) {
            return Err(GraphError::TypeMismatch(format!(
                "Assert conditions must be scalars, got {}",
                graph.ty(*c)
            )));
        }
        let out = graph.ty(*x).clone();
        Ok(NodeSpec::new(inputs.to_vec(), vec![out]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        for cond in &inputs[1..] {
            if cond.as_scalar()? == 0.0 {
                return Err(GraphError::InvalidValue(format!(
                    "assertion failed: {}",
                    self.message
                )));
            }
        }
        outputs[0] = Some(inputs[0].clone());
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![input_shapes[0].clone()])
    }

    fn grad(
        &self,
        graph: &mut Graph,
        node: NodeId,
        output_grads: &[Option<VarId>],
    ) -> Result<Vec<Gradient>> {
        let n_conds = graph.node(node).inputs.len() - 1;
        let mut out = vec![match output_grads[0] {
            Some(g) => Gradient::Value(g),
            None => Gradient::Disconnected,
        }];
        out.extend(std::iter::repeat(Gradient::Disconnected).take(n_conds));
        Ok(out)
    }

    fn view_map(&self) -> AliasMap {
        let mut map = AliasMap::new();
        map.insert(0, vec![0]);
        map
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let message: String = self
            .message
            .chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"' && *c != '\\' && *c != '%')
            .collect();
        let mut code = String::new();
        for cond in &node.inputs[1..] {
            code.push_str(&format!(
                "if ({}->data[0] == 0.0) {{\n\
                 snprintf(err->msg, sizeof(err->msg), \"assertion failed: {}\");\n\
                 {}\n}}\n",
                cond, message, node.fail
            ));
        }
        code.push_str(&format!(
            "for (int64_t k = 0; k < {i}->size; ++k) {o}->data[k] = {i}->data[k];\n",
            i = node.inputs[0],
            o = node.outputs[0]
        ));
        Some(code)
    }
}

pub fn reshape(graph: &mut Graph, x: VarId, target: &[i64]) -> Result<VarId> {
    let op: OpRef = Arc::new(Reshape::new(target.to_vec())?);
    graph.apply1(op, &[x])
}

/// `x`, checked at run time against every condition in `conds`
pub fn assert_op(graph: &mut Graph, x: VarId, conds: &[VarId], message: &str) -> Result<VarId> {
    let op: OpRef = Arc::new(Assert::new(message));
    let mut inputs = vec![x];
    inputs.extend_from_slice(conds);
    graph.apply1(op, &inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::ScalarType;

    #[test]
    fn test_reshape_infers_missing_dim() {
        let op = Reshape::new(vec![-1, 2]).unwrap();
        let v = TensorValue::vector(ScalarType::Float64, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut out = vec![None];
        op.perform(&[&v], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().shape(), &[3, 2]);
        assert!(Reshape::new(vec![4, 2]).unwrap().perform(&[&v], &mut out).is_err());
        assert!(Reshape::new(vec![-1, -1]).is_err());
    }

    #[test]
    fn test_assert_fails_on_zero() {
        let op = Assert::new("positive");
        let x = TensorValue::vector(ScalarType::Float64, vec![1.0]);
        let yes = TensorValue::scalar(ScalarType::Bool, 1.0);
        let no = TensorValue::scalar(ScalarType::Bool, 0.0);
        let mut out = vec![None];
        assert!(op.perform(&[&x, &yes], &mut out).is_ok());
        let err = op.perform(&[&x, &yes, &no], &mut out).unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_assert_needs_scalar_condition() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        assert!(assert_op(&mut g, x, &[x], "bad").is_err());
    }
}
