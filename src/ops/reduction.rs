// Reductions
//
// Sum over a set of axes. Elements are accumulated in row-major input order
// and rounded once at the end.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{CNode, Gradient, NodeSpec, Op, OpRef};
use crate::ir::shape::Shape;
use crate::ir::types::{ScalarType, TensorType};
use crate::ir::value::TensorValue;
use crate::ops::dimshuffle::{dimshuffle, ShuffleDim};
use crate::ops::elemwise;
use std::any::Any;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Sum {
    /// Sorted axes to reduce; None reduces all
    axes: Option<Vec<usize>>,
}

impl Sum {
    pub fn new(axes: Option<Vec<usize>>) -> Self {
        let axes = axes.map(|mut a| {
            a.sort_unstable();
            a.dedup();
            a
        });
        Sum { axes }
    }

    fn reduced(&self, ndim: usize) -> Result<Vec<usize>> {
        match &self.axes {
            None => Ok((0..ndim).collect()),
            Some(axes) => {
                if let Some(bad) = axes.iter().find(|a| **a >= ndim) {
                    return Err(GraphError::TypeMismatch(format!(
                        "axis {} out of range for rank {}",
                        bad, ndim
                    )));
                }
                Ok(axes.clone())
            }
        }
    }

    fn output_dtype(dtype: ScalarType) -> ScalarType {
        if dtype == ScalarType::Bool {
            ScalarType::Int64
        } else {
            dtype
        }
    }
}

impl Op for Sum {
    fn name(&self) -> String {
        match &self.axes {
            None => "Sum{acc}".to_string(),
            Some(axes) => {
                let axes: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
                format!("Sum{{axis=[{}]}}", axes.join(", "))
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x] = inputs else {
            return Err(GraphError::TypeMismatch("Sum takes one input".to_string()));
        };
        let ty = graph.ty(*x).clone();
        let reduced = self.reduced(ty.ndim())?;
        let broadcastable = ty
            .broadcastable
            .iter()
            .enumerate()
            .filter(|(d, _)| !reduced.contains(d))
            .map(|(_, b)| *b)
            .collect();
        Ok(NodeSpec::new(
            vec![*x],
            vec![TensorType::new(Sum::output_dtype(ty.dtype), broadcastable)],
        ))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let x = inputs[0];
        let reduced = self.reduced(x.ndim())?;
        let out_shape: Vec<usize> = x
            .shape()
            .iter()
            .enumerate()
            .filter(|(d, _)| !reduced.contains(d))
            .map(|(_, n)| *n)
            .collect();
        let out_strides = crate::ir::value::contiguous_strides(&out_shape);
        // stride of each input axis in the output, 0 for reduced axes
        let mut axis_strides = Vec::with_capacity(x.ndim());
        let mut k = 0;
        for d in 0..x.ndim() {
            if reduced.contains(&d) {
                axis_strides.push(0);
            } else {
                axis_strides.push(out_strides[k]);
                k += 1;
            }
        }
        let size: usize = out_shape.iter().product();
        let mut acc = vec![0.0; size];
        for (flat, value) in x.data().iter().enumerate() {
            let offset = crate::ir::value::broadcast_offset(flat, x.shape(), &axis_strides);
            acc[offset] += value;
        }
        let dtype = Sum::output_dtype(x.dtype());
        let data = acc.into_iter().map(|v| dtype.round(v)).collect();
        outputs[0] = Some(TensorValue::from_raw(dtype, out_shape, data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let dims = input_shapes[0].dims();
        let reduced = self.reduced(dims.len())?;
        Ok(vec![Shape(
            dims.iter()
                .enumerate()
                .filter(|(d, _)| !reduced.contains(d))
                .map(|(_, dim)| dim.clone())
                .collect(),
        )])
    }

    fn grad(
        &self,
        graph: &mut Graph,
        node: NodeId,
        output_grads: &[Option<VarId>],
    ) -> Result<Vec<Gradient>> {
        let Some(g) = output_grads[0] else {
            return Ok(vec![Gradient::Disconnected]);
        };
        let x = graph.node(node).inputs[0];
        let x_ty = graph.ty(x).clone();
        if !x_ty.dtype.is_float() {
            return Ok(vec![Gradient::Disconnected]);
        }
        let reduced = self.reduced(x_ty.ndim())?;
        let mut order = Vec::with_capacity(x_ty.ndim());
        let mut next = 0;
        for d in 0..x_ty.ndim() {
            if reduced.contains(&d) {
                order.push(ShuffleDim::Broadcast);
            } else {
                order.push(ShuffleDim::Axis(next));
                next += 1;
            }
        }
        let g = elemwise::cast(graph, g, x_ty.dtype)?;
        let expanded = dimshuffle(graph, g, &order)?;
        Ok(vec![Gradient::Value(elemwise::second(graph, x, expanded)?)])
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let in_ty = &node.input_types[0];
        let reduced = self.reduced(in_ty.ndim()).ok()?;
        let nd = in_ty.ndim();
        let dtype = node.output_types[0].dtype;
        let mut code = format!(
            "const sg_array* in = {};\nsg_array* out = {};\n",
            node.inputs[0], node.outputs[0]
        );
        code.push_str(&format!("int64_t ax_st[{}];\n", nd.max(1)));
        code.push_str("int64_t st = 1;\n");
        for d in (0..nd).rev() {
            if reduced.contains(&d) {
                code.push_str(&format!("ax_st[{}] = 0;\n", d));
            } else {
                code.push_str(&format!("ax_st[{d}] = st; st *= in->shape[{d}];\n", d = d));
            }
        }
        code.push_str("for (int64_t i = 0; i < out->size; ++i) out->data[i] = 0.0;\n");
        code.push_str("for (int64_t flat = 0; flat < in->size; ++flat) {\n");
        code.push_str("int64_t rem = flat;\nint64_t off = 0;\n");
        for d in (0..nd).rev() {
            code.push_str(&format!(
                "off += (rem % in->shape[{d}]) * ax_st[{d}]; rem /= in->shape[{d}];\n",
                d = d
            ));
        }
        code.push_str("out->data[off] += in->data[flat];\n}\n");
        code.push_str(&format!(
            "for (int64_t i = 0; i < out->size; ++i) out->data[i] = {};\n",
            crate::ops::scalar::c_round(dtype, "out->data[i]")
        ));
        Some(code)
    }
}

/// Sum over `axes` (all axes when None)
pub fn sum(graph: &mut Graph, x: VarId, axes: Option<Vec<usize>>) -> Result<VarId> {
    let op: OpRef = Arc::new(Sum::new(axes));
    graph.apply1(op, &[x])
}
