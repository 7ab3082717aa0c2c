// DimShuffle
//
// Permutes axes, inserts broadcastable axes and drops broadcastable ones.
// The output is declared a view of the input; runtime values are copied.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{AliasMap, CNode, Gradient, NodeSpec, Op, OpRef};
use crate::ir::shape::{Dim, Shape};
use crate::ir::types::TensorType;
use crate::ir::value::{contiguous_strides, TensorValue};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Entry of a new axis order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShuffleDim {
    /// Take this input axis
    Axis(usize),
    /// Insert a length-1 axis
    Broadcast,
}

impl fmt::Display for ShuffleDim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShuffleDim::Axis(a) => write!(f, "{}", a),
            ShuffleDim::Broadcast => write!(f, "x"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimShuffle {
    input_broadcastable: Vec<bool>,
    new_order: Vec<ShuffleDim>,
}

impl DimShuffle {
    pub fn new(input_broadcastable: Vec<bool>, new_order: Vec<ShuffleDim>) -> Result<Self> {
        let mut used = vec![false; input_broadcastable.len()];
        for entry in &new_order {
            if let ShuffleDim::Axis(a) = entry {
                match used.get_mut(*a) {
                    Some(flag) if !*flag => *flag = true,
                    Some(_) => {
                        return Err(GraphError::InvalidValue(format!(
                            "axis {} appears twice in the new order",
                            a
                        )))
                    }
                    None => {
                        return Err(GraphError::InvalidValue(format!(
                            "axis {} is out of range for rank {}",
                            a,
                            input_broadcastable.len()
                        )))
                    }
                }
            }
        }
        for (axis, kept) in used.iter().enumerate() {
            if !kept && !input_broadcastable[axis] {
                return Err(GraphError::InvalidValue(format!(
                    "cannot drop non-broadcastable axis {}",
                    axis
                )));
            }
        }
        Ok(DimShuffle {
            input_broadcastable,
            new_order,
        })
    }

    pub fn new_order(&self) -> &[ShuffleDim] {
        &self.new_order
    }

    pub fn input_broadcastable(&self) -> &[bool] {
        &self.input_broadcastable
    }

    /// Keeps every axis in place and adds none
    pub fn is_identity(&self) -> bool {
        self.new_order.len() == self.input_broadcastable.len()
            && self
                .new_order
                .iter()
                .enumerate()
                .all(|(i, d)| *d == ShuffleDim::Axis(i))
    }

    /// Swaps the two axes of a matrix
    pub fn is_transpose(&self) -> bool {
        self.input_broadcastable.len() == 2
            && self.new_order == [ShuffleDim::Axis(1), ShuffleDim::Axis(0)]
    }

    /// Equivalent single shuffle of applying `self` and then `outer`
    pub fn compose(&self, outer: &DimShuffle) -> Result<DimShuffle> {
        let order = outer
            .new_order
            .iter()
            .map(|d| match d {
                ShuffleDim::Axis(a) => self.new_order[*a],
                ShuffleDim::Broadcast => ShuffleDim::Broadcast,
            })
            .collect();
        DimShuffle::new(self.input_broadcastable.clone(), order)
    }

    fn output_broadcastable(&self, input: &[bool]) -> Vec<bool> {
        self.new_order
            .iter()
            .map(|d| match d {
                ShuffleDim::Axis(a) => input[*a],
                ShuffleDim::Broadcast => true,
            })
            .collect()
    }

    fn output_shape(&self, input: &[usize]) -> Vec<usize> {
        self.new_order
            .iter()
            .map(|d| match d {
                ShuffleDim::Axis(a) => input[*a],
                ShuffleDim::Broadcast => 1,
            })
            .collect()
    }
}

impl Op for DimShuffle {
    fn name(&self) -> String {
        let order: Vec<String> = self.new_order.iter().map(|d| d.to_string()).collect();
        format!("DimShuffle{{{}}}", order.join(","))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x] = inputs else {
            return Err(GraphError::TypeMismatch("DimShuffle takes one input".to_string()));
        };
        let ty = graph.ty(*x).clone();
        if ty.ndim() != self.input_broadcastable.len() {
            return Err(GraphError::TypeMismatch(format!(
                "{} expects rank {}, got {}",
                self.name(),
                self.input_broadcastable.len(),
                ty.ndim()
            )));
        }
        for (expected, actual) in self.input_broadcastable.iter().zip(&ty.broadcastable) {
            if *expected && !*actual {
                return Err(GraphError::TypeMismatch(format!(
                    "{} expects broadcastable pattern {:?}, got {:?}",
                    self.name(),
                    self.input_broadcastable,
                    ty.broadcastable
                )));
            }
        }
        let out = TensorType::new(ty.dtype, self.output_broadcastable(&ty.broadcastable));
        Ok(NodeSpec::new(vec![*x], vec![out]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let x = inputs[0];
        let in_strides = contiguous_strides(x.shape());
        let out_shape = self.output_shape(x.shape());
        let out_strides: Vec<usize> = self
            .new_order
            .iter()
            .map(|d| match d {
                ShuffleDim::Axis(a) => in_strides[*a],
                ShuffleDim::Broadcast => 0,
            })
            .collect();
        let size: usize = out_shape.iter().product();
        let mut data = Vec::with_capacity(size);
        for flat in 0..size {
            data.push(x.data()[crate::ir::value::broadcast_offset(flat, &out_shape, &out_strides)]);
        }
        outputs[0] = Some(TensorValue::from_raw(x.dtype(), out_shape, data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let dims = input_shapes[0].dims();
        Ok(vec![Shape(
            self.new_order
                .iter()
                .map(|d| match d {
                    ShuffleDim::Axis(a) => dims[*a].clone(),
                    ShuffleDim::Broadcast => Dim::Concrete(1),
                })
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
        let mut order = vec![ShuffleDim::Broadcast; self.input_broadcastable.len()];
        for (i, d) in self.new_order.iter().enumerate() {
            if let ShuffleDim::Axis(a) = d {
                order[*a] = ShuffleDim::Axis(i);
            }
        }
        let x = graph.node(node).inputs[0];
        let dtype = graph.ty(x).dtype;
        let g = crate::ops::elemwise::cast(graph, g, dtype)?;
        Ok(vec![Gradient::Value(dimshuffle(graph, g, &order)?)])
    }

    fn view_map(&self) -> AliasMap {
        let mut map = AliasMap::new();
        map.insert(0, vec![0]);
        map
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let in_nd = self.input_broadcastable.len();
        let mut code = format!(
            "const sg_array* in = {};\nsg_array* out = {};\nint64_t in_st[{}];\nint64_t st = 1;\n",
            node.inputs[0],
            node.outputs[0],
            in_nd.max(1)
        );
        code.push_str(&format!(
            "for (int64_t d = {} - 1; d >= 0; --d) {{ in_st[d] = st; st *= in->shape[d]; }}\n",
            in_nd
        ));
        code.push_str("for (int64_t flat = 0; flat < out->size; ++flat) {\n");
        code.push_str("int64_t rem = flat;\nint64_t off = 0;\n");
        for (d, entry) in self.new_order.iter().enumerate().rev() {
            code.push_str(&format!(
                "{{ int64_t idx = rem % out->shape[{d}]; rem /= out->shape[{d}];",
                d = d
            ));
            match entry {
                ShuffleDim::Axis(a) => code.push_str(&format!(" off += idx * in_st[{}]; }}\n", a)),
                ShuffleDim::Broadcast => code.push_str(" (void)idx; }\n"),
            }
        }
        code.push_str("out->data[flat] = in->data[off];\n}\n");
        Some(code)
    }
}

/// Apply a DimShuffle with the given order
pub fn dimshuffle(graph: &mut Graph, x: VarId, order: &[ShuffleDim]) -> Result<VarId> {
    let op: OpRef = Arc::new(DimShuffle::new(
        graph.ty(x).broadcastable.clone(),
        order.to_vec(),
    )?);
    graph.apply1(op, &[x])
}

/// Matrix transpose
pub fn transpose(graph: &mut Graph, x: VarId) -> Result<VarId> {
    let nd = graph.ty(x).ndim();
    let order: Vec<ShuffleDim> = (0..nd).rev().map(ShuffleDim::Axis).collect();
    dimshuffle(graph, x, &order)
}

/// Drop every axis of an all-broadcastable tensor
pub fn to_scalar(graph: &mut Graph, x: VarId) -> Result<VarId> {
    if graph.ty(x).is_scalar() {
        return Ok(x);
    }
    dimshuffle(graph, x, &[])
}
