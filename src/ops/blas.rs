// BLAS-style Operations
//
// `Dot` is the user-facing product over vectors and matrices. The optimizer
// specializes it into `Dot22`, `Dot22Scalar` and the fused scaled-accumulate
// `Gemm`, which computes `z <- beta * z + alpha * dot(x, y)`. When beta is
// zero the old contents of z are ignored, NaNs included.

use crate::core::error::{GraphError, Result};
use crate::ir::destroy::view_root;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::op::{AliasMap, CNode, Gradient, NodeSpec, Op, OpRef};
use crate::ir::shape::Shape;
use crate::ir::types::{ScalarType, TensorType};
use crate::ir::value::TensorValue;
use crate::ops::dimshuffle::{dimshuffle, transpose, ShuffleDim};
use crate::ops::elemwise;
use crate::ops::scalar::c_round;
use std::any::Any;
use std::sync::Arc;

pub const E_RANK: &str = "gemm only works for rank 2";
pub const E_SCALAR: &str = "gemm requires scalar alpha and beta";
pub const E_MIXED: &str = "gemm requires matching dtypes";
pub const E_FLOAT: &str = "gemm requires floating-point dtypes";
pub const E_Z_UNIQ: &str = "argument z aliased to x or y";

/// Rows, inner length and columns of a product, treating vectors as
/// a row (left) or a column (right)
fn product_dims(x: &TensorValue, y: &TensorValue) -> Result<(usize, usize, usize)> {
    let (m, k) = match x.shape() {
        [k] => (1, *k),
        [m, k] => (*m, *k),
        other => {
            return Err(GraphError::DimensionMismatch(format!(
                "dot of rank {} argument",
                other.len()
            )))
        }
    };
    let (k2, n) = match y.shape() {
        [k2] => (*k2, 1),
        [k2, n] => (*k2, *n),
        other => {
            return Err(GraphError::DimensionMismatch(format!(
                "dot of rank {} argument",
                other.len()
            )))
        }
    };
    if k != k2 {
        return Err(GraphError::DimensionMismatch(format!(
            "shapes {:?} and {:?} not aligned: {} != {}",
            x.shape(),
            y.shape(),
            k,
            k2
        )));
    }
    Ok((m, k, n))
}

/// Unrounded row-major product; accumulates left to right over the inner axis
fn raw_product(x: &TensorValue, y: &TensorValue) -> Result<(Vec<f64>, usize, usize)> {
    let (m, k, n) = product_dims(x, y)?;
    let (xd, yd) = (x.data(), y.data());
    let mut out = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for p in 0..k {
                acc += xd[i * k + p] * yd[p * n + j];
            }
            out.push(acc);
        }
    }
    Ok((out, m, n))
}

/// C statements computing `acc` for every (i, j) and running `store`
fn c_product(x: &str, y: &str, fail: &str, store: &str) -> String {
    format!(
        "const sg_array* x = {x};\n\
         const sg_array* y = {y};\n\
         int64_t m = x->ndim == 2 ? x->shape[0] : 1;\n\
         int64_t k = x->ndim == 2 ? x->shape[1] : x->shape[0];\n\
         int64_t k2 = y->shape[0];\n\
         int64_t n = y->ndim == 2 ? y->shape[1] : 1;\n\
         if (k != k2) {{\n\
         snprintf(err->msg, sizeof(err->msg), \"shapes not aligned: %lld != %lld\", (long long)k, (long long)k2);\n\
         {fail}\n}}\n\
         for (int64_t i = 0; i < m; ++i) {{\n\
         for (int64_t j = 0; j < n; ++j) {{\n\
         double acc = 0.0;\n\
         for (int64_t p = 0; p < k; ++p) acc += x->data[i * k + p] * y->data[p * n + j];\n\
         {store}\n}}\n}}\n",
        x = x,
        y = y,
        fail = fail,
        store = store
    )
}

fn is_float(ty: &TensorType) -> bool {
    ty.dtype.is_float()
}

/// Cast a 0-d scale to `dtype` when that loses nothing
fn coerce_scale(graph: &mut Graph, s: VarId, dtype: ScalarType) -> Result<VarId> {
    let s_ty = graph.ty(s).clone();
    if !s_ty.is_scalar() {
        return Err(GraphError::TypeMismatch(E_SCALAR.to_string()));
    }
    if s_ty.dtype == dtype {
        return Ok(s);
    }
    if ScalarType::upcast(s_ty.dtype, dtype) != dtype {
        return Err(GraphError::TypeMismatch(format!(
            "{}: scale {} would upcast {}",
            E_MIXED, s_ty.dtype, dtype
        )));
    }
    elemwise::cast(graph, s, dtype)
}

/// General product of vectors and matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dot;

impl Op for Dot {
    fn name(&self) -> String {
        "dot".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x, y] = inputs else {
            return Err(GraphError::TypeMismatch("dot takes two inputs".to_string()));
        };
        let (xt, yt) = (graph.ty(*x).clone(), graph.ty(*y).clone());
        let broadcastable = match (xt.ndim(), yt.ndim()) {
            (2, 2) => vec![xt.broadcastable[0], yt.broadcastable[1]],
            (2, 1) => vec![xt.broadcastable[0]],
            (1, 2) => vec![yt.broadcastable[1]],
            (1, 1) => vec![],
            (a, b) => {
                return Err(GraphError::TypeMismatch(format!(
                    "dot supports vectors and matrices, got ranks {} and {}",
                    a, b
                )))
            }
        };
        let dtype = ScalarType::upcast(xt.dtype, yt.dtype);
        Ok(NodeSpec::new(
            vec![*x, *y],
            vec![TensorType::new(dtype, broadcastable)],
        ))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let (x, y) = (inputs[0], inputs[1]);
        let (acc, m, n) = raw_product(x, y)?;
        let shape = match (x.ndim(), y.ndim()) {
            (2, 2) => vec![m, n],
            (2, 1) => vec![m],
            (1, 2) => vec![n],
            _ => vec![],
        };
        let dtype = ScalarType::upcast(x.dtype(), y.dtype());
        let data = acc.into_iter().map(|v| dtype.round(v)).collect();
        outputs[0] = Some(TensorValue::from_raw(dtype, shape, data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![Shape::matmul(&input_shapes[0], &input_shapes[1])?])
    }

    fn grad(
        &self,
        graph: &mut Graph,
        node: NodeId,
        output_grads: &[Option<VarId>],
    ) -> Result<Vec<Gradient>> {
        let Some(g) = output_grads[0] else {
            return Ok(vec![Gradient::Disconnected, Gradient::Disconnected]);
        };
        let inputs = graph.node(node).inputs.clone();
        let (x, y) = (inputs[0], inputs[1]);
        let (xn, yn) = (graph.ty(x).ndim(), graph.ty(y).ndim());
        let (gx, gy) = match (xn, yn) {
            (2, 2) => {
                let yt = transpose(graph, y)?;
                let xt = transpose(graph, x)?;
                (dot(graph, g, yt)?, dot(graph, xt, g)?)
            }
            (2, 1) => {
                // g: (m,), x: (m, k), y: (k,)
                let g_col = dimshuffle(graph, g, &[ShuffleDim::Axis(0), ShuffleDim::Broadcast])?;
                let y_row = dimshuffle(graph, y, &[ShuffleDim::Broadcast, ShuffleDim::Axis(0)])?;
                let xt = transpose(graph, x)?;
                (dot(graph, g_col, y_row)?, dot(graph, xt, g)?)
            }
            (1, 2) => {
                // g: (n,), x: (k,), y: (k, n)
                let x_col = dimshuffle(graph, x, &[ShuffleDim::Axis(0), ShuffleDim::Broadcast])?;
                let g_row = dimshuffle(graph, g, &[ShuffleDim::Broadcast, ShuffleDim::Axis(0)])?;
                (dot(graph, y, g)?, dot(graph, x_col, g_row)?)
            }
            _ => (elemwise::mul(graph, &[g, y])?, elemwise::mul(graph, &[g, x])?),
        };
        let mut out = Vec::with_capacity(2);
        for (input, grad) in [(x, gx), (y, gy)] {
            if graph.ty(input).dtype.is_float() {
                out.push(Gradient::Value(elemwise::reduce_to_input(graph, grad, input)?));
            } else {
                out.push(Gradient::Disconnected);
            }
        }
        Ok(out)
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let dtype = node.output_types[0].dtype;
        let store = format!(
            "{}->data[i * n + j] = {};",
            node.outputs[0],
            c_round(dtype, "acc")
        );
        Some(c_product(&node.inputs[0], &node.inputs[1], &node.fail, &store))
    }
}

/// Matrix-matrix product of one float dtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dot22;

fn check_float_matrices(graph: &Graph, name: &str, inputs: &[VarId]) -> Result<ScalarType> {
    let first = graph.ty(inputs[0]).dtype;
    for &v in inputs {
        let ty = graph.ty(v);
        if ty.ndim() != 2 {
            return Err(GraphError::TypeMismatch(format!("{}: {}", name, E_RANK)));
        }
        if !is_float(ty) {
            return Err(GraphError::TypeMismatch(format!("{}: {}", name, E_FLOAT)));
        }
        if ty.dtype != first {
            return Err(GraphError::TypeMismatch(format!("{}: {}", name, E_MIXED)));
        }
    }
    Ok(first)
}

impl Op for Dot22 {
    fn name(&self) -> String {
        "Dot22".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x, y] = inputs else {
            return Err(GraphError::TypeMismatch("Dot22 takes two inputs".to_string()));
        };
        let dtype = check_float_matrices(graph, "Dot22", &[*x, *y])?;
        let bcast = vec![graph.ty(*x).broadcastable[0], graph.ty(*y).broadcastable[1]];
        Ok(NodeSpec::new(vec![*x, *y], vec![TensorType::new(dtype, bcast)]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let (acc, m, n) = raw_product(inputs[0], inputs[1])?;
        let dtype = inputs[0].dtype();
        let data = acc.into_iter().map(|v| dtype.round(v)).collect();
        outputs[0] = Some(TensorValue::from_raw(dtype, vec![m, n], data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![Shape::matmul(&input_shapes[0], &input_shapes[1])?])
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let dtype = node.output_types[0].dtype;
        let store = format!(
            "{}->data[i * n + j] = {};",
            node.outputs[0],
            c_round(dtype, "acc")
        );
        Some(c_product(&node.inputs[0], &node.inputs[1], &node.fail, &store))
    }
}

/// `a * dot(x, y)` for matrices x, y and a 0-d a
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dot22Scalar;

impl Op for Dot22Scalar {
    fn name(&self) -> String {
        "Dot22Scalar".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [x, y, a] = inputs else {
            return Err(GraphError::TypeMismatch("Dot22Scalar takes three inputs".to_string()));
        };
        let dtype = check_float_matrices(graph, "Dot22Scalar", &[*x, *y])?;
        let a = coerce_scale(graph, *a, dtype)?;
        let bcast = vec![graph.ty(*x).broadcastable[0], graph.ty(*y).broadcastable[1]];
        Ok(NodeSpec::new(vec![*x, *y, a], vec![TensorType::new(dtype, bcast)]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let (acc, m, n) = raw_product(inputs[0], inputs[1])?;
        let a = inputs[2].as_scalar()?;
        let dtype = inputs[0].dtype();
        let data = acc.into_iter().map(|v| dtype.round(a * v)).collect();
        outputs[0] = Some(TensorValue::from_raw(dtype, vec![m, n], data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        Ok(vec![Shape::matmul(&input_shapes[0], &input_shapes[1])?])
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let dtype = node.output_types[0].dtype;
        let store = format!(
            "{}->data[i * n + j] = {};",
            node.outputs[0],
            c_round(dtype, "a * acc")
        );
        Some(format!(
            "double a = {}->data[0];\n{}",
            node.inputs[2],
            c_product(&node.inputs[0], &node.inputs[1], &node.fail, &store)
        ))
    }
}

/// Fused scaled accumulate over inputs (z, alpha, x, y, beta)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gemm {
    inplace: bool,
}

impl Gemm {
    pub fn new(inplace: bool) -> Self {
        Gemm { inplace }
    }

    pub fn is_inplace(&self) -> bool {
        self.inplace
    }
}

impl Op for Gemm {
    fn name(&self) -> String {
        if self.inplace {
            "Gemm{inplace}".to_string()
        } else {
            "Gemm{no_inplace}".to_string()
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec> {
        let [z, a, x, y, b] = inputs else {
            return Err(GraphError::TypeMismatch("gemm takes five inputs".to_string()));
        };
        let dtype = check_float_matrices(graph, "gemm", &[*z, *x, *y])?;
        let a = coerce_scale(graph, *a, dtype)?;
        let b = coerce_scale(graph, *b, dtype)?;
        if self.inplace {
            let root = view_root(graph, *z);
            if [*x, *y].iter().any(|v| view_root(graph, *v) == root) {
                return Err(GraphError::Inconsistency(E_Z_UNIQ.to_string()));
            }
        }
        let out = graph.ty(*z).clone();
        Ok(NodeSpec::new(vec![*z, a, *x, *y, b], vec![out]))
    }

    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let (z, x, y) = (inputs[0], inputs[2], inputs[3]);
        let alpha = inputs[1].as_scalar()?;
        let beta = inputs[4].as_scalar()?;
        let (acc, m, n) = raw_product(x, y)?;
        if z.shape() != [m, n] {
            return Err(GraphError::DimensionMismatch(format!(
                "gemm: z has shape {:?}, dot(x, y) has shape [{}, {}]",
                z.shape(),
                m,
                n
            )));
        }
        let dtype = z.dtype();
        let data = acc
            .iter()
            .zip(z.data())
            .map(|(acc, zv)| {
                if beta == 0.0 {
                    dtype.round(alpha * acc)
                } else {
                    dtype.round(beta * zv + alpha * acc)
                }
            })
            .collect();
        outputs[0] = Some(TensorValue::from_raw(dtype, vec![m, n], data));
        Ok(())
    }

    fn infer_shape(&self, _graph: &Graph, _node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>> {
        let product = Shape::matmul(&input_shapes[2], &input_shapes[3])?;
        let z = &input_shapes[0];
        for (zd, pd) in z.dims().iter().zip(product.dims()) {
            if !zd.compatible_with(pd) {
                return Err(GraphError::DimensionMismatch(format!(
                    "gemm: z has shape {}, dot(x, y) has shape {}",
                    z, product
                )));
            }
        }
        Ok(vec![z.clone()])
    }

    fn destroy_map(&self) -> AliasMap {
        let mut map = AliasMap::new();
        if self.inplace {
            map.insert(0, vec![0]);
        }
        map
    }

    fn c_code(&self, node: &CNode) -> Option<String> {
        let dtype = node.output_types[0].dtype;
        let out = &node.outputs[0];
        let store = format!(
            "{out}->data[i * n + j] = {};",
            c_round(dtype, "(beta == 0.0 ? alpha * acc : beta * zv + alpha * acc)"),
            out = out
        );
        let store = format!("double zv = z->data[i * n + j];\n{}", store);
        Some(format!(
            "const sg_array* z = {z};\n\
             double alpha = {a}->data[0];\n\
             double beta = {b}->data[0];\n\
             {{\n{product}}}\n",
            z = node.inputs[0],
            a = node.inputs[1],
            b = node.inputs[4],
            product = c_product_checked(&node.inputs[2], &node.inputs[3], &node.fail, &store),
        ))
    }

    fn c_code_cache_version(&self) -> u32 {
        2
    }
}

/// `c_product` with an extra check that z matches the product shape
fn c_product_checked(x: &str, y: &str, fail: &str, store: &str) -> String {
    let guard = format!(
        "if (z->ndim != 2 || z->shape[0] != m || z->shape[1] != n) {{\n\
         snprintf(err->msg, sizeof(err->msg), \"gemm: z does not match dot(x, y)\");\n\
         {fail}\n}}\n",
        fail = fail
    );
    c_product(x, y, fail, store).replacen(
        "for (int64_t i = 0;",
        &format!("{}for (int64_t i = 0;", guard),
        1,
    )
}

/// Product of vectors and matrices
pub fn dot(graph: &mut Graph, x: VarId, y: VarId) -> Result<VarId> {
    let op: OpRef = Arc::new(Dot);
    graph.apply1(op, &[x, y])
}

pub fn dot22(graph: &mut Graph, x: VarId, y: VarId) -> Result<VarId> {
    let op: OpRef = Arc::new(Dot22);
    graph.apply1(op, &[x, y])
}

pub fn dot22scalar(graph: &mut Graph, x: VarId, y: VarId, a: VarId) -> Result<VarId> {
    let op: OpRef = Arc::new(Dot22Scalar);
    graph.apply1(op, &[x, y, a])
}

/// `beta * z + alpha * dot(x, y)` into a fresh buffer
pub fn gemm_no_inplace(
    graph: &mut Graph,
    z: VarId,
    alpha: VarId,
    x: VarId,
    y: VarId,
    beta: VarId,
) -> Result<VarId> {
    let op: OpRef = Arc::new(Gemm::new(false));
    graph.apply1(op, &[z, alpha, x, y, beta])
}

/// `beta * z + alpha * dot(x, y)` overwriting z
pub fn gemm_inplace(
    graph: &mut Graph,
    z: VarId,
    alpha: VarId,
    x: VarId,
    y: VarId,
    beta: VarId,
) -> Result<VarId> {
    let op: OpRef = Arc::new(Gemm::new(true));
    graph.apply1(op, &[z, alpha, x, y, beta])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmat(g: &mut Graph, name: &str) -> VarId {
        g.input(name, TensorType::matrix(ScalarType::Float64))
    }

    #[test]
    fn test_gemm_rank_checks() {
        let mut g = Graph::new();
        let v = g.input("v", TensorType::vector(ScalarType::Float64));
        let one = g.scalar_constant(ScalarType::Float64, 1.0);
        let err = gemm_no_inplace(&mut g, v, one, v, v, one).unwrap_err();
        assert!(err.to_string().contains(E_RANK));
    }

    #[test]
    fn test_gemm_z_unique() {
        let mut g = Graph::new();
        let z = fmat(&mut g, "z");
        let a = fmat(&mut g, "a");
        let one = g.scalar_constant(ScalarType::Float64, 1.0);
        assert_eq!(
            gemm_inplace(&mut g, z, one, z, z, one).unwrap_err(),
            GraphError::Inconsistency(E_Z_UNIQ.to_string())
        );
        let zt = transpose(&mut g, z).unwrap();
        assert!(gemm_inplace(&mut g, z, one, a, zt, one).unwrap_err().is_inconsistency());
        assert!(gemm_inplace(&mut g, z, one, zt, a, one).unwrap_err().is_inconsistency());
        assert!(gemm_inplace(&mut g, z, one, a, a, one).is_ok());
    }

    #[test]
    fn test_gemm_beta_zero_ignores_z() {
        let z = TensorValue::matrix(ScalarType::Float64, &[vec![f64::NAN]]).unwrap();
        let x = TensorValue::matrix(ScalarType::Float64, &[vec![2.0, 3.0]]).unwrap();
        let y = TensorValue::matrix(ScalarType::Float64, &[vec![4.0], vec![5.0]]).unwrap();
        let alpha = TensorValue::scalar(ScalarType::Float64, 0.5);
        let beta = TensorValue::scalar(ScalarType::Float64, 0.0);
        let mut out = vec![None];
        Gemm::new(false)
            .perform(&[&z, &alpha, &x, &y, &beta], &mut out)
            .unwrap();
        assert_eq!(out[0].as_ref().unwrap().data(), &[11.5]);
    }

    #[test]
    fn test_dot_vector_cases() {
        let m = TensorValue::matrix(ScalarType::Float64, &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let v = TensorValue::vector(ScalarType::Float64, vec![1.0, 1.0]);
        let mut out = vec![None];
        Dot.perform(&[&m, &v], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().data(), &[3.0, 7.0]);
        Dot.perform(&[&v, &m], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().data(), &[4.0, 6.0]);
        Dot.perform(&[&v, &v], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().shape(), &[] as &[usize]);
        let bad = TensorValue::vector(ScalarType::Float64, vec![1.0, 1.0, 1.0]);
        assert!(matches!(
            Dot.perform(&[&m, &bad], &mut out),
            Err(GraphError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_scale_upcast_rejected() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(ScalarType::Float32));
        let a64 = g.scalar_constant(ScalarType::Float64, 2.0);
        assert!(dot22scalar(&mut g, x, x, a64).is_err());
        let a32 = g.scalar_constant(ScalarType::Float32, 2.0);
        let out = dot22scalar(&mut g, x, x, a32).unwrap();
        assert_eq!(g.ty(out), &TensorType::matrix(ScalarType::Float32));
    }
}
