// IR Builder: convenience API for composing computation graphs
//
// Wraps a `Graph` and records declared inputs and outputs, so a caller can
// assemble an expression and hand the result to `function()` in one piece.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::VarId;
use crate::ir::types::{ScalarType, TensorType};
use crate::ir::value::TensorValue;
use crate::ops::{basic, blas, dimshuffle, elemwise, reduction};
use std::collections::HashMap;

/// A finished graph with its declared inputs and outputs
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    pub graph: Graph,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
}

/// Builder for computation graphs
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    /// Map from user-provided names to variables
    named: HashMap<String, VarId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input of any tensor type
    pub fn input(&mut self, name: impl Into<String>, ty: TensorType) -> Result<VarId> {
        let name = name.into();
        if self.named.contains_key(&name) {
            return Err(GraphError::InvalidValue(format!(
                "input name {} is already taken",
                name
            )));
        }
        let var = self.graph.input(&name, ty);
        self.inputs.push(var);
        self.named.insert(name, var);
        Ok(var)
    }

    pub fn input_scalar(&mut self, name: impl Into<String>, dtype: ScalarType) -> Result<VarId> {
        self.input(name, TensorType::scalar(dtype))
    }

    pub fn input_vector(&mut self, name: impl Into<String>, dtype: ScalarType) -> Result<VarId> {
        self.input(name, TensorType::vector(dtype))
    }

    pub fn input_matrix(&mut self, name: impl Into<String>, dtype: ScalarType) -> Result<VarId> {
        self.input(name, TensorType::matrix(dtype))
    }

    pub fn constant(&mut self, value: TensorValue) -> VarId {
        self.graph.constant(value)
    }

    pub fn scalar(&mut self, dtype: ScalarType, value: f64) -> VarId {
        self.graph.scalar_constant(dtype, value)
    }

    pub fn add(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        elemwise::add(&mut self.graph, &[a, b])
    }

    pub fn sub(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        elemwise::sub(&mut self.graph, a, b)
    }

    pub fn mul(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        elemwise::mul(&mut self.graph, &[a, b])
    }

    pub fn div(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        elemwise::true_div(&mut self.graph, a, b)
    }

    pub fn neg(&mut self, a: VarId) -> Result<VarId> {
        elemwise::neg(&mut self.graph, a)
    }

    pub fn exp(&mut self, a: VarId) -> Result<VarId> {
        elemwise::exp(&mut self.graph, a)
    }

    pub fn log(&mut self, a: VarId) -> Result<VarId> {
        elemwise::log(&mut self.graph, a)
    }

    pub fn dot(&mut self, a: VarId, b: VarId) -> Result<VarId> {
        blas::dot(&mut self.graph, a, b)
    }

    pub fn transpose(&mut self, a: VarId) -> Result<VarId> {
        dimshuffle::transpose(&mut self.graph, a)
    }

    pub fn sum(&mut self, a: VarId, axes: Option<Vec<usize>>) -> Result<VarId> {
        reduction::sum(&mut self.graph, a, axes)
    }

    pub fn reshape(&mut self, a: VarId, target: &[i64]) -> Result<VarId> {
        basic::reshape(&mut self.graph, a, target)
    }

    /// Mark a variable as a graph output
    pub fn output(&mut self, var: VarId) -> Result<VarId> {
        if var.0 >= self.graph.num_vars() {
            return Err(GraphError::InvalidValue(format!("unknown variable {}", var)));
        }
        self.outputs.push(var);
        Ok(var)
    }

    /// Name an intermediate variable so it can be looked up later
    pub fn name(&mut self, var: VarId, name: impl Into<String>) {
        let name = name.into();
        self.graph.set_name(var, &name);
        self.named.insert(name, var);
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn get_by_name(&self, name: &str) -> Option<VarId> {
        self.named.get(name).copied()
    }

    pub fn build(self) -> BuiltGraph {
        BuiltGraph {
            graph: self.graph,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}
