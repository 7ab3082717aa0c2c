// Op Contract
//
// An op is an immutable, shareable description of a computation. Its
// `name()` includes every parameter, so two ops with the same name compute
// the same function; the merge pass relies on that.

use crate::core::error::Result;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::shape::Shape;
use crate::ir::types::TensorType;
use crate::ir::value::TensorValue;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Shared handle to an op
pub type OpRef = Arc<dyn Op>;

/// Output index -> input indices it destroys (destroy map) or aliases (view map)
pub type AliasMap = BTreeMap<usize, Vec<usize>>;

/// Result of `make_node`: possibly coerced inputs and the output types
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub inputs: Vec<VarId>,
    pub outputs: Vec<TensorType>,
}

impl NodeSpec {
    pub fn new(inputs: Vec<VarId>, outputs: Vec<TensorType>) -> Self {
        NodeSpec { inputs, outputs }
    }
}

/// Gradient of the cost with respect to one op input.
///
/// The markers only fail when the gradient is actually demanded.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Value(VarId),
    /// The input does not influence the outputs
    Disconnected,
    NotImplemented(String),
    Undefined(String),
}

/// Names and types handed to `Op::c_code` for one node
#[derive(Debug, Clone)]
pub struct CNode {
    /// Position of the node in the execution order
    pub index: usize,
    /// C expressions of type `sg_array*`
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub input_types: Vec<TensorType>,
    pub output_types: Vec<TensorType>,
    /// Statement reporting a failure of this node; set `err->msg` first
    pub fail: String,
}

/// Operation contract
pub trait Op: fmt::Debug + Send + Sync + Any {
    /// Display name, including all parameters
    fn name(&self) -> String;

    fn as_any(&self) -> &dyn Any;

    /// Validate and coerce inputs, compute output types.
    ///
    /// May add coercion nodes to `graph`. Returns `TypeMismatch` for
    /// incompatible inputs.
    fn make_node(&self, graph: &mut Graph, inputs: &[VarId]) -> Result<NodeSpec>;

    /// Compute outputs from concrete inputs.
    ///
    /// Every slot of `outputs` must be filled with a value of the declared type.
    fn perform(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()>;

    /// Reject runtime inputs the node's input types rule out, before any
    /// thunk runs. `input_types` are the types of the node's inputs.
    fn check_inputs(&self, input_types: &[TensorType], inputs: &[&TensorValue]) -> Result<()> {
        let _ = (input_types, inputs);
        Ok(())
    }

    /// Output shapes from input shapes, without computing values
    fn infer_shape(&self, graph: &Graph, node: NodeId, input_shapes: &[Shape]) -> Result<Vec<Shape>>;

    /// Symbolic gradient of the cost w.r.t. each input.
    ///
    /// `output_grads` has one entry per output. The gradient driver only
    /// calls this when some output reaches the cost, and passes zeros for the
    /// others; a None from any other caller means zero.
    fn grad(
        &self,
        graph: &mut Graph,
        node: NodeId,
        output_grads: &[Option<VarId>],
    ) -> Result<Vec<Gradient>> {
        let _ = output_grads;
        let n_inputs = graph.node(node).inputs.len();
        Ok(vec![Gradient::NotImplemented(self.name()); n_inputs])
    }

    /// Outputs that overwrite inputs
    fn destroy_map(&self) -> AliasMap {
        AliasMap::new()
    }

    /// Outputs that alias inputs without modifying them
    fn view_map(&self) -> AliasMap {
        AliasMap::new()
    }

    /// C fragment computing this node, or None when there is no native version
    fn c_code(&self, node: &CNode) -> Option<String> {
        let _ = node;
        None
    }

    /// Bumped when `c_code` output changes meaning
    fn c_code_cache_version(&self) -> u32 {
        1
    }
}

/// Downcast an op handle to a concrete op type
pub fn op_as<T: Op>(op: &OpRef) -> Option<&T> {
    op.as_any().downcast_ref::<T>()
}
