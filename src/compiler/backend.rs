// Compiler Backend Abstraction
//
// A back end turns one Apply node into a native kernel with the same calling
// convention as `Op::perform`. Nodes a back end does not cover are left to the
// interpreter.

use crate::core::error::Result;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::value::TensorValue;
use std::sync::Arc;

/// Natively compiled computation of one node
pub trait NodeKernel: Send + Sync {
    /// Compute outputs from inputs; same contract as `Op::perform`
    fn run(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()>;
}

/// Per-node native back end
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the back end can run at all on this host
    fn is_available(&self) -> bool {
        true
    }

    /// Compile `node`, or None when the node is outside this back end's coverage
    fn compile_node(&self, graph: &Graph, node: NodeId) -> Result<Option<Arc<dyn NodeKernel>>>;
}
