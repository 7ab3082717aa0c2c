// IR Node Types
//
// Variables and Apply nodes of the bipartite dataflow graph. Both live in a
// `Graph` arena and refer to each other by index.

use crate::ir::op::OpRef;
use crate::ir::types::TensorType;
use crate::ir::value::TensorValue;
use std::fmt;
use std::sync::Arc;

/// Identifier of a variable in a graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Identifier of an Apply node in a graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A typed value slot.
///
/// `owner` is the Apply producing it (None for graph inputs and constants);
/// when set, `index` is the position in the owner's outputs. Constants carry
/// their immutable value.
#[derive(Debug, Clone)]
pub struct Variable {
    pub ty: TensorType,
    pub name: Option<String>,
    pub owner: Option<NodeId>,
    pub index: usize,
    pub value: Option<Arc<TensorValue>>,
}

impl Variable {
    pub fn is_constant(&self) -> bool {
        self.value.is_some()
    }
}

/// Application of an op to input variables, producing output variables
#[derive(Debug, Clone)]
pub struct Apply {
    pub op: OpRef,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
}

/// A vertex of the bipartite graph, used by the generic traversals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphNode {
    Var(VarId),
    Apply(NodeId),
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphNode::Var(v) => write!(f, "{}", v),
            GraphNode::Apply(n) => write!(f, "{}", n),
        }
    }
}
