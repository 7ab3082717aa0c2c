// IR Module: graph representation, runtime values and traversal

pub mod builder;
pub mod destroy;
pub mod fgraph;
pub mod graph;
pub mod node;
pub mod op;
pub mod printing;
pub mod shape;
pub mod traversal;
pub mod types;
pub mod value;

// Re-exports
pub use builder::{BuiltGraph, GraphBuilder};
pub use destroy::{view_root, DestroyHandler};
pub use fgraph::{Client, Feature, FunctionGraph};
pub use graph::{CloneOptions, Cloned, Graph};
pub use node::{Apply, GraphNode, NodeId, VarId, Variable};
pub use op::{op_as, AliasMap, CNode, Gradient, NodeSpec, Op, OpRef};
pub use printing::{as_string, debugprint};
pub use shape::{Dim, Shape};
pub use types::{ScalarType, TensorType};
pub use value::TensorValue;
