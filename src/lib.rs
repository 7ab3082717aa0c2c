// symgraph: symbolic dataflow-graph compiler
//
// Graphs of typed variables and operation nodes are rewritten into faster
// equivalent graphs and linked into callable functions, either interpreted
// node by node or compiled to native code.
//
// Architecture:
// - core: crate-wide error type
// - ir: graph IR, runtime values, traversal, FunctionGraph, destroy handling
// - ops: concrete operations implementing the `Op` contract
// - optimizer: local and global rewrites, equilibrium driver, named profiles
// - compiler: C code generation, module cache, Cranelift JIT
// - link: storage planning and linkers
// - function: the compile entry point
// - gradient: reverse-mode symbolic differentiation

pub mod config;
pub mod core;
pub mod function;
pub mod gradient;

// Graph compilation infrastructure
pub mod compiler;
pub mod ir;
pub mod link;
pub mod ops;
pub mod optimizer;

// Re-export commonly used items for convenience
pub use crate::core::{GraphError, Result};
pub use config::CompileConfig;
pub use function::{function, Function, FunctionOptions, In, Mode, UnusedInputPolicy};
pub use gradient::grad;
pub use ir::{FunctionGraph, Graph, NodeId, ScalarType, TensorType, TensorValue, VarId};
pub use link::{LinkerKind, StorageMap};
