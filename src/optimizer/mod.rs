// Optimizer Module: graph rewrites and their schedulers

pub mod blas;
pub mod canonicalize;
pub mod cse;
pub mod fusion;
pub mod inplace;
pub mod local;
pub mod pass;
pub mod profile;

// Re-exports
pub use blas::{Dot22ToDot22Scalar, DotToDot22, GemmOptimizer};
pub use canonicalize::{
    canonicalize, ConstantFolding, DimShuffleCanonicalize, FlattenAssociative, TransposeThroughDot,
};
pub use cse::MergeOptimizer;
pub use fusion::{fusion, ElemwiseFusion};
pub use inplace::{ensure_destroy_handler, ElemwiseInplace, GemmInplace, GemmInplacePass};
pub use local::{apply_local, EquilibriumRewriter, LocalRewriter, TopoRewriter};
pub use pass::{OptimizationPass, PassManager};
pub use profile::{optimizer_from_name, PROFILES};
