// Operations Module
//
// Concrete ops implementing the `Op` contract, with graph-building helpers.

pub mod basic;
pub mod blas;
pub mod dimshuffle;
pub mod elemwise;
pub mod reduction;
pub mod scalar;

// Re-exports
pub use basic::{assert_op, reshape, Assert, Reshape};
pub use blas::{dot, dot22, dot22scalar, gemm_inplace, gemm_no_inplace, Dot, Dot22, Dot22Scalar, Gemm};
pub use dimshuffle::{dimshuffle, transpose, DimShuffle, ShuffleDim};
pub use elemwise::{
    abs, add, cast, elemwise, exp, log, maximum, minimum, mul, neg, ones_like, second, sqrt, sub,
    true_div, zeros_like, Elemwise, ElemwiseKernel,
};
pub use reduction::{sum, Sum};
pub use scalar::{ScalarOp, ScalarProgram};
