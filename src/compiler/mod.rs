// Compiler Module: native code generation and the on-disk module cache

pub mod backend;
pub mod c_backend;
pub mod cache;
pub mod codegen;
pub mod cranelift_backend;

// Re-exports
pub use backend::{Backend, NodeKernel};
pub use c_backend::{CBackend, CCompiler, CModule, ModuleFailure};
pub use cache::{CacheKey, CacheStats, ModuleCache};
pub use codegen::{translation_unit, CSource, CStep, MAX_NDIM};
pub use cranelift_backend::{CraneliftBackend, JitKernel};
