// Named Optimization Profiles
//
// Each profile is an explicit, ordered list of rewrite groups:
// canonicalization, then specialization (BLAS selection), then fusion, then
// in-place assignment. Nothing is registered globally; a profile is built
// fresh for every compilation.

use crate::config::CompileConfig;
use crate::core::error::{GraphError, Result};
use crate::optimizer::blas::{Dot22ToDot22Scalar, DotToDot22, GemmOptimizer};
use crate::optimizer::canonicalize::canonicalize;
use crate::optimizer::cse::MergeOptimizer;
use crate::optimizer::fusion::fusion;
use crate::optimizer::inplace::{ElemwiseInplace, GemmInplacePass};
use crate::optimizer::local::TopoRewriter;
use crate::optimizer::pass::PassManager;
use std::sync::Arc;

/// Names accepted by `optimizer_from_name`
pub const PROFILES: &[&str] = &["none", "fast_compile", "fast_run", "canonicalize"];

/// BLAS selection: dot to Dot22, gemm fusion, then scaled products
pub fn specialize() -> PassManager {
    PassManager::new("specialize")
        .with_pass(Box::new(TopoRewriter::new(
            "dot_to_dot22",
            vec![Arc::new(DotToDot22)],
        )))
        .with_pass(Box::new(GemmOptimizer::new()))
        .with_pass(Box::new(TopoRewriter::new(
            "dot22_to_dot22scalar",
            vec![Arc::new(Dot22ToDot22Scalar)],
        )))
}

/// In-place assignment, gemm first
pub fn inplace() -> PassManager {
    PassManager::new("inplace")
        .with_pass(Box::new(GemmInplacePass))
        .with_pass(Box::new(ElemwiseInplace))
}

/// Build the rewrite pipeline of a named profile
pub fn optimizer_from_name(name: &str, config: &CompileConfig) -> Result<PassManager> {
    let cap = config.max_iterations;
    let manager = match name {
        "none" => PassManager::new("none"),
        "fast_compile" => PassManager::new("fast_compile")
            .with_pass(Box::new(MergeOptimizer::new()))
            .with_pass(Box::new(canonicalize(cap))),
        "fast_run" => PassManager::new("fast_run")
            .with_pass(Box::new(MergeOptimizer::new()))
            .with_pass(Box::new(canonicalize(cap)))
            .with_pass(Box::new(specialize()))
            .with_pass(Box::new(fusion(cap)))
            .with_pass(Box::new(MergeOptimizer::new()))
            .with_pass(Box::new(inplace())),
        "canonicalize" => PassManager::new("canonicalize").with_pass(Box::new(canonicalize(cap))),
        other => {
            return Err(GraphError::InvalidValue(format!(
                "unknown optimization profile {:?}; expected one of {:?}",
                other, PROFILES
            )))
        }
    };
    log::debug!("profile {}: {:?}", name, manager.pass_names());
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_resolve() {
        let config = CompileConfig::default();
        for name in PROFILES {
            assert!(optimizer_from_name(name, &config).is_ok(), "{}", name);
        }
        assert!(optimizer_from_name("none", &config).unwrap().is_empty());
        assert_eq!(
            optimizer_from_name("fast_run", &config).unwrap().pass_names(),
            vec!["merge", "canonicalize", "specialize", "fusion", "merge", "inplace"]
        );
        assert!(matches!(
            optimizer_from_name("o3", &config),
            Err(GraphError::InvalidValue(_))
        ));
    }
}
