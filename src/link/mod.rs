// Link Module: turn an optimized graph into something callable
//
// A linker consumes a FunctionGraph, its execution order and a storage plan,
// and yields an `Executor` that runs the graph over a `StorageMap`. Linkers
// differ only in how each node is executed.

pub mod c_linker;
pub mod dual;
pub mod opwise;
pub mod perform;
pub mod shape_check;
pub mod storage;

use crate::config::CompileConfig;
use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::NodeId;
use std::fmt;
use std::str::FromStr;

// Re-exports
pub use c_linker::CLinker;
pub use dual::DualLinker;
pub use opwise::OpWiseLinker;
pub use perform::{PerformLinker, Step, Thunk, ThunkExecutor};
pub use storage::{StorageMap, StoragePlan};

/// Runs a linked graph over one storage arena
pub trait Executor: Send + Sync {
    fn run(&self, storage: &mut StorageMap) -> Result<()>;
}

/// Build progress of a linker.
///
/// `Failed` is terminal: a linker that failed once refuses to build again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    Generating,
    Compiling,
    Built { cached: bool },
    Failed(String),
}

impl BuildState {
    pub fn is_built(&self) -> bool {
        matches!(self, BuildState::Built { .. })
    }
}

/// Strategy turning a graph into an executor
pub trait Linker {
    fn name(&self) -> &str;

    fn state(&self) -> &BuildState;

    fn link(
        &mut self,
        fgraph: &FunctionGraph,
        order: &[NodeId],
        plan: &StoragePlan,
    ) -> Result<Box<dyn Executor>>;
}

/// Linker selection by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkerKind {
    /// "py": every node through `perform`
    Perform,
    /// "py+shapes": `perform`, checking every node against `infer_shape`
    PerformCheckShapes,
    /// "c": one translation unit for the whole graph
    C,
    /// "c|py": per-node C kernels, `perform` where a node has no C code
    OpWiseC,
    /// "jit|py": per-node Cranelift kernels for elementwise nodes
    OpWiseJit,
    /// "c&py": `perform` checked against per-node C kernels
    Dual,
}

impl LinkerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LinkerKind::Perform => "py",
            LinkerKind::PerformCheckShapes => "py+shapes",
            LinkerKind::C => "c",
            LinkerKind::OpWiseC => "c|py",
            LinkerKind::OpWiseJit => "jit|py",
            LinkerKind::Dual => "c&py",
        }
    }

    /// A fresh, unbuilt linker of this kind
    pub fn make(&self, config: &CompileConfig) -> Box<dyn Linker> {
        match self {
            LinkerKind::Perform => Box::new(PerformLinker::new(config.check_infer_shape)),
            LinkerKind::PerformCheckShapes => Box::new(PerformLinker::new(true)),
            LinkerKind::C => Box::new(CLinker::from_config(config)),
            LinkerKind::OpWiseC => Box::new(OpWiseLinker::c(config)),
            LinkerKind::OpWiseJit => Box::new(OpWiseLinker::jit()),
            LinkerKind::Dual => Box::new(DualLinker::new(OpWiseLinker::c(config))),
        }
    }
}

impl fmt::Display for LinkerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LinkerKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "py" => Ok(LinkerKind::Perform),
            "py+shapes" => Ok(LinkerKind::PerformCheckShapes),
            "c" => Ok(LinkerKind::C),
            "c|py" => Ok(LinkerKind::OpWiseC),
            "jit|py" => Ok(LinkerKind::OpWiseJit),
            "c&py" => Ok(LinkerKind::Dual),
            other => Err(GraphError::InvalidValue(format!(
                "unknown linker {:?}; expected py, py+shapes, c, c|py, jit|py or c&py",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linker_names_round_trip() {
        for kind in [
            LinkerKind::Perform,
            LinkerKind::PerformCheckShapes,
            LinkerKind::C,
            LinkerKind::OpWiseC,
            LinkerKind::OpWiseJit,
            LinkerKind::Dual,
        ] {
            assert_eq!(kind.name().parse::<LinkerKind>().unwrap(), kind);
        }
        assert!(matches!(
            "cvm".parse::<LinkerKind>(),
            Err(GraphError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_fresh_linkers_are_unbuilt() {
        let config = CompileConfig::default();
        let linker = LinkerKind::C.make(&config);
        assert_eq!(linker.name(), "c");
        assert_eq!(*linker.state(), BuildState::Unbuilt);
    }
}
