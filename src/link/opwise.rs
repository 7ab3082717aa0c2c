// Op-wise Linking
//
// Each node is offered to the configured back ends in turn; the first one
// that compiles it supplies a native kernel. Nodes no back end covers run
// through `perform`. A back end that cannot run on this host is skipped
// entirely, while a node it covers but fails to compile is an error.

use crate::compiler::backend::Backend;
use crate::compiler::c_backend::CBackend;
use crate::compiler::cranelift_backend::CraneliftBackend;
use crate::config::CompileConfig;
use crate::core::error::Result;
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::NodeId;
use crate::link::perform::{plan_steps, Step, Thunk, ThunkExecutor};
use crate::link::storage::StoragePlan;
use crate::link::{BuildState, Executor, Linker};
use std::sync::Arc;

pub struct OpWiseLinker {
    name: String,
    backends: Vec<Box<dyn Backend>>,
    check_shapes: bool,
    state: BuildState,
}

impl OpWiseLinker {
    pub fn new(name: impl Into<String>, backends: Vec<Box<dyn Backend>>) -> Self {
        OpWiseLinker {
            name: name.into(),
            backends,
            check_shapes: false,
            state: BuildState::Unbuilt,
        }
    }

    /// Per-node C kernels through the shared module cache
    pub fn c(config: &CompileConfig) -> Self {
        OpWiseLinker::new("c|py", vec![Box::new(CBackend::from_config(config))])
            .with_shape_checks(config.check_infer_shape)
    }

    /// Cranelift kernels for elementwise nodes
    pub fn jit() -> Self {
        OpWiseLinker::new("jit|py", vec![Box::new(CraneliftBackend::new())])
    }

    pub fn with_shape_checks(mut self, check_shapes: bool) -> Self {
        self.check_shapes = check_shapes;
        self
    }

    /// Steps with native thunks wherever a back end covers the node
    pub fn native_steps(
        &self,
        fgraph: &FunctionGraph,
        order: &[NodeId],
        plan: &StoragePlan,
    ) -> Result<Vec<Step>> {
        let backends: Vec<&dyn Backend> = self
            .backends
            .iter()
            .map(|b| b.as_ref())
            .filter(|b| {
                let available = b.is_available();
                if !available {
                    log::warn!("{} back end unavailable, its nodes run through perform", b.name());
                }
                available
            })
            .collect();

        let mut steps = plan_steps(fgraph, order, plan)?;
        for step in steps.iter_mut() {
            for backend in &backends {
                if let Some(kernel) = backend.compile_node(fgraph.graph(), step.node)? {
                    log::trace!("node {} ({}): {} kernel", step.node, step.name, backend.name());
                    step.thunk = Thunk::Native(kernel);
                    break;
                }
            }
        }
        Ok(steps)
    }
}

impl Linker for OpWiseLinker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &BuildState {
        &self.state
    }

    fn link(
        &mut self,
        fgraph: &FunctionGraph,
        order: &[NodeId],
        plan: &StoragePlan,
    ) -> Result<Box<dyn Executor>> {
        self.state = BuildState::Compiling;
        let steps = match self.native_steps(fgraph, order, plan) {
            Ok(steps) => steps,
            Err(err) => {
                self.state = BuildState::Failed(err.to_string());
                return Err(err);
            }
        };
        let executor = ThunkExecutor::new(
            Arc::new(fgraph.graph().clone()),
            steps,
            self.check_shapes,
        );
        log::debug!(
            "{} linker: {} of {} steps native",
            self.name,
            executor.native_steps(),
            executor.steps().len()
        );
        self.state = BuildState::Built { cached: false };
        Ok(Box::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::Graph;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ir::value::TensorValue;
    use crate::ops::{elemwise, reduction};

    const F64: ScalarType = ScalarType::Float64;

    #[test]
    fn test_jit_covers_elemwise_and_falls_back_for_the_rest() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let y = g.input("y", TensorType::vector(F64));
        let s = elemwise::add(&mut g, &[x, y]).unwrap();
        let e = elemwise::exp(&mut g, s).unwrap();
        let total = reduction::sum(&mut g, e, None).unwrap();
        let fg = FunctionGraph::new(g, vec![x, y], vec![total]).unwrap();
        let order = fg.toposort().unwrap();
        let plan = StoragePlan::new(&fg, &order).unwrap();

        let linker = OpWiseLinker::jit();
        let steps = linker.native_steps(&fg, &order, &plan).unwrap();
        let native: Vec<bool> = steps.iter().map(|s| s.thunk.is_native()).collect();
        assert_eq!(native, vec![true, true, false]);

        let mut linker = linker;
        let exec = linker.link(&fg, &order, &plan).unwrap();
        assert!(linker.state().is_built());
        let mut storage = plan.new_storage();
        storage.set(plan.input_cells()[0], TensorValue::vector(F64, vec![0.0, 1.0]));
        storage.set(plan.input_cells()[1], TensorValue::vector(F64, vec![0.0, -1.0]));
        exec.run(&mut storage).unwrap();
        let total = storage.get(plan.output_cells()[0]).unwrap().as_scalar().unwrap();
        assert!((total - 2.0).abs() < 1e-12);
    }
}
