// Dual Linking
//
// Every node runs twice: through `perform`, which is the reference, and
// through its native kernel when one exists. Outputs that differ beyond the
// tolerance for their dtype raise `CheckerMismatch`. Only the reference
// values are stored.

use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::types::ScalarType;
use crate::ir::value::TensorValue;
use crate::link::opwise::OpWiseLinker;
use crate::link::perform::{plan_steps, Step};
use crate::link::storage::{StorageMap, StoragePlan};
use crate::link::{BuildState, Executor, Linker};
use std::sync::Arc;

/// (rtol, atol) used to compare values of `dtype`
pub fn tolerance(dtype: ScalarType) -> (f64, f64) {
    match dtype {
        ScalarType::Float32 => (1e-4, 1e-6),
        ScalarType::Float64 => (1e-5, 1e-8),
        _ => (0.0, 0.0),
    }
}

pub struct DualLinker {
    checked: OpWiseLinker,
    state: BuildState,
}

impl DualLinker {
    pub fn new(checked: OpWiseLinker) -> Self {
        DualLinker {
            checked,
            state: BuildState::Unbuilt,
        }
    }
}

impl Linker for DualLinker {
    fn name(&self) -> &str {
        "c&py"
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
        let reference = plan_steps(fgraph, order, plan)?;
        let checked = match self.checked.native_steps(fgraph, order, plan) {
            Ok(steps) => steps,
            Err(err) => {
                self.state = BuildState::Failed(err.to_string());
                return Err(err);
            }
        };
        log::debug!(
            "dual linker: checking {} of {} steps",
            checked.iter().filter(|s| s.thunk.is_native()).count(),
            checked.len()
        );
        self.state = BuildState::Built { cached: false };
        Ok(Box::new(DualExecutor {
            graph: Arc::new(fgraph.graph().clone()),
            steps: reference.into_iter().zip(checked).collect(),
        }))
    }
}

struct DualExecutor {
    graph: Arc<Graph>,
    steps: Vec<(Step, Step)>,
}

impl DualExecutor {
    fn compare(&self, step: &Step, expected: &[TensorValue], actual: &[TensorValue]) -> Result<()> {
        let outputs = &self.graph.node(step.node).outputs;
        for ((var, want), got) in outputs.iter().zip(expected).zip(actual) {
            let (rtol, atol) = tolerance(want.dtype());
            if got.dtype() == want.dtype() && got.allclose(want, rtol, atol) {
                continue;
            }
            let message = match got.max_abs_diff(want) {
                Some(diff) => format!("max abs difference {:e} (rtol {:e}, atol {:e})", diff, rtol, atol),
                None => format!(
                    "perform gives {} {:?}, native gives {} {:?}",
                    want.dtype(),
                    want.shape(),
                    got.dtype(),
                    got.shape()
                ),
            };
            return Err(GraphError::CheckerMismatch {
                node: step.node.to_string(),
                variable: self.graph.label(*var),
                message,
            });
        }
        Ok(())
    }
}

impl Executor for DualExecutor {
    fn run(&self, storage: &mut StorageMap) -> Result<()> {
        for (reference, checked) in &self.steps {
            let inputs = reference.gather(storage)?;
            let expected = reference.execute(&inputs)?;
            if checked.thunk.is_native() {
                let actual = checked.execute(&inputs).map_err(|err| GraphError::CheckerMismatch {
                    node: checked.node.to_string(),
                    variable: String::new(),
                    message: format!("perform succeeded but the native kernel failed: {}", err),
                })?;
                self.compare(checked, &expected, &actual)?;
            }
            for (cell, value) in reference.outputs.iter().zip(expected) {
                storage.set(*cell, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::backend::{Backend, NodeKernel};
    use crate::ir::types::TensorType;
    use crate::ops::elemwise;

    const F64: ScalarType = ScalarType::Float64;

    /// Negation, off by a constant
    struct Skewed(f64);

    impl NodeKernel for Skewed {
        fn run(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
            let base = inputs[0];
            let data = base.data().iter().map(|x| -x + self.0).collect();
            outputs[0] = Some(TensorValue::new(base.dtype(), base.shape().to_vec(), data)?);
            Ok(())
        }
    }

    struct SkewedBackend(f64);

    impl Backend for SkewedBackend {
        fn name(&self) -> &str {
            "skewed"
        }

        fn compile_node(
            &self,
            _graph: &Graph,
            _node: NodeId,
        ) -> Result<Option<Arc<dyn NodeKernel>>> {
            Ok(Some(Arc::new(Skewed(self.0))))
        }
    }

    fn run_with(skew: f64) -> Result<()> {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let out = elemwise::neg(&mut g, x)?;
        let fg = FunctionGraph::new(g, vec![x], vec![out])?;
        let order = fg.toposort()?;
        let plan = StoragePlan::new(&fg, &order)?;
        let checked = OpWiseLinker::new("skewed|py", vec![Box::new(SkewedBackend(skew))]);
        let exec = DualLinker::new(checked).link(&fg, &order, &plan)?;
        let mut storage = plan.new_storage();
        storage.set(plan.input_cells()[0], TensorValue::vector(F64, vec![1.0, 2.0]));
        exec.run(&mut storage)
    }

    #[test]
    fn test_agreeing_kernels_pass() {
        assert!(run_with(0.0).is_ok());
        assert!(run_with(1e-12).is_ok());
    }

    #[test]
    fn test_disagreement_is_a_checker_mismatch() {
        match run_with(1e-3) {
            Err(GraphError::CheckerMismatch { variable, .. }) => assert!(!variable.is_empty()),
            other => panic!("expected a checker mismatch, got {:?}", other),
        }
    }
}
