// Thunk Execution
//
// One step per node in execution order. A step reads its input cells, runs
// either the op's `perform` or a native kernel, type-checks what came back
// and only then writes its output cells. A failing step therefore leaves its
// own outputs and everything downstream untouched.

use crate::compiler::backend::NodeKernel;
use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::op::OpRef;
use crate::ir::types::TensorType;
use crate::ir::value::TensorValue;
use crate::link::shape_check::verify_shapes;
use crate::link::storage::{StorageMap, StoragePlan};
use crate::link::{BuildState, Executor, Linker};
use std::sync::Arc;

/// How a step computes its outputs
#[derive(Clone)]
pub enum Thunk {
    Perform,
    Native(Arc<dyn NodeKernel>),
}

impl Thunk {
    pub fn is_native(&self) -> bool {
        matches!(self, Thunk::Native(_))
    }
}

/// One node bound to its storage cells
#[derive(Clone)]
pub struct Step {
    pub node: NodeId,
    pub name: String,
    pub op: OpRef,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub input_types: Vec<TensorType>,
    pub output_types: Vec<TensorType>,
    pub thunk: Thunk,
}

impl Step {
    /// Run this step on already gathered inputs
    pub fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        self.compute(inputs)
            .map_err(|err| err.at_node(self.node, &self.name))
    }

    fn compute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        self.op.check_inputs(&self.input_types, inputs)?;
        let mut outputs: Vec<Option<TensorValue>> = vec![None; self.outputs.len()];
        match &self.thunk {
            Thunk::Perform => self.op.perform(inputs, &mut outputs)?,
            Thunk::Native(kernel) => kernel.run(inputs, &mut outputs)?,
        }
        outputs
            .into_iter()
            .zip(&self.output_types)
            .enumerate()
            .map(|(k, (value, ty))| {
                let value = value.ok_or_else(|| {
                    GraphError::InvalidValue(format!("output {} was not computed", k))
                })?;
                value.check_type(ty)?;
                Ok(value)
            })
            .collect()
    }

    /// Borrow this step's inputs out of `storage`
    pub fn gather<'s>(&self, storage: &'s StorageMap) -> Result<Vec<&'s TensorValue>> {
        self.inputs
            .iter()
            .map(|cell| storage.read(*cell))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| err.at_node(self.node, &self.name))
    }
}

/// Interpreted steps for every node of `order`
pub fn plan_steps(fgraph: &FunctionGraph, order: &[NodeId], plan: &StoragePlan) -> Result<Vec<Step>> {
    let graph = fgraph.graph();
    order
        .iter()
        .map(|node| {
            let apply = graph.node(*node);
            Ok(Step {
                node: *node,
                name: apply.op.name(),
                op: apply.op.clone(),
                inputs: apply
                    .inputs
                    .iter()
                    .map(|v| plan.cell(*v))
                    .collect::<Result<_>>()?,
                outputs: apply
                    .outputs
                    .iter()
                    .map(|v| plan.cell(*v))
                    .collect::<Result<_>>()?,
                input_types: apply.inputs.iter().map(|v| graph.ty(*v).clone()).collect(),
                output_types: apply.outputs.iter().map(|v| graph.ty(*v).clone()).collect(),
                thunk: Thunk::Perform,
            })
        })
        .collect()
}

/// Runs steps one after another
pub struct ThunkExecutor {
    graph: Arc<Graph>,
    steps: Vec<Step>,
    check_shapes: bool,
}

impl ThunkExecutor {
    pub fn new(graph: Arc<Graph>, steps: Vec<Step>, check_shapes: bool) -> Self {
        ThunkExecutor {
            graph,
            steps,
            check_shapes,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps running a native kernel
    pub fn native_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.thunk.is_native()).count()
    }
}

impl Executor for ThunkExecutor {
    fn run(&self, storage: &mut StorageMap) -> Result<()> {
        for step in &self.steps {
            let inputs = step.gather(storage)?;
            let values = step.execute(&inputs)?;
            if self.check_shapes {
                verify_shapes(&self.graph, step.node, &inputs, &values)?;
            }
            for (cell, value) in step.outputs.iter().zip(values) {
                storage.set(*cell, value);
            }
        }
        Ok(())
    }
}

/// Every node through `Op::perform`
#[derive(Debug)]
pub struct PerformLinker {
    check_shapes: bool,
    state: BuildState,
}

impl PerformLinker {
    pub fn new(check_shapes: bool) -> Self {
        PerformLinker {
            check_shapes,
            state: BuildState::Unbuilt,
        }
    }
}

impl Default for PerformLinker {
    fn default() -> Self {
        PerformLinker::new(false)
    }
}

impl Linker for PerformLinker {
    fn name(&self) -> &str {
        if self.check_shapes {
            "py+shapes"
        } else {
            "py"
        }
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
        let steps = plan_steps(fgraph, order, plan)?;
        log::debug!("{} linker: {} steps", self.name(), steps.len());
        self.state = BuildState::Built { cached: false };
        Ok(Box::new(ThunkExecutor::new(
            Arc::new(fgraph.graph().clone()),
            steps,
            self.check_shapes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::ScalarType;
    use crate::ops::{basic, elemwise};

    const F64: ScalarType = ScalarType::Float64;

    fn link(fg: &FunctionGraph) -> (Box<dyn Executor>, StoragePlan) {
        let order = fg.toposort().unwrap();
        let plan = StoragePlan::new(fg, &order).unwrap();
        let exec = PerformLinker::default().link(fg, &order, &plan).unwrap();
        (exec, plan)
    }

    #[test]
    fn test_runs_in_order() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let y = g.input("y", TensorType::vector(F64));
        let s = elemwise::add(&mut g, &[x, y]).unwrap();
        let out = elemwise::mul(&mut g, &[s, x]).unwrap();
        let fg = FunctionGraph::new(g, vec![x, y], vec![out]).unwrap();
        let (exec, plan) = link(&fg);

        let mut storage = plan.new_storage();
        storage.set(plan.input_cells()[0], TensorValue::vector(F64, vec![1.0, 2.0]));
        storage.set(plan.input_cells()[1], TensorValue::vector(F64, vec![3.0, 4.0]));
        exec.run(&mut storage).unwrap();
        let result = storage.get(plan.output_cells()[0]).unwrap();
        assert_eq!(result.data(), &[4.0, 12.0]);
    }

    #[test]
    fn test_failing_node_leaves_downstream_untouched() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let cond = g.input("cond", TensorType::scalar(F64));
        let e = elemwise::exp(&mut g, x).unwrap();
        let checked = basic::assert_op(&mut g, e, &[cond], "cond").unwrap();
        let out = elemwise::neg(&mut g, checked).unwrap();
        let fg = FunctionGraph::new(g, vec![x, cond], vec![e, out]).unwrap();
        let (exec, plan) = link(&fg);

        let mut storage = plan.new_storage();
        storage.set(plan.input_cells()[0], TensorValue::vector(F64, vec![0.0]));
        storage.set(plan.input_cells()[1], TensorValue::scalar(F64, 0.0));
        let err = exec.run(&mut storage).unwrap_err();
        match err {
            GraphError::Runtime { op, .. } => assert!(op.starts_with("Assert"), "{}", op),
            other => panic!("expected a runtime error, got {:?}", other),
        }
        assert_eq!(storage.get(plan.output_cells()[0]).unwrap().data(), &[1.0]);
        assert!(storage.get(plan.output_cells()[1]).is_none());
    }

    #[test]
    fn test_missing_input_is_reported_at_the_reading_node() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(F64));
        let out = elemwise::neg(&mut g, x).unwrap();
        let fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();
        let (exec, plan) = link(&fg);
        let mut storage = plan.new_storage();
        let err = exec.run(&mut storage).unwrap_err();
        assert!(matches!(err, GraphError::Runtime { .. }));
    }
}
