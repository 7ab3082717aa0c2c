// Whole-graph C Linking
//
// Every node's fragment goes into one translation unit, compiled once and
// cached on disk. A call stages its cells, allocates each output at the shape
// `infer_shape` gives for the actual inputs, then runs the module. When step
// k fails, only the outputs of steps before k are written back; the failing
// node and everything after it leave storage as it was.

use crate::compiler::c_backend::{concrete_output_shapes, CCompiler, CModule};
use crate::compiler::cache::{CacheKey, ModuleCache};
use crate::compiler::codegen::{translation_unit, CStep};
use crate::config::CompileConfig;
use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::value::TensorValue;
use crate::link::storage::{StorageMap, StoragePlan};
use crate::link::{BuildState, Executor, Linker};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct CLinker {
    compiler: CCompiler,
    cache: Arc<ModuleCache>,
    state: BuildState,
}

impl CLinker {
    pub fn new(compiler: CCompiler, cache: Arc<ModuleCache>) -> Self {
        CLinker {
            compiler,
            cache,
            state: BuildState::Unbuilt,
        }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        CLinker::new(
            CCompiler::from_config(config),
            ModuleCache::shared(&config.compiledir),
        )
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    fn build(
        &mut self,
        fgraph: &FunctionGraph,
        order: &[NodeId],
        plan: &StoragePlan,
    ) -> Result<CExecutor> {
        let graph = fgraph.graph();
        self.state = BuildState::Generating;
        let steps = order
            .iter()
            .map(|node| {
                let apply = graph.node(*node);
                Ok(CStep {
                    node: *node,
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
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let source = translation_unit(graph, &steps, plan.n_cells())?;

        self.state = BuildState::Compiling;
        let key = CacheKey::new(&source, &self.compiler)?;
        let (module, cached) = self.cache.get_or_compile(&key, &source, &self.compiler)?;
        log::debug!(
            "c linker: module {} for {} steps ({})",
            key,
            steps.len(),
            if cached { "cached" } else { "fresh" }
        );
        self.state = BuildState::Built { cached };
        Ok(CExecutor {
            module,
            names: steps.iter().map(|s| graph.op(s.node).name()).collect(),
            graph: Arc::new(graph.clone()),
            steps,
            n_cells: plan.n_cells(),
        })
    }
}

impl Linker for CLinker {
    fn name(&self) -> &str {
        "c"
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
        if let BuildState::Failed(reason) = &self.state {
            return Err(GraphError::Compile(format!(
                "this linker already failed to build: {}",
                reason
            )));
        }
        match self.build(fgraph, order, plan) {
            Ok(executor) => Ok(Box::new(executor)),
            Err(err) => {
                log::debug!("c linker: build failed: {}", err);
                self.state = BuildState::Failed(err.to_string());
                Err(err)
            }
        }
    }
}

struct CExecutor {
    module: Arc<CModule>,
    graph: Arc<Graph>,
    steps: Vec<CStep>,
    names: Vec<String>,
    n_cells: usize,
}

impl CExecutor {
    /// Input and constant cells from storage, outputs allocated at their
    /// inferred shapes
    fn stage(&self, storage: &StorageMap) -> Result<Vec<TensorValue>> {
        let mut cells: Vec<Option<TensorValue>> =
            (0..self.n_cells).map(|c| storage.get(c).cloned()).collect();
        for (k, step) in self.steps.iter().enumerate() {
            let located = |err: GraphError| err.at_node(step.node, &self.names[k]);
            let shapes: Vec<Vec<usize>> = step
                .inputs
                .iter()
                .map(|c| {
                    cells[*c]
                        .as_ref()
                        .map(|v| v.shape().to_vec())
                        .ok_or_else(|| GraphError::MissingInput(format!("storage cell {} is empty", c)))
                })
                .collect::<Result<_>>()
                .map_err(located)?;
            let shape_refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
            let out_shapes =
                concrete_output_shapes(&self.graph, step.node, &shape_refs).map_err(located)?;

            let outputs = &self.graph.node(step.node).outputs;
            for (j, cell) in step.outputs.iter().enumerate() {
                if let Some(i) = step.inputs.iter().position(|c| c == cell) {
                    // destroyed input: the output is written over it
                    if shapes[i] != out_shapes[j] {
                        return Err(located(GraphError::DimensionMismatch(format!(
                            "in-place output {} of shape {:?} cannot reuse its input",
                            j, out_shapes[j]
                        ))));
                    }
                    continue;
                }
                let dtype = self.graph.ty(outputs[j]).dtype;
                cells[*cell] = Some(TensorValue::zeros(dtype, out_shapes[j].clone()));
            }
        }
        cells
            .into_iter()
            .enumerate()
            .map(|(c, v)| {
                v.ok_or_else(|| GraphError::MissingInput(format!("storage cell {} is empty", c)))
            })
            .collect()
    }

    /// Write back the outputs of the first `upto` steps
    fn commit(&self, cells: Vec<TensorValue>, upto: usize, storage: &mut StorageMap) {
        let written = committed_cells(&self.steps, upto);
        for (c, value) in cells.into_iter().enumerate() {
            if written.contains(&c) {
                storage.set(c, value);
            }
        }
    }
}

/// Cells written by the first `upto` steps, minus any cell step `upto`
/// overwrites in place: a failing destroyer may have half written it.
fn committed_cells(steps: &[CStep], upto: usize) -> BTreeSet<usize> {
    let torn: BTreeSet<usize> = steps.get(upto).map_or_else(BTreeSet::new, |step| {
        step.outputs
            .iter()
            .filter(|c| step.inputs.contains(*c))
            .copied()
            .collect()
    });
    steps[..upto.min(steps.len())]
        .iter()
        .flat_map(|s| s.outputs.iter().copied())
        .filter(|c| !torn.contains(c))
        .collect()
}

impl Executor for CExecutor {
    fn run(&self, storage: &mut StorageMap) -> Result<()> {
        let mut cells = self.stage(storage)?;
        match self.module.run(&mut cells) {
            Ok(()) => {
                self.commit(cells, self.steps.len(), storage);
                Ok(())
            }
            Err(failure) => match failure.step.filter(|k| *k < self.steps.len()) {
                Some(k) => {
                    log::debug!("c module failed at step {} ({})", k, self.names[k]);
                    self.commit(cells, k, storage);
                    Err(GraphError::Runtime {
                        node: self.steps[k].node.to_string(),
                        op: self.names[k].clone(),
                        message: failure.message,
                    })
                }
                None => Err(GraphError::InvalidValue(failure.message)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::elemwise;

    #[test]
    fn test_cell_destroyed_by_the_failing_step_is_not_committed() {
        // step 0: cell 0 -> cell 2; step 1: cell 0 -> cell 3;
        // step 2 overwrites cell 2 in place with cell 1
        let steps = vec![
            CStep {
                node: NodeId(0),
                inputs: vec![0],
                outputs: vec![2],
            },
            CStep {
                node: NodeId(1),
                inputs: vec![0],
                outputs: vec![3],
            },
            CStep {
                node: NodeId(2),
                inputs: vec![2, 1],
                outputs: vec![2],
            },
        ];
        assert_eq!(committed_cells(&steps, 2), BTreeSet::from([3]));
        assert_eq!(committed_cells(&steps, 1), BTreeSet::from([2]));
        assert_eq!(committed_cells(&steps, 3), BTreeSet::from([2, 3]));
        assert!(committed_cells(&steps, 0).is_empty());
    }

    #[test]
    fn test_failed_build_is_terminal() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        let out = elemwise::exp(&mut g, x).unwrap();
        let fg = FunctionGraph::new(g, vec![x], vec![out]).unwrap();
        let order = fg.toposort().unwrap();
        let plan = StoragePlan::new(&fg, &order).unwrap();

        let dir = std::env::temp_dir().join("symgraph_c_linker_unit");
        let compiler = CCompiler::new("symgraph-no-such-cc", Vec::new());
        let mut linker = CLinker::new(compiler, Arc::new(ModuleCache::new(dir)));
        assert!(linker.link(&fg, &order, &plan).is_err());
        assert!(matches!(linker.state(), BuildState::Failed(_)));

        let again = linker.link(&fg, &order, &plan).err();
        assert!(matches!(again, Some(GraphError::Compile(msg)) if msg.contains("already failed")));
    }
}
