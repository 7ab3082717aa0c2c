// Compiled Functions
//
// `function` is the compile entry point: it checks the declared inputs,
// wraps the graph in a FunctionGraph guarded by a DestroyHandler, runs the
// mode's rewrite profile, orders and plans storage, and links. The result is
// called with positional values and returns the outputs in order.

use crate::config::CompileConfig;
use crate::core::error::{GraphError, Result};
use crate::ir::destroy::DestroyHandler;
use crate::ir::fgraph::FunctionGraph;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::printing::as_string;
use crate::ir::traversal::ancestors;
use crate::ir::types::TensorType;
use crate::ir::value::TensorValue;
use crate::link::storage::{StorageMap, StoragePlan};
use crate::link::{BuildState, Executor, LinkerKind};
use crate::optimizer::profile::optimizer_from_name;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A declared function input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct In {
    pub variable: VarId,
    /// The compiled function may overwrite this input's storage
    pub mutable: bool,
    pub name: Option<String>,
}

impl In {
    pub fn new(variable: VarId) -> Self {
        In {
            variable,
            mutable: false,
            name: None,
        }
    }

    pub fn mutable(variable: VarId) -> Self {
        In {
            mutable: true,
            ..In::new(variable)
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

impl From<VarId> for In {
    fn from(variable: VarId) -> Self {
        In::new(variable)
    }
}

/// What to do with an input no output depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnusedInputPolicy {
    #[default]
    Raise,
    Warn,
    Ignore,
}

impl FromStr for UnusedInputPolicy {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "raise" => Ok(UnusedInputPolicy::Raise),
            "warn" => Ok(UnusedInputPolicy::Warn),
            "ignore" => Ok(UnusedInputPolicy::Ignore),
            other => Err(GraphError::InvalidValue(format!(
                "on_unused_input must be raise, warn or ignore, got {:?}",
                other
            ))),
        }
    }
}

/// Rewrite profile plus linker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    pub optimizer: String,
    pub linker: LinkerKind,
}

impl Mode {
    pub fn new(optimizer: &str, linker: LinkerKind) -> Self {
        Mode {
            optimizer: optimizer.to_string(),
            linker,
        }
    }

    /// Every rewrite, native kernels where available
    pub fn fast_run() -> Self {
        Mode::new("fast_run", LinkerKind::OpWiseC)
    }

    /// Cheap rewrites, interpreted
    pub fn fast_compile() -> Self {
        Mode::new("fast_compile", LinkerKind::Perform)
    }

    /// Every rewrite, interpreted and checked against native kernels
    pub fn debug() -> Self {
        Mode::new("fast_run", LinkerKind::Dual)
    }

    /// Resolve `fast_run`, `fast_compile` or `debug`
    pub fn named(name: &str) -> Result<Self> {
        match name.trim() {
            "fast_run" => Ok(Mode::fast_run()),
            "fast_compile" => Ok(Mode::fast_compile()),
            "debug" => Ok(Mode::debug()),
            other => Err(GraphError::InvalidValue(format!(
                "unknown mode {:?}; expected fast_run, fast_compile or debug",
                other
            ))),
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::fast_run()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.optimizer, self.linker)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
    pub mode: Mode,
    pub on_unused_input: UnusedInputPolicy,
    /// Let call arguments be cast to a narrower input dtype
    pub allow_input_downcast: bool,
    pub config: CompileConfig,
}

impl FunctionOptions {
    /// Options whose mode and config come from the environment
    pub fn from_env() -> Result<Self> {
        let config = CompileConfig::from_env();
        Ok(FunctionOptions {
            mode: Mode::named(&config.mode)?,
            config,
            ..FunctionOptions::default()
        })
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_unused_input(mut self, policy: UnusedInputPolicy) -> Self {
        self.on_unused_input = policy;
        self
    }
}

/// A compiled, callable graph
pub struct Function {
    graph: Graph,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    input_types: Vec<TensorType>,
    order: Vec<NodeId>,
    plan: StoragePlan,
    executor: Box<dyn Executor>,
    build_state: BuildState,
    allow_input_downcast: bool,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Function")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("nodes", &self.order.len())
            .field("build_state", &self.build_state)
            .finish()
    }
}

/// Compile `outputs` as a function of `inputs`
pub fn function(
    graph: &Graph,
    inputs: &[In],
    outputs: &[VarId],
    options: &FunctionOptions,
) -> Result<Function> {
    let input_vars: Vec<VarId> = inputs.iter().map(|i| i.variable).collect();
    check_unused_inputs(graph, &input_vars, outputs, options.on_unused_input)?;

    let mut working = graph.clone();
    for input in inputs {
        if let Some(name) = &input.name {
            working.set_name(input.variable, name);
        }
    }
    let mut fgraph = FunctionGraph::new(working, input_vars.clone(), outputs.to_vec())?;
    let mutable: Vec<VarId> = inputs
        .iter()
        .filter(|i| i.mutable)
        .map(|i| i.variable)
        .collect();
    fgraph.attach_feature(Box::new(DestroyHandler::new(mutable)))?;

    let optimizer = optimizer_from_name(&options.mode.optimizer, &options.config)?;
    let changed = optimizer.run_all(&mut fgraph)?;
    log::debug!(
        "mode {}: rewriting {} the graph, {} nodes remain",
        options.mode,
        if changed { "changed" } else { "kept" },
        fgraph.num_nodes()
    );

    let order = fgraph.toposort()?;
    let plan = StoragePlan::new(&fgraph, &order)?;
    let mut linker = options.mode.linker.make(&options.config);
    let executor = linker.link(&fgraph, &order, &plan)?;
    let build_state = linker.state().clone();

    let input_types = input_vars.iter().map(|v| fgraph.graph().ty(*v).clone()).collect();
    Ok(Function {
        graph: fgraph.graph().clone(),
        inputs: fgraph.inputs().to_vec(),
        outputs: fgraph.outputs().to_vec(),
        input_types,
        order,
        plan,
        executor,
        build_state,
        allow_input_downcast: options.allow_input_downcast,
    })
}

fn check_unused_inputs(
    graph: &Graph,
    inputs: &[VarId],
    outputs: &[VarId],
    policy: UnusedInputPolicy,
) -> Result<()> {
    if policy == UnusedInputPolicy::Ignore {
        return Ok(());
    }
    let used: HashSet<VarId> = ancestors(graph, outputs, inputs).collect();
    for (position, input) in inputs.iter().enumerate() {
        if used.contains(input) {
            continue;
        }
        let message = format!(
            "input {} ({}) is not used to compute any output",
            position,
            graph.label(*input)
        );
        match policy {
            UnusedInputPolicy::Raise => return Err(GraphError::UnusedInput(message)),
            UnusedInputPolicy::Warn => log::warn!("{}", message),
            UnusedInputPolicy::Ignore => {}
        }
    }
    Ok(())
}

impl Function {
    /// Run with a fresh storage arena
    pub fn call(&self, args: &[TensorValue]) -> Result<Vec<TensorValue>> {
        let mut storage = self.new_storage();
        self.call_with_storage(&mut storage, args)
    }

    /// Run over a caller-owned arena.
    ///
    /// Mutable inputs overwritten by in-place ops keep their new values in
    /// `storage`; values stay put when a call fails partway.
    pub fn call_with_storage(&self, storage: &mut StorageMap, args: &[TensorValue]) -> Result<Vec<TensorValue>> {
        if args.len() != self.inputs.len() {
            return Err(GraphError::InvalidValue(format!(
                "expected {} arguments, got {}",
                self.inputs.len(),
                args.len()
            )));
        }
        for (position, ((arg, ty), cell)) in args
            .iter()
            .zip(&self.input_types)
            .zip(self.plan.input_cells())
            .enumerate()
        {
            let value = ty
                .filter(arg.clone(), self.allow_input_downcast)
                .map_err(|err| match err {
                    GraphError::TypeMismatch(msg) => {
                        GraphError::TypeMismatch(format!("argument {}: {}", position, msg))
                    }
                    other => other,
                })?;
            storage.set(*cell, value);
        }
        self.executor.run(storage)?;
        self.read_outputs(storage)
    }

    /// Output values currently held by `storage`
    pub fn read_outputs(&self, storage: &StorageMap) -> Result<Vec<TensorValue>> {
        self.plan
            .output_cells()
            .iter()
            .map(|cell| storage.read(*cell).cloned())
            .collect()
    }

    /// Storage with constants filled in, for `call_with_storage`
    pub fn new_storage(&self) -> StorageMap {
        self.plan.new_storage()
    }

    /// The optimized graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// Execution order of the optimized graph
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn plan(&self) -> &StoragePlan {
        &self.plan
    }

    pub fn build_state(&self) -> &BuildState {
        &self.build_state
    }

    /// Names of the ops in execution order
    pub fn op_names(&self) -> Vec<String> {
        self.order.iter().map(|n| self.graph.op(*n).name()).collect()
    }

    /// The optimized outputs as expressions
    pub fn as_strings(&self) -> Vec<String> {
        as_string(&self.graph, &self.inputs, &self.outputs)
    }
}
