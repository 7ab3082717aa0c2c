// Optimization Pass Infrastructure

use crate::core::error::Result;
use crate::ir::fgraph::FunctionGraph;

/// Global rewrite over a whole function graph
pub trait OptimizationPass: Send + Sync {
    /// Run the pass on a graph.
    /// Returns true if the graph was modified
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool>;

    /// Get pass name
    fn name(&self) -> &str;
}

/// Pass manager running passes in registration order
pub struct PassManager {
    name: String,
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl PassManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passes: Vec::new(),
        }
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    /// Builder-style `add_pass`
    pub fn with_pass(mut self, pass: Box<dyn OptimizationPass>) -> Self {
        self.add_pass(pass);
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run_all(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        let mut any = false;
        for pass in &self.passes {
            log::debug!("Running optimization pass: {}", pass.name());
            let changed = pass.apply(fgraph)?;
            if changed {
                log::debug!("Pass '{}' modified the graph", pass.name());
            } else {
                log::trace!("Pass '{}' made no changes", pass.name());
            }
            any |= changed;
        }
        Ok(any)
    }
}

impl OptimizationPass for PassManager {
    fn apply(&self, fgraph: &mut FunctionGraph) -> Result<bool> {
        self.run_all(fgraph)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new("passes")
    }
}
