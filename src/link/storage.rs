// Storage Cells
//
// Every variable of a linked graph is assigned a cell. An output that
// destroys an input reuses that input's cell; every other output, including
// views, gets a fresh one. Constants are written into their cells when a
// storage map is created and are never overwritten.

use crate::core::error::{GraphError, Result};
use crate::ir::fgraph::FunctionGraph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::value::TensorValue;
use std::collections::HashMap;

/// Variable -> cell assignment of one linked graph
#[derive(Debug, Clone)]
pub struct StoragePlan {
    cells: HashMap<VarId, usize>,
    n_cells: usize,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    constants: Vec<(usize, TensorValue)>,
}

impl StoragePlan {
    /// Assign cells following `order`
    pub fn new(fgraph: &FunctionGraph, order: &[NodeId]) -> Result<Self> {
        let graph = fgraph.graph();
        let mut plan = StoragePlan {
            cells: HashMap::new(),
            n_cells: 0,
            inputs: Vec::with_capacity(fgraph.inputs().len()),
            outputs: Vec::with_capacity(fgraph.outputs().len()),
            constants: Vec::new(),
        };
        for input in fgraph.inputs() {
            let cell = plan.cell_for(*input);
            plan.inputs.push(cell);
        }
        for node in order {
            let apply = graph.node(*node);
            for input in &apply.inputs {
                plan.leaf(fgraph, *input)?;
            }
            let destroy_map = apply.op.destroy_map();
            for (k, output) in apply.outputs.iter().enumerate() {
                match destroy_map.get(&k).and_then(|v| v.first()) {
                    Some(i) => {
                        let cell = plan.cell(apply.inputs[*i])?;
                        plan.cells.insert(*output, cell);
                    }
                    None => {
                        plan.cell_for(*output);
                    }
                }
            }
        }
        for output in fgraph.outputs() {
            plan.leaf(fgraph, *output)?;
            let cell = plan.cell(*output)?;
            plan.outputs.push(cell);
        }
        log::trace!(
            "storage plan: {} cells for {} variables",
            plan.n_cells,
            plan.cells.len()
        );
        Ok(plan)
    }

    fn cell_for(&mut self, var: VarId) -> usize {
        if let Some(cell) = self.cells.get(&var) {
            return *cell;
        }
        let cell = self.n_cells;
        self.n_cells += 1;
        self.cells.insert(var, cell);
        cell
    }

    /// Cell of a variable read before any node produced it
    fn leaf(&mut self, fgraph: &FunctionGraph, var: VarId) -> Result<()> {
        if self.cells.contains_key(&var) {
            return Ok(());
        }
        match fgraph.graph().constant_value(var) {
            Some(value) => {
                let value = value.clone();
                let cell = self.cell_for(var);
                self.constants.push((cell, value));
                Ok(())
            }
            None => Err(GraphError::MissingInput(format!(
                "{} is read before it is computed",
                fgraph.graph().label(var)
            ))),
        }
    }

    pub fn cell(&self, var: VarId) -> Result<usize> {
        self.cells
            .get(&var)
            .copied()
            .ok_or_else(|| GraphError::MissingInput(format!("{} has no storage cell", var)))
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn input_cells(&self) -> &[usize] {
        &self.inputs
    }

    pub fn output_cells(&self) -> &[usize] {
        &self.outputs
    }

    /// Fresh storage with constants filled in
    pub fn new_storage(&self) -> StorageMap {
        let mut storage = StorageMap::with_cells(self.n_cells);
        for (cell, value) in &self.constants {
            storage.set(*cell, value.clone());
        }
        storage
    }
}

/// Values of one execution arena
#[derive(Debug, Clone, Default)]
pub struct StorageMap {
    cells: Vec<Option<TensorValue>>,
}

impl StorageMap {
    pub fn with_cells(n: usize) -> Self {
        StorageMap {
            cells: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, cell: usize) -> Option<&TensorValue> {
        self.cells.get(cell).and_then(Option::as_ref)
    }

    /// Value of a cell, or `MissingInput` when it is empty
    pub fn read(&self, cell: usize) -> Result<&TensorValue> {
        self.get(cell)
            .ok_or_else(|| GraphError::MissingInput(format!("storage cell {} is empty", cell)))
    }

    pub fn set(&mut self, cell: usize, value: TensorValue) {
        if cell >= self.cells.len() {
            self.cells.resize(cell + 1, None);
        }
        self.cells[cell] = Some(value);
    }

    pub fn take(&mut self, cell: usize) -> Option<TensorValue> {
        self.cells.get_mut(cell).and_then(Option::take)
    }
}
