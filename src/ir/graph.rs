// IR Computation Graph
//
// Arena holding every variable and Apply node built so far. Nodes are only
// ever appended; a FunctionGraph tracks which of them are live.

use crate::core::error::{GraphError, Result};
use crate::ir::node::{Apply, NodeId, VarId, Variable};
use crate::ir::op::OpRef;
use crate::ir::traversal::io_toposort;
use crate::ir::types::{ScalarType, TensorType};
use crate::ir::value::TensorValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Computation graph arena
#[derive(Debug, Clone, Default)]
pub struct Graph {
    vars: Vec<Variable>,
    nodes: Vec<Apply>,
}

/// Policy for `Graph::clone_subgraph`
#[derive(Debug, Clone, Copy)]
pub struct CloneOptions {
    /// Give the subgraph fresh input variables
    pub copy_inputs: bool,
    /// Also copy free leaves (constants) that are not listed inputs
    pub copy_orphans: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        CloneOptions {
            copy_inputs: true,
            copy_orphans: false,
        }
    }
}

/// Variables of a cloned subgraph
#[derive(Debug, Clone)]
pub struct Cloned {
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    /// Original variable -> its copy (identity for shared variables)
    pub memo: HashMap<VarId, VarId>,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a free variable (a future graph input)
    pub fn variable(&mut self, ty: TensorType, name: Option<&str>) -> VarId {
        self.push_var(Variable {
            ty,
            name: name.map(str::to_string),
            owner: None,
            index: 0,
            value: None,
        })
    }

    /// Add a named free variable
    pub fn input(&mut self, name: &str, ty: TensorType) -> VarId {
        self.variable(ty, Some(name))
    }

    /// Add a constant; its type is derived from the value
    pub fn constant(&mut self, value: TensorValue) -> VarId {
        self.push_var(Variable {
            ty: value.tensor_type(),
            name: None,
            owner: None,
            index: 0,
            value: Some(Arc::new(value)),
        })
    }

    pub fn scalar_constant(&mut self, dtype: ScalarType, value: f64) -> VarId {
        self.constant(TensorValue::scalar(dtype, value))
    }

    fn push_var(&mut self, var: Variable) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(var);
        id
    }

    /// Apply an op to inputs, returning the new node
    pub fn apply(&mut self, op: OpRef, inputs: &[VarId]) -> Result<NodeId> {
        for v in inputs {
            self.check_var(*v)?;
        }
        let spec = op.make_node(self, inputs)?;
        Ok(self.add_node_raw(op, spec.inputs, spec.outputs))
    }

    /// Apply a single-output op, returning its output variable
    pub fn apply1(&mut self, op: OpRef, inputs: &[VarId]) -> Result<VarId> {
        let name = op.name();
        let node = self.apply(op, inputs)?;
        match self.nodes[node.0].outputs.as_slice() {
            [out] => Ok(*out),
            outs => Err(GraphError::InvalidValue(format!(
                "{} has {} outputs, expected one",
                name,
                outs.len()
            ))),
        }
    }

    /// Append a node without calling `make_node`
    pub(crate) fn add_node_raw(
        &mut self,
        op: OpRef,
        inputs: Vec<VarId>,
        output_types: Vec<TensorType>,
    ) -> NodeId {
        let node = NodeId(self.nodes.len());
        let outputs = output_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                self.push_var(Variable {
                    ty,
                    name: None,
                    owner: Some(node),
                    index,
                    value: None,
                })
            })
            .collect();
        self.nodes.push(Apply {
            op,
            inputs,
            outputs,
        });
        log::trace!("graph: added node {}", node);
        node
    }

    /// Rewire one input of a node
    pub(crate) fn set_node_input(&mut self, node: NodeId, index: usize, var: VarId) {
        self.nodes[node.0].inputs[index] = var;
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Apply {
        &self.nodes[id.0]
    }

    pub fn ty(&self, id: VarId) -> &TensorType {
        &self.vars[id.0].ty
    }

    pub fn owner(&self, id: VarId) -> Option<NodeId> {
        self.vars[id.0].owner
    }

    pub fn op(&self, id: NodeId) -> &OpRef {
        &self.nodes[id.0].op
    }

    pub fn is_constant(&self, id: VarId) -> bool {
        self.vars[id.0].is_constant()
    }

    pub fn constant_value(&self, id: VarId) -> Option<&TensorValue> {
        self.vars[id.0].value.as_deref()
    }

    pub fn set_name(&mut self, id: VarId, name: &str) {
        self.vars[id.0].name = Some(name.to_string());
    }

    /// Name if set, otherwise the arena id
    pub fn label(&self, id: VarId) -> String {
        match &self.vars[id.0].name {
            Some(name) => name.clone(),
            None => id.to_string(),
        }
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// `InvalidValue` unless `id` was created by this graph
    pub fn check_var(&self, id: VarId) -> Result<()> {
        if id.0 >= self.vars.len() {
            return Err(GraphError::InvalidValue(format!(
                "{} does not belong to this graph",
                id
            )));
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check the owner/index back-links of every variable and node
    pub fn check_links(&self) -> bool {
        let outputs_ok = self.nodes.iter().enumerate().all(|(n, node)| {
            node.outputs.iter().enumerate().all(|(i, v)| {
                let var = &self.vars[v.0];
                var.owner == Some(NodeId(n)) && var.index == i
            })
        });
        let owners_ok = self.vars.iter().enumerate().all(|(v, var)| match var.owner {
            Some(node) => self.nodes[node.0].outputs.get(var.index) == Some(&VarId(v)),
            None => true,
        });
        outputs_ok && owners_ok
    }

    /// Copy the computation between `inputs` and `outputs` inside this arena.
    ///
    /// Copied nodes share ops with the originals. Constants are shared unless
    /// `copy_orphans` is set.
    pub fn clone_subgraph(
        &mut self,
        inputs: &[VarId],
        outputs: &[VarId],
        options: CloneOptions,
    ) -> Result<Cloned> {
        let order = io_toposort(self, inputs, outputs);
        let mut memo: HashMap<VarId, VarId> = HashMap::new();

        for &input in inputs {
            let copy = if options.copy_inputs {
                self.copy_leaf(input)
            } else {
                input
            };
            memo.insert(input, copy);
        }

        for node in order {
            let apply = self.nodes[node.0].clone();
            let mut new_inputs = Vec::with_capacity(apply.inputs.len());
            for input in &apply.inputs {
                let mapped = match memo.get(input) {
                    Some(v) => *v,
                    None => {
                        let copy = if options.copy_orphans {
                            self.copy_leaf(*input)
                        } else {
                            *input
                        };
                        memo.insert(*input, copy);
                        copy
                    }
                };
                new_inputs.push(mapped);
            }
            let output_types = apply.outputs.iter().map(|v| self.ty(*v).clone()).collect();
            let new_node = self.add_node_raw(apply.op.clone(), new_inputs, output_types);
            let new_outputs = self.nodes[new_node.0].outputs.clone();
            for (old, new) in apply.outputs.iter().zip(new_outputs) {
                self.vars[new.0].name = self.vars[old.0].name.clone();
                memo.insert(*old, new);
            }
        }

        let mut cloned_outputs = Vec::with_capacity(outputs.len());
        for &output in outputs {
            let mapped = match memo.get(&output) {
                Some(v) => *v,
                None => {
                    let copy = if options.copy_orphans {
                        self.copy_leaf(output)
                    } else {
                        output
                    };
                    memo.insert(output, copy);
                    copy
                }
            };
            cloned_outputs.push(mapped);
        }

        Ok(Cloned {
            inputs: inputs.iter().map(|v| memo[v]).collect(),
            outputs: cloned_outputs,
            memo,
        })
    }

    fn copy_leaf(&mut self, var: VarId) -> VarId {
        let original = &self.vars[var.0];
        let copy = Variable {
            ty: original.ty.clone(),
            name: original.name.clone(),
            owner: None,
            index: 0,
            value: original.value.clone(),
        };
        self.push_var(copy)
    }

    /// A standalone graph holding one node applied to fresh inputs.
    ///
    /// Constant inputs stay constants. Returns the graph, its free inputs and
    /// the node's outputs.
    pub fn extract_node(&self, node: NodeId) -> (Graph, Vec<VarId>, Vec<VarId>) {
        let apply = &self.nodes[node.0];
        let mut sub = Graph::new();
        let mut free = Vec::new();
        let mut inputs = Vec::with_capacity(apply.inputs.len());
        for input in &apply.inputs {
            let var = &self.vars[input.0];
            let id = match &var.value {
                Some(value) => sub.push_var(Variable {
                    ty: var.ty.clone(),
                    name: None,
                    owner: None,
                    index: 0,
                    value: Some(value.clone()),
                }),
                None => {
                    let id = sub.variable(var.ty.clone(), var.name.as_deref());
                    free.push(id);
                    id
                }
            };
            inputs.push(id);
        }
        let output_types = apply.outputs.iter().map(|v| self.ty(*v).clone()).collect();
        let new_node = sub.add_node_raw(apply.op.clone(), inputs, output_types);
        let outputs = sub.nodes[new_node.0].outputs.clone();
        (sub, free, outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::elemwise;

    fn fmatrix(g: &mut Graph, name: &str) -> VarId {
        g.input(name, TensorType::matrix(ScalarType::Float64))
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::new();
        assert_eq!(graph.num_nodes(), 0);
        assert_eq!(graph.num_vars(), 0);
    }

    #[test]
    fn test_apply_sets_back_links() {
        let mut g = Graph::new();
        let x = fmatrix(&mut g, "x");
        let y = fmatrix(&mut g, "y");
        let z = elemwise::add(&mut g, &[x, y]).unwrap();
        let node = g.owner(z).unwrap();
        assert_eq!(g.node(node).inputs, vec![x, y]);
        assert_eq!(g.var(z).index, 0);
        assert!(g.check_links());
    }

    #[test]
    fn test_clone_shares_constants_by_default() {
        let mut g = Graph::new();
        let x = fmatrix(&mut g, "x");
        let c = g.scalar_constant(ScalarType::Float64, 2.0);
        let y = elemwise::mul(&mut g, &[x, c]).unwrap();
        let cloned = g.clone_subgraph(&[x], &[y], CloneOptions::default()).unwrap();
        assert_ne!(cloned.inputs[0], x);
        assert_ne!(cloned.outputs[0], y);
        assert_eq!(cloned.memo[&c], c);
        assert!(g.check_links());

        let copied = g
            .clone_subgraph(
                &[x],
                &[y],
                CloneOptions {
                    copy_inputs: false,
                    copy_orphans: true,
                },
            )
            .unwrap();
        assert_eq!(copied.inputs[0], x);
        assert_ne!(copied.memo[&c], c);
        assert!(g.is_constant(copied.memo[&c]));
    }

    #[test]
    fn test_clone_of_leaf_output() {
        let mut g = Graph::new();
        let c = g.scalar_constant(ScalarType::Float64, 1.0);
        let shared = g.clone_subgraph(&[], &[c], CloneOptions::default()).unwrap();
        assert_eq!(shared.outputs[0], c);
        let as_input = g.clone_subgraph(&[c], &[c], CloneOptions::default()).unwrap();
        assert_ne!(as_input.outputs[0], c);
        assert_eq!(as_input.inputs[0], as_input.outputs[0]);
    }
}
