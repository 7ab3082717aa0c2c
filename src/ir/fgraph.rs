// Function Graph
//
// A bounded subgraph with declared inputs and outputs, the unit that the
// rewrite engine mutates and the linkers compile. It maintains the reverse
// (clients) index, notifies attached features of every mutation, and keeps a
// change log so a failed rewrite can be rolled back.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, VarId};
use crate::ir::traversal::{ancestors, io_toposort, io_toposort_with_orderings};
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// A consumer of a variable: an input slot of a node, or a graph output slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Client {
    Node(NodeId, usize),
    Output(usize),
}

impl Client {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Client::Node(n, _) => Some(*n),
            Client::Output(_) => None,
        }
    }
}

/// Observer attached to a function graph.
///
/// Callbacks see the graph after the mutation. `validate` is consulted by
/// transactional replacements; an error there rolls the replacement back.
pub trait Feature: Send {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn on_attach(&mut self, fgraph: &FunctionGraph) -> Result<()> {
        let _ = fgraph;
        Ok(())
    }

    fn on_import(&mut self, _fgraph: &FunctionGraph, _node: NodeId, _reason: &str) {}

    fn on_prune(&mut self, _fgraph: &FunctionGraph, _node: NodeId, _reason: &str) {}

    fn on_change_input(
        &mut self,
        _fgraph: &FunctionGraph,
        _client: Client,
        _old: VarId,
        _new: VarId,
        _reason: &str,
    ) {
    }

    fn validate(&self, _fgraph: &FunctionGraph) -> Result<()> {
        Ok(())
    }

    /// Extra "runs-before" constraints: node -> nodes that must run first
    fn orderings(&self, _fgraph: &FunctionGraph) -> HashMap<NodeId, Vec<NodeId>> {
        HashMap::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct Change {
    client: Client,
    old: VarId,
    new: VarId,
}

/// Function graph over an owned arena
pub struct FunctionGraph {
    graph: Graph,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
    apply_nodes: BTreeSet<NodeId>,
    variables: BTreeSet<VarId>,
    clients: HashMap<VarId, Vec<Client>>,
    features: Vec<Box<dyn Feature>>,
    history: Vec<Change>,
    change_count: usize,
}

impl fmt::Debug for FunctionGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FunctionGraph")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("apply_nodes", &self.apply_nodes.len())
            .field("features", &self.features.iter().map(|f| f.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionGraph {
    /// Import everything between `inputs` and `outputs`.
    ///
    /// Inputs must be free variables; any other free leaf the outputs depend
    /// on must be a constant, otherwise `MissingInput`.
    pub fn new(graph: Graph, inputs: Vec<VarId>, outputs: Vec<VarId>) -> Result<Self> {
        let mut fgraph = FunctionGraph {
            graph,
            inputs: Vec::new(),
            outputs: outputs.clone(),
            apply_nodes: BTreeSet::new(),
            variables: BTreeSet::new(),
            clients: HashMap::new(),
            features: Vec::new(),
            history: Vec::new(),
            change_count: 0,
        };
        for v in inputs.iter().chain(&outputs) {
            fgraph.graph.check_var(*v)?;
        }
        for input in inputs {
            if fgraph.graph.owner(input).is_some() {
                return Err(GraphError::InvalidValue(format!(
                    "input {} is computed by a node; clone the graph before using it as an input",
                    fgraph.graph.label(input)
                )));
            }
            if fgraph.variables.contains(&input) {
                return Err(GraphError::InvalidValue(format!(
                    "input {} is listed twice",
                    fgraph.graph.label(input)
                )));
            }
            fgraph.variables.insert(input);
            fgraph.clients.entry(input).or_default();
            fgraph.inputs.push(input);
        }
        for (i, output) in outputs.into_iter().enumerate() {
            fgraph.import_var(output, "init")?;
            fgraph.add_client(output, Client::Output(i));
        }
        log::debug!(
            "function graph: {} inputs, {} outputs, {} nodes",
            fgraph.inputs.len(),
            fgraph.outputs.len(),
            fgraph.apply_nodes.len()
        );
        Ok(fgraph)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The arena, for building new nodes. Live nodes cannot be edited through it.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn inputs(&self) -> &[VarId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn apply_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.apply_nodes.iter().copied()
    }

    pub fn num_nodes(&self) -> usize {
        self.apply_nodes.len()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.apply_nodes.contains(&node)
    }

    pub fn variables(&self) -> impl Iterator<Item = VarId> + '_ {
        self.variables.iter().copied()
    }

    pub fn contains_var(&self, var: VarId) -> bool {
        self.variables.contains(&var)
    }

    pub fn clients(&self, var: VarId) -> &[Client] {
        self.clients.get(&var).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_output(&self, var: VarId) -> bool {
        self.outputs.contains(&var)
    }

    pub fn is_input(&self, var: VarId) -> bool {
        self.inputs.contains(&var)
    }

    /// Number of input rewirings applied so far, reverts included
    pub fn change_count(&self) -> usize {
        self.change_count
    }

    // ---- features ----

    pub fn attach_feature(&mut self, mut feature: Box<dyn Feature>) -> Result<()> {
        feature.on_attach(self)?;
        log::debug!("function graph: attached feature {}", feature.name());
        self.features.push(feature);
        Ok(())
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name() == name)
    }

    pub fn feature<T: Feature + 'static>(&self) -> Option<&T> {
        self.features.iter().find_map(|f| f.as_any().downcast_ref::<T>())
    }

    fn notify<F>(&mut self, mut callback: F)
    where
        F: FnMut(&mut dyn Feature, &FunctionGraph),
    {
        let mut features = std::mem::take(&mut self.features);
        for feature in features.iter_mut() {
            callback(feature.as_mut(), self);
        }
        self.features = features;
    }

    /// Ask every feature whether the current graph is acceptable
    pub fn validate(&self) -> Result<()> {
        for feature in &self.features {
            feature.validate(self)?;
        }
        Ok(())
    }

    /// Union of the features' ordering constraints
    pub fn orderings(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let mut all: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for feature in &self.features {
            for (node, before) in feature.orderings(self) {
                let entry = all.entry(node).or_default();
                for b in before {
                    if !entry.contains(&b) {
                        entry.push(b);
                    }
                }
            }
        }
        all
    }

    /// Execution order honouring data dependencies and feature orderings
    pub fn toposort(&self) -> Result<Vec<NodeId>> {
        if self.apply_nodes.len() < 2 {
            return Ok(self.apply_nodes.iter().copied().collect());
        }
        let orderings = self.orderings();
        let order = io_toposort_with_orderings(&self.graph, &self.inputs, &self.outputs, &orderings)?;
        if order.len() != self.apply_nodes.len() {
            return Err(GraphError::Ordering(format!(
                "toposort reached {} of {} nodes",
                order.len(),
                self.apply_nodes.len()
            )));
        }
        Ok(order)
    }

    // ---- import / prune ----

    fn add_client(&mut self, var: VarId, client: Client) {
        self.clients.entry(var).or_default().push(client);
    }

    /// Bring a variable and everything it depends on into the graph
    fn import_var(&mut self, var: VarId, reason: &str) -> Result<()> {
        if self.variables.contains(&var) {
            return Ok(());
        }
        match self.graph.owner(var) {
            Some(node) => self.import_node(node, reason),
            None if self.graph.is_constant(var) => {
                self.variables.insert(var);
                self.clients.entry(var).or_default();
                Ok(())
            }
            None => Err(GraphError::MissingInput(format!(
                "{} is needed but is neither an input nor a constant",
                self.graph.label(var)
            ))),
        }
    }

    /// Import a node and its not-yet-imported ancestors.
    ///
    /// Missing inputs are detected before anything is mutated.
    fn import_node(&mut self, node: NodeId, reason: &str) -> Result<()> {
        if self.apply_nodes.contains(&node) {
            return Ok(());
        }
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(node, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                order.push(n);
                continue;
            }
            if self.apply_nodes.contains(&n) || !visited.insert(n) {
                continue;
            }
            stack.push((n, true));
            for input in self.graph.node(n).inputs.iter().rev() {
                if self.variables.contains(input) {
                    continue;
                }
                match self.graph.owner(*input) {
                    Some(owner) => stack.push((owner, false)),
                    None if self.graph.is_constant(*input) => {}
                    None => {
                        return Err(GraphError::MissingInput(format!(
                            "{} (input {} of {}) is neither an input nor a constant",
                            self.graph.label(*input),
                            self.graph.node(n).inputs.iter().position(|v| v == input).unwrap_or(0),
                            self.graph.op(n).name()
                        )))
                    }
                }
            }
        }

        for n in order {
            self.apply_nodes.insert(n);
            let apply = self.graph.node(n).clone();
            for out in &apply.outputs {
                self.variables.insert(*out);
                self.clients.entry(*out).or_default();
            }
            for (i, input) in apply.inputs.iter().enumerate() {
                if self.variables.insert(*input) {
                    self.clients.entry(*input).or_default();
                }
                self.add_client(*input, Client::Node(n, i));
            }
            log::trace!("function graph: import {} ({}) [{}]", n, apply.op.name(), reason);
            self.notify(|f, fg| f.on_import(fg, n, reason));
        }
        Ok(())
    }

    /// Drop a client; prune whatever becomes unreachable
    fn remove_client(&mut self, var: VarId, client: Client, reason: &str) {
        let mut work = vec![(var, client)];
        while let Some((var, client)) = work.pop() {
            let now_unused = match self.clients.get_mut(&var) {
                Some(list) => {
                    if let Some(pos) = list.iter().position(|c| *c == client) {
                        list.remove(pos);
                    }
                    list.is_empty()
                }
                None => false,
            };
            if !now_unused {
                continue;
            }
            match self.graph.owner(var) {
                Some(owner) => {
                    let outputs = self.graph.node(owner).outputs.clone();
                    let unused = outputs.iter().all(|o| self.clients(*o).is_empty());
                    if !unused || !self.apply_nodes.remove(&owner) {
                        continue;
                    }
                    for out in &outputs {
                        self.variables.remove(out);
                        self.clients.remove(out);
                    }
                    log::trace!("function graph: prune {} [{}]", owner, reason);
                    self.notify(|f, fg| f.on_prune(fg, owner, reason));
                    let inputs = self.graph.node(owner).inputs.clone();
                    for (i, input) in inputs.into_iter().enumerate() {
                        work.push((input, Client::Node(owner, i)));
                    }
                }
                None => {
                    if !self.inputs.contains(&var) {
                        self.variables.remove(&var);
                        self.clients.remove(&var);
                    }
                }
            }
        }
    }

    // ---- mutation ----

    /// Point one client at a new variable
    pub fn change_input(&mut self, client: Client, new: VarId, reason: &str) -> Result<()> {
        self.change_input_inner(client, new, reason, true, true)
    }

    fn change_input_inner(
        &mut self,
        client: Client,
        new: VarId,
        reason: &str,
        check_type: bool,
        record: bool,
    ) -> Result<()> {
        let old = match client {
            Client::Node(node, index) => {
                if !self.apply_nodes.contains(&node) {
                    return Err(GraphError::InvalidValue(format!(
                        "{} is not part of the function graph",
                        node
                    )));
                }
                self.graph.node(node).inputs.get(index).copied().ok_or_else(|| {
                    GraphError::InvalidValue(format!("{} has no input {}", node, index))
                })?
            }
            Client::Output(index) => self.outputs.get(index).copied().ok_or_else(|| {
                GraphError::InvalidValue(format!(
                    "output {} of {} does not exist",
                    index,
                    self.outputs.len()
                ))
            })?,
        };
        self.graph.check_var(new)?;
        if old == new {
            return Ok(());
        }
        if check_type && !self.graph.ty(old).accepts(self.graph.ty(new)) {
            return Err(GraphError::TypeMismatch(format!(
                "cannot replace {} of type {} with {} of type {}",
                self.graph.label(old),
                self.graph.ty(old),
                self.graph.label(new),
                self.graph.ty(new)
            )));
        }
        self.import_var(new, reason)?;
        self.add_client(new, client);
        match client {
            Client::Node(node, index) => self.graph.set_node_input(node, index, new),
            Client::Output(index) => self.outputs[index] = new,
        }
        self.remove_client(old, client, reason);
        if record {
            self.history.push(Change { client, old, new });
        }
        self.change_count += 1;
        self.notify(|f, fg| f.on_change_input(fg, client, old, new, reason));
        Ok(())
    }

    /// Redirect every client of `old` to `new`.
    ///
    /// `new` must have a type `old`'s type accepts and must not depend on `old`.
    pub fn replace(&mut self, old: VarId, new: VarId, reason: &str) -> Result<()> {
        self.replace_inner(old, new, reason, true)
    }

    /// `replace` without the type check
    pub fn replace_unchecked(&mut self, old: VarId, new: VarId, reason: &str) -> Result<()> {
        self.replace_inner(old, new, reason, false)
    }

    fn replace_inner(&mut self, old: VarId, new: VarId, reason: &str, check_type: bool) -> Result<()> {
        self.graph.check_var(new)?;
        if !self.variables.contains(&old) {
            // already pruned by an earlier replacement
            log::trace!("function graph: {} is gone, nothing to replace", old);
            return Ok(());
        }
        if old == new {
            return Ok(());
        }
        if check_type && !self.graph.ty(old).accepts(self.graph.ty(new)) {
            return Err(GraphError::TypeMismatch(format!(
                "cannot replace {} of type {} with {} of type {}",
                self.graph.label(old),
                self.graph.ty(old),
                self.graph.label(new),
                self.graph.ty(new)
            )));
        }
        if ancestors(&self.graph, &[new], &[]).any(|v| v == old) {
            return Err(GraphError::Cycle(format!(
                "{} depends on {}",
                self.graph.label(new),
                self.graph.label(old)
            )));
        }
        log::debug!(
            "replace {} -> {} [{}]",
            self.graph.label(old),
            self.graph.label(new),
            reason
        );
        for client in self.clients(old).to_vec() {
            self.change_input_inner(client, new, reason, check_type, true)?;
        }
        Ok(())
    }

    pub fn replace_all(&mut self, pairs: &[(VarId, VarId)], reason: &str) -> Result<()> {
        for (old, new) in pairs {
            self.replace(*old, *new, reason)?;
        }
        Ok(())
    }

    /// Position in the change log to revert to
    pub fn checkpoint(&self) -> usize {
        self.history.len()
    }

    /// Undo every change made after `checkpoint`
    pub fn revert(&mut self, checkpoint: usize) -> Result<()> {
        while self.history.len() > checkpoint {
            if let Some(change) = self.history.pop() {
                debug_assert_eq!(
                    match change.client {
                        Client::Node(n, i) => self.graph.node(n).inputs[i],
                        Client::Output(i) => self.outputs[i],
                    },
                    change.new
                );
                self.change_input_inner(change.client, change.old, "revert", false, false)?;
            }
        }
        Ok(())
    }

    /// Replace, then validate; on any failure the graph is left unchanged
    pub fn replace_validate(&mut self, pairs: &[(VarId, VarId)], reason: &str) -> Result<()> {
        let checkpoint = self.checkpoint();
        let result = self.replace_all(pairs, reason).and_then(|_| self.validate());
        if let Err(err) = result {
            log::debug!("rolling back [{}]: {}", reason, err);
            self.revert(checkpoint)?;
            return Err(err);
        }
        Ok(())
    }

    /// `replace_validate` that also requires the `remove` nodes to disappear.
    ///
    /// Returns false (and rolls back) when one of them is still in use.
    pub fn replace_validate_remove(
        &mut self,
        pairs: &[(VarId, VarId)],
        remove: &[NodeId],
        reason: &str,
    ) -> Result<bool> {
        let checkpoint = self.checkpoint();
        self.replace_validate(pairs, reason)?;
        if remove.iter().any(|n| self.apply_nodes.contains(n)) {
            log::debug!("rolling back [{}]: replaced node is still used", reason);
            self.revert(checkpoint)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Verify the clients index, back-links and reachability
    pub fn check_integrity(&self) -> Result<()> {
        let fail = |msg: String| Err(GraphError::InvalidValue(format!("integrity: {}", msg)));
        for &node in &self.apply_nodes {
            let apply = self.graph.node(node);
            for (i, out) in apply.outputs.iter().enumerate() {
                if !self.variables.contains(out) {
                    return fail(format!("output {} of {} is not tracked", out, node));
                }
                let var = self.graph.var(*out);
                if var.owner != Some(node) || var.index != i {
                    return fail(format!("bad owner link on {}", out));
                }
            }
            for (i, input) in apply.inputs.iter().enumerate() {
                if !self.variables.contains(input) {
                    return fail(format!("input {} of {} is not tracked", input, node));
                }
                if !self.clients(*input).contains(&Client::Node(node, i)) {
                    return fail(format!("{} misses client ({}, {})", input, node, i));
                }
            }
        }
        for &var in &self.variables {
            for client in self.clients(var) {
                let ok = match *client {
                    Client::Node(n, i) => {
                        self.apply_nodes.contains(&n) && self.graph.node(n).inputs.get(i) == Some(&var)
                    }
                    Client::Output(i) => self.outputs.get(i) == Some(&var),
                };
                if !ok {
                    return fail(format!("stale client {:?} of {}", client, var));
                }
            }
            match self.graph.owner(var) {
                Some(owner) if !self.apply_nodes.contains(&owner) => {
                    return fail(format!("{} is owned by a node outside the graph", var))
                }
                None if !self.graph.is_constant(var) && !self.inputs.contains(&var) => {
                    return fail(format!("{} is a free variable that is not an input", var))
                }
                _ => {}
            }
        }
        for (i, out) in self.outputs.iter().enumerate() {
            if !self.clients(*out).contains(&Client::Output(i)) {
                return fail(format!("output {} is not registered", i));
            }
        }
        let reachable: BTreeSet<NodeId> =
            io_toposort(&self.graph, &self.inputs, &self.outputs).into_iter().collect();
        if reachable != self.apply_nodes {
            return fail(format!(
                "{} nodes reachable but {} tracked",
                reachable.len(),
                self.apply_nodes.len()
            ));
        }
        Ok(())
    }
}
