// Graph Traversal
//
// Generic topological sorting over any node type, plus the Variable/Apply
// walks built on it: io_toposort, ancestors, graph_inputs, vars_between,
// orphans_between and friends.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::{GraphNode, NodeId, VarId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Memo of direct dependencies; `None` and empty both mean "no dependencies"
pub type DepsCache<T> = HashMap<T, Option<Vec<T>>>;

/// Topologically sort everything reachable from `outputs` through `deps`.
///
/// Dependencies come before dependents. The order is deterministic for a
/// given `deps`. Fails with `Ordering` when the dependencies form a cycle.
pub fn general_toposort<T, F>(outputs: &[T], mut deps: F) -> Result<Vec<T>>
where
    T: Copy + Eq + Hash,
    F: FnMut(T) -> Option<Vec<T>>,
{
    let mut cache = DepsCache::new();
    let mut compute = |node: T, cache: &mut DepsCache<T>| -> Option<Vec<T>> {
        if let Some(known) = cache.get(&node) {
            return known.clone();
        }
        let d = deps(node);
        cache.insert(node, d.clone());
        d
    };
    toposort_core(outputs, &mut compute, &mut cache, None)
}

/// Toposort with a caller-supplied dependency memo.
///
/// `compute_deps` must record every node it is asked about in the memo it is
/// handed; the memo is the source of truth for ordering. A missing memo, or a
/// visited node without a memo entry, is an `Ordering` error. When `clients`
/// is given it receives the reverse dependency map.
pub fn general_toposort_with_cache<T, F>(
    outputs: &[T],
    mut compute_deps: F,
    deps_cache: Option<&mut DepsCache<T>>,
    clients: Option<&mut HashMap<T, Vec<T>>>,
) -> Result<Vec<T>>
where
    T: Copy + Eq + Hash,
    F: FnMut(T, &mut DepsCache<T>) -> Option<Vec<T>>,
{
    let cache = deps_cache.ok_or_else(|| {
        GraphError::Ordering(
            "a dependency memo is required when supplying a memoizing dependency function"
                .to_string(),
        )
    })?;
    toposort_core(outputs, &mut compute_deps, cache, clients)
}

fn toposort_core<T>(
    outputs: &[T],
    compute: &mut dyn FnMut(T, &mut DepsCache<T>) -> Option<Vec<T>>,
    cache: &mut DepsCache<T>,
    clients_out: Option<&mut HashMap<T, Vec<T>>>,
) -> Result<Vec<T>>
where
    T: Copy + Eq + Hash,
{
    // depth-first walk, recording each node's children
    let mut stack: Vec<T> = outputs.to_vec();
    let mut seen: HashSet<T> = HashSet::new();
    let mut walked: Vec<(T, Option<Vec<T>>)> = Vec::new();
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        let children = compute(node, cache);
        if let Some(ch) = &children {
            stack.extend(ch.iter().copied());
        }
        walked.push((node, children));
    }

    let mut clients: HashMap<T, Vec<T>> = HashMap::new();
    let mut remaining: HashMap<T, Vec<T>> = HashMap::new();
    let mut sources: VecDeque<T> = VecDeque::new();
    for (node, children) in &walked {
        if let Some(ch) = children {
            for c in ch {
                clients.entry(*c).or_default().push(*node);
            }
        }
        match cache.get(node) {
            None => {
                return Err(GraphError::Ordering(
                    "dependency memo has no entry for a visited node".to_string(),
                ))
            }
            Some(Some(d)) if !d.is_empty() => {
                remaining.insert(*node, d.clone());
            }
            Some(_) => sources.push_back(*node),
        }
    }

    let mut done: HashSet<T> = HashSet::new();
    let mut order = Vec::with_capacity(walked.len());
    while let Some(node) = sources.pop_front() {
        if !done.insert(node) {
            continue;
        }
        order.push(node);
        if let Some(cl) = clients.get(&node) {
            for client in cl {
                if let Some(d) = remaining.get_mut(client) {
                    d.retain(|dep| *dep != node);
                    if d.is_empty() {
                        sources.push_back(*client);
                    }
                }
            }
        }
    }

    if order.len() != walked.len() {
        return Err(GraphError::Ordering("graph contains cycles".to_string()));
    }
    if let Some(out) = clients_out {
        out.extend(clients);
    }
    Ok(order)
}

/// Apply nodes between `inputs` and `outputs`, dependencies first.
///
/// Nodes whose outputs are all already available are skipped.
pub fn io_toposort(graph: &Graph, inputs: &[VarId], outputs: &[VarId]) -> Vec<NodeId> {
    let mut computed: HashSet<VarId> = inputs.iter().copied().collect();
    let mut todo: Vec<NodeId> = outputs
        .iter()
        .rev()
        .filter_map(|o| graph.owner(*o))
        .collect();
    let mut order = Vec::new();
    while let Some(cur) = todo.pop() {
        let apply = graph.node(cur);
        if apply.outputs.iter().all(|o| computed.contains(o)) {
            continue;
        }
        if apply
            .inputs
            .iter()
            .all(|i| computed.contains(i) || graph.owner(*i).is_none())
        {
            computed.extend(apply.outputs.iter().copied());
            order.push(cur);
        } else {
            todo.push(cur);
            todo.extend(
                apply
                    .inputs
                    .iter()
                    .rev()
                    .filter(|i| !computed.contains(i))
                    .filter_map(|i| graph.owner(*i)),
            );
        }
    }
    order
}

/// `io_toposort` honouring extra "runs-before" constraints.
///
/// `orderings[n]` lists nodes that must run before `n`. Fails with
/// `Ordering` when the constraints contradict the data dependencies.
pub fn io_toposort_with_orderings(
    graph: &Graph,
    inputs: &[VarId],
    outputs: &[VarId],
    orderings: &HashMap<NodeId, Vec<NodeId>>,
) -> Result<Vec<NodeId>> {
    if orderings.values().all(Vec::is_empty) {
        return Ok(io_toposort(graph, inputs, outputs));
    }
    let iset: HashSet<VarId> = inputs.iter().copied().collect();
    let roots: Vec<GraphNode> = outputs.iter().map(|v| GraphNode::Var(*v)).collect();
    let sorted = general_toposort(&roots, |obj| {
        let mut deps = Vec::new();
        match obj {
            GraphNode::Var(v) => {
                if !iset.contains(&v) {
                    if let Some(owner) = graph.owner(v) {
                        deps.push(GraphNode::Apply(owner));
                    }
                }
            }
            GraphNode::Apply(n) => {
                deps.extend(graph.node(n).inputs.iter().map(|v| GraphNode::Var(*v)));
                if let Some(before) = orderings.get(&n) {
                    deps.extend(before.iter().map(|b| GraphNode::Apply(*b)));
                }
            }
        }
        Some(deps)
    })?;
    Ok(sorted
        .into_iter()
        .filter_map(|obj| match obj {
            GraphNode::Apply(n) => Some(n),
            GraphNode::Var(_) => None,
        })
        .collect())
}

/// Breadth- or depth-first walk with an expansion function.
///
/// Each item is yielded once together with what `expand` returned for it.
pub struct Walk<T, F> {
    queue: VecDeque<T>,
    seen: HashSet<T>,
    expand: F,
    bfs: bool,
}

/// Walk from `roots`. Depth-first walks visit the last expansion first.
pub fn walk<T, F>(roots: &[T], expand: F, bfs: bool) -> Walk<T, F>
where
    T: Copy + Eq + Hash,
    F: FnMut(T) -> Option<Vec<T>>,
{
    Walk {
        queue: roots.iter().copied().collect(),
        seen: HashSet::new(),
        expand,
        bfs,
    }
}

impl<T, F> Iterator for Walk<T, F>
where
    T: Copy + Eq + Hash,
    F: FnMut(T) -> Option<Vec<T>>,
{
    type Item = (T, Option<Vec<T>>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = if self.bfs {
                self.queue.pop_front()?
            } else {
                self.queue.pop_back()?
            };
            if !self.seen.insert(node) {
                continue;
            }
            let next = (self.expand)(node);
            if let Some(n) = &next {
                self.queue.extend(n.iter().copied());
            }
            return Some((node, next));
        }
    }
}

/// Variables the `outputs` depend on, lazily, depth first.
///
/// Expansion stops at `blockers`.
pub fn ancestors<'g>(
    graph: &'g Graph,
    outputs: &[VarId],
    blockers: &[VarId],
) -> impl Iterator<Item = VarId> + 'g {
    let blockers: HashSet<VarId> = blockers.iter().copied().collect();
    walk(
        outputs,
        move |v: VarId| {
            if blockers.contains(&v) {
                return None;
            }
            graph
                .owner(v)
                .map(|n| graph.node(n).inputs.iter().rev().copied().collect())
        },
        false,
    )
    .map(|(v, _)| v)
}

/// Leaves among the ancestors of `outputs`
pub fn graph_inputs<'g>(
    graph: &'g Graph,
    outputs: &[VarId],
    blockers: &[VarId],
) -> impl Iterator<Item = VarId> + 'g {
    ancestors(graph, outputs, blockers).filter(move |v| graph.owner(*v).is_none())
}

/// Variables on paths from `ins` to `outs`, breadth first from `outs`
pub fn vars_between<'g>(
    graph: &'g Graph,
    ins: &[VarId],
    outs: &[VarId],
) -> impl Iterator<Item = VarId> + 'g {
    let ins: HashSet<VarId> = ins.iter().copied().collect();
    walk(
        outs,
        move |v: VarId| {
            if ins.contains(&v) {
                return None;
            }
            graph.owner(v).map(|n| {
                let apply = graph.node(n);
                apply
                    .inputs
                    .iter()
                    .chain(apply.outputs.iter())
                    .rev()
                    .copied()
                    .collect()
            })
        },
        true,
    )
    .map(|(v, _)| v)
}

/// Free leaves between `ins` and `outs` that are not listed in `ins`
pub fn orphans_between(graph: &Graph, ins: &[VarId], outs: &[VarId]) -> Vec<VarId> {
    let iset: HashSet<VarId> = ins.iter().copied().collect();
    vars_between(graph, ins, outs)
        .filter(|v| graph.owner(*v).is_none() && !iset.contains(v))
        .collect()
}

/// Apply nodes between `ins` and `outs`, in `vars_between` order
pub fn applys_between(graph: &Graph, ins: &[VarId], outs: &[VarId]) -> Vec<NodeId> {
    let iset: HashSet<VarId> = ins.iter().copied().collect();
    vars_between(graph, ins, outs)
        .filter(|v| !iset.contains(v))
        .filter_map(|v| graph.owner(v))
        .collect()
}

/// Whether `candidate` is an ancestor of `node`
pub fn is_in_ancestors(graph: &Graph, node: NodeId, candidate: NodeId) -> bool {
    let mut seen = HashSet::new();
    let mut todo: Vec<NodeId> = graph
        .node(node)
        .inputs
        .iter()
        .filter_map(|v| graph.owner(*v))
        .collect();
    while let Some(cur) = todo.pop() {
        if cur == candidate {
            return true;
        }
        if seen.insert(cur) {
            todo.extend(graph.node(cur).inputs.iter().filter_map(|v| graph.owner(*v)));
        }
    }
    false
}

/// Structural equality of two lists of computations.
///
/// Leaves are equal when identical or paired through `in_xs`/`in_ys`;
/// constants compare by value; nodes by op name and inputs.
pub fn equal_computations(
    graph: &Graph,
    xs: &[VarId],
    ys: &[VarId],
    in_xs: &[VarId],
    in_ys: &[VarId],
) -> Result<bool> {
    if xs.len() != ys.len() {
        return Err(GraphError::InvalidValue(
            "equal_computations needs the same number of outputs on both sides".to_string(),
        ));
    }
    if in_xs.len() != in_ys.len() {
        return Err(GraphError::InvalidValue(
            "equal_computations needs the same number of inputs on both sides".to_string(),
        ));
    }
    let mut memo: HashMap<(VarId, VarId), bool> = HashMap::new();
    for (x, y) in in_xs.iter().zip(in_ys) {
        memo.insert((*x, *y), true);
    }
    Ok(xs
        .iter()
        .zip(ys)
        .all(|(x, y)| vars_equal(graph, *x, *y, &mut memo)))
}

fn vars_equal(graph: &Graph, x: VarId, y: VarId, memo: &mut HashMap<(VarId, VarId), bool>) -> bool {
    if let Some(known) = memo.get(&(x, y)) {
        return *known;
    }
    let result = if x == y {
        true
    } else if graph.ty(x) != graph.ty(y) {
        false
    } else {
        match (graph.owner(x), graph.owner(y)) {
            (None, None) => match (graph.constant_value(x), graph.constant_value(y)) {
                (Some(a), Some(b)) => a.signature() == b.signature(),
                _ => false,
            },
            (Some(nx), Some(ny)) => {
                let (ax, ay) = (graph.node(nx), graph.node(ny));
                graph.var(x).index == graph.var(y).index
                    && ax.op.name() == ay.op.name()
                    && ax.inputs.len() == ay.inputs.len()
                    && ax
                        .inputs
                        .clone()
                        .into_iter()
                        .zip(ay.inputs.clone())
                        .all(|(a, b)| vars_equal(graph, a, b, memo))
            }
            _ => false,
        }
    };
    memo.insert((x, y), result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_toposort_integers() {
        // 3 depends on 1 and 2, 2 depends on 1
        let deps = |n: u32| -> Option<Vec<u32>> {
            match n {
                3 => Some(vec![1, 2]),
                2 => Some(vec![1]),
                _ => None,
            }
        };
        assert_eq!(general_toposort(&[3], deps).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_general_toposort_cycle() {
        let deps = |n: u32| -> Option<Vec<u32>> { Some(vec![(n + 1) % 3]) };
        assert!(matches!(
            general_toposort(&[0], deps),
            Err(GraphError::Ordering(_))
        ));
    }

    #[test]
    fn test_missing_memo_is_an_error() {
        let compute = |n: u32, cache: &mut DepsCache<u32>| -> Option<Vec<u32>> {
            cache.insert(n, None);
            None
        };
        assert!(matches!(
            general_toposort_with_cache(&[1], compute, None, None),
            Err(GraphError::Ordering(_))
        ));
    }

    #[test]
    fn test_partial_memo_is_an_error() {
        // forgets to record node 1
        let compute = |n: u32, cache: &mut DepsCache<u32>| -> Option<Vec<u32>> {
            if n == 2 {
                cache.insert(2, Some(vec![1]));
                Some(vec![1])
            } else {
                None
            }
        };
        let mut cache = DepsCache::new();
        assert!(matches!(
            general_toposort_with_cache(&[2], compute, Some(&mut cache), None),
            Err(GraphError::Ordering(_))
        ));
    }

    #[test]
    fn test_clients_output() {
        let compute = |n: u32, cache: &mut DepsCache<u32>| -> Option<Vec<u32>> {
            let d = if n > 0 { Some(vec![n - 1]) } else { None };
            cache.insert(n, d.clone());
            d
        };
        let mut cache = DepsCache::new();
        let mut clients = HashMap::new();
        let order =
            general_toposort_with_cache(&[2], compute, Some(&mut cache), Some(&mut clients))
                .unwrap();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(clients[&0], vec![1]);
    }

    #[test]
    fn test_walk_orders() {
        let expand = |n: u32| -> Option<Vec<u32>> {
            if n < 4 {
                Some(vec![2 * n + 1, 2 * n + 2])
            } else {
                None
            }
        };
        let bfs: Vec<u32> = walk(&[0], expand, true).map(|(n, _)| n).take(5).collect();
        assert_eq!(bfs, vec![0, 1, 2, 3, 4]);
        let dfs: Vec<u32> = walk(&[0], expand, false).map(|(n, _)| n).take(3).collect();
        assert_eq!(dfs, vec![0, 2, 6]);
    }
}
