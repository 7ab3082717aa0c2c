// Graph IR and Traversal Tests
//
// Builds small graphs by hand and checks ordering, printing and cloning.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use symgraph::ir::graph::CloneOptions;
use symgraph::ir::printing::as_string;
use symgraph::ir::traversal::{ancestors, applys_between, equal_computations, io_toposort, is_in_ancestors};
use symgraph::ops::{elemwise, sum};
use symgraph::{Graph, NodeId, ScalarType, TensorType, VarId};
use std::collections::{HashMap, HashSet};

const F64: ScalarType = ScalarType::Float64;

fn vector(g: &mut Graph, name: &str) -> VarId {
    g.input(name, TensorType::vector(F64))
}

#[test]
fn test_shared_input_orders_single_node() {
    // o1 = f(r1, r1)
    let mut g = Graph::new();
    let r1 = vector(&mut g, "r1");
    let o1 = elemwise::add(&mut g, &[r1, r1]).unwrap();
    let order = io_toposort(&g, &[r1], &[o1]);
    assert_eq!(order, vec![g.owner(o1).unwrap()]);
}

#[test]
fn test_toposort_respects_dependencies_on_random_dags() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let mut g = Graph::new();
        let inputs: Vec<VarId> = (0..3).map(|i| vector(&mut g, &format!("x{}", i))).collect();
        let mut pool = inputs.clone();
        for _ in 0..rng.gen_range(5..25) {
            let a = pool[rng.gen_range(0..pool.len())];
            let b = pool[rng.gen_range(0..pool.len())];
            let v = if rng.gen_bool(0.5) {
                elemwise::add(&mut g, &[a, b]).unwrap()
            } else {
                elemwise::mul(&mut g, &[a, b]).unwrap()
            };
            pool.push(v);
        }
        let outputs = vec![pool[pool.len() - 1], pool[pool.len() / 2]];
        let order = io_toposort(&g, &inputs, &outputs);

        let position: HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        assert_eq!(position.len(), order.len(), "a node appears twice");
        for node in &order {
            for input in &g.node(*node).inputs {
                if let Some(dep) = g.owner(*input) {
                    assert!(position[&dep] < position[node]);
                }
            }
        }
        let reachable: HashSet<NodeId> = applys_between(&g, &inputs, &outputs).into_iter().collect();
        assert_eq!(reachable, position.keys().copied().collect());
    }
}

#[test]
fn test_shared_subexpressions_print_once() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x");
    let e = elemwise::exp(&mut g, x).unwrap();
    let out = elemwise::add(&mut g, &[e, e]).unwrap();
    assert_eq!(
        as_string(&g, &[x], &[out]),
        vec!["Elemwise{add}(*1 -> Elemwise{exp}(x), *1)".to_string()]
    );
}

#[test]
fn test_clone_is_isomorphic_and_unshared() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x");
    let y = vector(&mut g, "y");
    let two = g.scalar_constant(F64, 2.0);
    let s = elemwise::add(&mut g, &[x, y]).unwrap();
    let m = elemwise::mul(&mut g, &[s, two]).unwrap();
    let out = sum(&mut g, m, None).unwrap();

    let before = as_string(&g, &[x, y], &[out]);
    let cloned = g.clone_subgraph(&[x, y], &[out], CloneOptions::default()).unwrap();
    assert_eq!(as_string(&g, &cloned.inputs, &cloned.outputs), before);

    let original: HashSet<NodeId> = applys_between(&g, &[x, y], &[out]).into_iter().collect();
    let copies: HashSet<NodeId> = applys_between(&g, &cloned.inputs, &cloned.outputs)
        .into_iter()
        .collect();
    assert!(original.is_disjoint(&copies));
    assert_eq!(cloned.memo[&two], two);
    assert!(equal_computations(&g, &[out], &cloned.outputs, &[x, y], &cloned.inputs).unwrap());
}

#[test]
fn test_ancestors_stop_at_blockers() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x");
    let e = elemwise::exp(&mut g, x).unwrap();
    let n = elemwise::neg(&mut g, e).unwrap();

    let all: HashSet<VarId> = ancestors(&g, &[n], &[]).collect();
    assert_eq!(all, [x, e, n].into_iter().collect());
    let blocked: HashSet<VarId> = ancestors(&g, &[n], &[e]).collect();
    assert_eq!(blocked, [e, n].into_iter().collect());

    // lazy: taking one item does not walk the rest
    assert_eq!(ancestors(&g, &[n], &[]).next(), Some(n));
    assert!(is_in_ancestors(&g, g.owner(n).unwrap(), g.owner(e).unwrap()));
    assert!(!is_in_ancestors(&g, g.owner(e).unwrap(), g.owner(n).unwrap()));
}
