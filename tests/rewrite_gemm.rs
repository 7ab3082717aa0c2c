// Rewrite Engine Tests
//
// Gemm selection through the full `fast_run` pipeline, numerical agreement
// with a plain reference product, and equilibrium behaviour.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use symgraph::ir::fgraph::FunctionGraph;
use symgraph::link::LinkerKind;
use symgraph::ops::{blas, elemwise};
use symgraph::optimizer::{canonicalize, optimizer_from_name, EquilibriumRewriter, LocalRewriter, OptimizationPass};
use symgraph::{
    function, CompileConfig, FunctionOptions, Graph, GraphError, Mode, NodeId, ScalarType, TensorType,
    TensorValue, VarId,
};

const F64: ScalarType = ScalarType::Float64;

fn random_matrix(rng: &mut StdRng, dtype: ScalarType, rows: usize, cols: usize) -> TensorValue {
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    TensorValue::new(dtype, vec![rows, cols], data).unwrap()
}

/// Row-major product, no tricks
fn reference_dot(a: &TensorValue, b: &TensorValue) -> Vec<f64> {
    let (n, k) = (a.shape()[0], a.shape()[1]);
    let m = b.shape()[1];
    let mut out = vec![0.0; n * m];
    for i in 0..n {
        for j in 0..m {
            for p in 0..k {
                out[i * m + j] += a.data()[i * k + p] * b.data()[p * m + j];
            }
        }
    }
    out
}

fn interpreted_fast_run() -> FunctionOptions {
    FunctionOptions::default().with_mode(Mode::new("fast_run", LinkerKind::Perform))
}

fn gemm_count(names: &[String]) -> usize {
    names.iter().filter(|n| n.starts_with("Gemm")).count()
}

#[test]
fn test_scaled_product_plus_matrix_becomes_one_gemm() {
    let mut rng = StdRng::seed_from_u64(1);
    for k in [1, 2, 5] {
        let mut g = Graph::new();
        let p = g.input("P", TensorType::matrix(F64));
        let q = g.input("Q", TensorType::matrix(F64));
        let z = g.input("Z", TensorType::matrix(F64));
        let one_a = g.scalar_constant(F64, 1.0);
        let one_b = g.scalar_constant(F64, 1.0);
        let pq = blas::dot(&mut g, p, q).unwrap();
        let left = elemwise::mul(&mut g, &[one_a, pq]).unwrap();
        let right = elemwise::mul(&mut g, &[one_b, z]).unwrap();
        let out = elemwise::add(&mut g, &[left, right]).unwrap();

        let f = function(&g, &[p.into(), q.into(), z.into()], &[out], &interpreted_fast_run()).unwrap();
        let names = f.op_names();
        assert_eq!(gemm_count(&names), 1, "{:?}", names);
        assert!(!names.iter().any(|n| n == "dot" || n == "Dot22"), "{:?}", names);

        let pv = random_matrix(&mut rng, F64, 3, k);
        let qv = random_matrix(&mut rng, F64, k, 4);
        let zv = random_matrix(&mut rng, F64, 3, 4);
        let expected: Vec<f64> = reference_dot(&pv, &qv)
            .iter()
            .zip(zv.data())
            .map(|(a, b)| a + b)
            .collect();
        let result = f.call(&[pv, qv, zv]).unwrap();
        assert_eq!(result[0].shape(), &[3, 4]);
        for (got, want) in result[0].data().iter().zip(&expected) {
            assert!((got - want).abs() < 1e-8, "{} vs {}", got, want);
        }
    }
}

#[test]
fn test_nested_expression_keeps_its_value() {
    // Z - 0.5 * (P.Q + W)
    let mut rng = StdRng::seed_from_u64(2);
    let mut g = Graph::new();
    let p = g.input("P", TensorType::matrix(F64));
    let q = g.input("Q", TensorType::matrix(F64));
    let w = g.input("W", TensorType::matrix(F64));
    let z = g.input("Z", TensorType::matrix(F64));
    let half = g.scalar_constant(F64, 0.5);
    let pq = blas::dot(&mut g, p, q).unwrap();
    let inner = elemwise::add(&mut g, &[pq, w]).unwrap();
    let scaled = elemwise::mul(&mut g, &[half, inner]).unwrap();
    let out = elemwise::sub(&mut g, z, scaled).unwrap();

    let inputs = [p.into(), q.into(), w.into(), z.into()];
    let optimized = function(&g, &inputs, &[out], &interpreted_fast_run()).unwrap();
    let plain = function(
        &g,
        &inputs,
        &[out],
        &FunctionOptions::default().with_mode(Mode::new("none", LinkerKind::Perform)),
    )
    .unwrap();

    let args = vec![
        random_matrix(&mut rng, F64, 4, 3),
        random_matrix(&mut rng, F64, 3, 2),
        random_matrix(&mut rng, F64, 4, 2),
        random_matrix(&mut rng, F64, 4, 2),
    ];
    let expected = plain.call(&args).unwrap();
    let got = optimized.call(&args).unwrap();
    assert!(got[0].allclose(&expected[0], 1e-10, 1e-10), "{} vs {}", got[0], expected[0]);
}

#[test]
fn test_upcasting_scale_blocks_gemm() {
    let mut rng = StdRng::seed_from_u64(3);
    let f32m = TensorType::matrix(ScalarType::Float32);
    let mut g = Graph::new();
    let x = g.input("x", f32m.clone());
    let y = g.input("y", f32m.clone());
    let z = g.input("z", f32m);
    let a = g.input("a", TensorType::scalar(ScalarType::Int32));
    let xy = blas::dot(&mut g, x, y).unwrap();
    let scaled = elemwise::mul(&mut g, &[a, xy]).unwrap();
    let out = elemwise::add(&mut g, &[z, scaled]).unwrap();
    let out_ty = g.ty(out).clone();

    let f = function(
        &g,
        &[x.into(), y.into(), z.into(), a.into()],
        &[out],
        &interpreted_fast_run(),
    )
    .unwrap();
    assert_eq!(gemm_count(&f.op_names()), 0, "{:?}", f.op_names());

    let xv = random_matrix(&mut rng, ScalarType::Float32, 2, 3);
    let yv = random_matrix(&mut rng, ScalarType::Float32, 3, 2);
    let zv = random_matrix(&mut rng, ScalarType::Float32, 2, 2);
    let expected: Vec<f64> = reference_dot(&xv, &yv)
        .iter()
        .zip(zv.data())
        .map(|(p, z)| z + 3.0 * p)
        .collect();
    let result = f
        .call(&[xv, yv, zv, TensorValue::scalar(ScalarType::Int32, 3.0)])
        .unwrap();
    assert_eq!(result[0].dtype(), out_ty.dtype);
    for (got, want) in result[0].data().iter().zip(&expected) {
        assert!((got - want).abs() < 1e-4, "{} vs {}", got, want);
    }
}

#[test]
fn test_rewriting_twice_changes_nothing() {
    let mut g = Graph::new();
    let p = g.input("P", TensorType::matrix(F64));
    let q = g.input("Q", TensorType::matrix(F64));
    let z = g.input("Z", TensorType::matrix(F64));
    let two = g.scalar_constant(F64, 2.0);
    let pq = blas::dot(&mut g, p, q).unwrap();
    let scaled = elemwise::mul(&mut g, &[two, pq]).unwrap();
    let out = elemwise::add(&mut g, &[scaled, z]).unwrap();
    let mut fg = FunctionGraph::new(g, vec![p, q, z], vec![out]).unwrap();

    let config = CompileConfig::default();
    optimizer_from_name("fast_run", &config).unwrap().run_all(&mut fg).unwrap();
    let count = |fg: &FunctionGraph| {
        fg.toposort()
            .unwrap()
            .iter()
            .filter(|n| fg.graph().op(**n).name().starts_with("Gemm"))
            .count()
    };
    let gemms = count(&fg);
    assert_eq!(gemms, 1);

    assert!(!canonicalize(config.max_iterations).apply(&mut fg).unwrap());
    optimizer_from_name("fast_run", &config).unwrap().run_all(&mut fg).unwrap();
    assert_eq!(count(&fg), gemms);
    fg.check_integrity().unwrap();
}

/// Rebuilds every `exp` node, so a sweep never comes back clean
struct AlwaysRebuild;

impl LocalRewriter for AlwaysRebuild {
    fn name(&self) -> &str {
        "always_rebuild"
    }

    fn transform(&self, fgraph: &mut FunctionGraph, node: NodeId) -> symgraph::Result<Option<Vec<VarId>>> {
        if fgraph.graph().op(node).name() != "Elemwise{exp}" {
            return Ok(None);
        }
        let input = fgraph.graph().node(node).inputs[0];
        Ok(Some(vec![elemwise::exp(fgraph.graph_mut(), input)?]))
    }
}

#[test]
fn test_equilibrium_gives_up_after_the_cap() {
    let mut g = Graph::new();
    let x = g.input("x", TensorType::vector(F64));
    let e = elemwise::exp(&mut g, x).unwrap();
    let mut fg = FunctionGraph::new(g, vec![x], vec![e]).unwrap();

    let rewriter = EquilibriumRewriter::new("toy", 5).with_local(Arc::new(AlwaysRebuild));
    match rewriter.apply(&mut fg) {
        Err(GraphError::FixpointNotReached { rewriter, iterations }) => {
            assert_eq!(rewriter, "toy");
            assert_eq!(iterations, 5);
        }
        other => panic!("expected the cap to be hit, got {:?}", other),
    }
    // every intermediate state was a valid graph
    fg.check_integrity().unwrap();
    assert_eq!(fg.num_nodes(), 1);
}
