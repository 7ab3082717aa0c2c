// End-to-End Tests
//
// Graphs assembled with the builder, compiled under each mode and called,
// including from several threads at once.

use std::sync::Arc;
use std::thread;
use symgraph::ir::builder::GraphBuilder;
use symgraph::link::LinkerKind;
use symgraph::{
    function, FunctionOptions, GraphError, In, Mode, ScalarType, TensorType, TensorValue,
    UnusedInputPolicy,
};

const F64: ScalarType = ScalarType::Float64;

/// softplus-ish: log(exp(X.W) + 1) summed per row, plus a bias
fn scoring_graph() -> symgraph::ir::builder::BuiltGraph {
    let mut b = GraphBuilder::new();
    let x = b.input_matrix("X", F64).unwrap();
    let w = b.input_matrix("W", F64).unwrap();
    let bias = b.input_scalar("bias", F64).unwrap();
    let xw = b.dot(x, w).unwrap();
    let e = b.exp(xw).unwrap();
    let one = b.scalar(F64, 1.0);
    let shifted = b.add(e, one).unwrap();
    let l = b.log(shifted).unwrap();
    let rows = b.sum(l, Some(vec![1])).unwrap();
    let out = b.add(rows, bias).unwrap();
    b.output(out).unwrap();
    b.build()
}

fn scoring_args() -> Vec<TensorValue> {
    vec![
        TensorValue::matrix(F64, &[vec![0.5, -1.0], vec![2.0, 0.0], vec![-0.5, 0.25]]).unwrap(),
        TensorValue::matrix(F64, &[vec![1.0, 0.0, -1.0], vec![0.5, 2.0, 0.0]]).unwrap(),
        TensorValue::scalar(F64, 0.75),
    ]
}

fn scoring_expected() -> Vec<f64> {
    let args = scoring_args();
    let (x, w) = (args[0].data(), args[1].data());
    (0..3)
        .map(|i| {
            let row: f64 = (0..3)
                .map(|j| {
                    let xw: f64 = (0..2).map(|k| x[i * 2 + k] * w[k * 3 + j]).sum();
                    (xw.exp() + 1.0).ln()
                })
                .sum();
            row + 0.75
        })
        .collect()
}

#[test]
fn test_every_mode_computes_the_same_scores() {
    let built = scoring_graph();
    let inputs: Vec<In> = built.inputs.iter().map(|v| In::new(*v)).collect();
    let expected = TensorValue::vector(F64, scoring_expected());
    let modes = vec![
        Mode::fast_compile(),
        Mode::fast_run(),
        Mode::debug(),
        Mode::new("fast_run", LinkerKind::OpWiseJit),
        Mode::new("canonicalize", LinkerKind::PerformCheckShapes),
    ];
    for mode in modes {
        let options = FunctionOptions::default().with_mode(mode.clone());
        let f = function(&built.graph, &inputs, &built.outputs, &options).unwrap();
        let out = f.call(&scoring_args()).unwrap();
        assert!(out[0].allclose(&expected, 1e-10, 1e-12), "{}: {} vs {}", mode, out[0], expected);
        assert!(f.build_state().is_built(), "{}", mode);
    }
}

#[test]
fn test_named_modes_and_unknown_profiles() {
    for name in ["fast_run", "fast_compile", "debug"] {
        assert!(Mode::named(name).is_ok(), "{}", name);
    }
    let built = scoring_graph();
    let inputs: Vec<In> = built.inputs.iter().map(|v| In::new(*v)).collect();
    let options = FunctionOptions::default().with_mode(Mode::new("o3", LinkerKind::Perform));
    assert!(matches!(
        function(&built.graph, &inputs, &built.outputs, &options),
        Err(GraphError::InvalidValue(_))
    ));
}

#[test]
fn test_unused_input_policy() {
    let mut b = GraphBuilder::new();
    let x = b.input_vector("x", F64).unwrap();
    let spare = b.input_vector("spare", F64).unwrap();
    let out = b.neg(x).unwrap();
    b.output(out).unwrap();
    let built = b.build();
    let inputs = [In::new(x), In::new(spare)];

    let raise = FunctionOptions::default().with_mode(Mode::fast_compile());
    match function(&built.graph, &inputs, &built.outputs, &raise) {
        Err(GraphError::UnusedInput(msg)) => assert!(msg.contains("spare"), "{}", msg),
        other => panic!("expected an unused input error, got {:?}", other),
    }

    let ignore = raise.with_unused_input(UnusedInputPolicy::Ignore);
    let f = function(&built.graph, &inputs, &built.outputs, &ignore).unwrap();
    let out = f
        .call(&[TensorValue::vector(F64, vec![1.0]), TensorValue::vector(F64, vec![9.0, 9.0])])
        .unwrap();
    assert_eq!(out[0].data(), &[-1.0]);
}

#[test]
fn test_downcast_needs_permission() {
    let mut b = GraphBuilder::new();
    let x = b.input_vector("x", ScalarType::Float32).unwrap();
    let out = b.neg(x).unwrap();
    b.output(out).unwrap();
    let built = b.build();
    let args = [TensorValue::vector(F64, vec![0.1, 2.0])];

    let strict = FunctionOptions::default().with_mode(Mode::fast_compile());
    let f = function(&built.graph, &[x.into()], &built.outputs, &strict).unwrap();
    match f.call(&args) {
        Err(GraphError::TypeMismatch(msg)) => assert!(msg.starts_with("argument 0"), "{}", msg),
        other => panic!("expected a type mismatch, got {:?}", other),
    }
    // widening is always fine
    let ints = TensorValue::vector(ScalarType::Int8, vec![3.0, -4.0]);
    assert_eq!(f.call(&[ints]).unwrap()[0].data(), &[-3.0, 4.0]);

    let lenient = FunctionOptions {
        allow_input_downcast: true,
        ..strict
    };
    let f = function(&built.graph, &[x.into()], &built.outputs, &lenient).unwrap();
    let out = f.call(&args).unwrap();
    assert_eq!(out[0].dtype(), ScalarType::Float32);
    assert_eq!(out[0].data()[0], -(0.1f32 as f64));
}

#[test]
fn test_one_function_many_threads() {
    let built = scoring_graph();
    let inputs: Vec<In> = built.inputs.iter().map(|v| In::new(*v)).collect();
    let options = FunctionOptions::default().with_mode(Mode::new("fast_run", LinkerKind::OpWiseJit));
    let f = Arc::new(function(&built.graph, &inputs, &built.outputs, &options).unwrap());
    let expected = scoring_expected();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let mut args = scoring_args();
                args[2] = TensorValue::scalar(F64, t as f64);
                let mut storage = f.new_storage();
                let mut last = Vec::new();
                for _ in 0..10 {
                    last = f.call_with_storage(&mut storage, &args).unwrap();
                }
                last.remove(0)
            })
        })
        .collect();
    for (t, handle) in handles.into_iter().enumerate() {
        let out = handle.join().unwrap();
        for (got, want) in out.data().iter().zip(&expected) {
            assert!((got - (want - 0.75 + t as f64)).abs() < 1e-10);
        }
    }
}

#[test]
fn test_outputs_can_be_inputs_and_repeats() {
    let mut b = GraphBuilder::new();
    let x = b.input_vector("x", F64).unwrap();
    let e = b.exp(x).unwrap();
    b.output(x).unwrap();
    b.output(e).unwrap();
    b.output(e).unwrap();
    let built = b.build();
    let f = function(
        &built.graph,
        &[x.into()],
        &built.outputs,
        &FunctionOptions::default().with_mode(Mode::fast_run()),
    )
    .unwrap();
    let out = f.call(&[TensorValue::vector(F64, vec![0.0])]).unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].data(), &[0.0]);
    assert_eq!(out[1], out[2]);
    assert_eq!(out[1].data(), &[1.0]);
    assert_eq!(f.inputs().len(), 1);
    assert_eq!(TensorType::vector(F64), *f.graph().ty(f.inputs()[0]));
}
