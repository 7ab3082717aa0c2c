// In-place and Destroy Handling Tests
//
// Which buffers may be overwritten, how readers get ordered around a
// destroyer, and what a caller sees in its storage arena afterwards.

use std::sync::Arc;
use symgraph::ir::destroy::DestroyHandler;
use symgraph::ir::op::OpRef;
use symgraph::link::LinkerKind;
use symgraph::ops::{blas, elemwise, Elemwise, ScalarOp};
use symgraph::{
    function, FunctionGraph, FunctionOptions, Graph, GraphError, In, Mode, ScalarType, TensorType,
    TensorValue, VarId,
};

const F64: ScalarType = ScalarType::Float64;

struct GemmInputs {
    graph: Graph,
    z: VarId,
    x: VarId,
    y: VarId,
    one: VarId,
}

fn gemm_inputs() -> GemmInputs {
    let mut graph = Graph::new();
    let z = graph.input("Z", TensorType::matrix(F64));
    let x = graph.input("X", TensorType::matrix(F64));
    let y = graph.input("Y", TensorType::matrix(F64));
    let one = graph.scalar_constant(F64, 1.0);
    GemmInputs { graph, z, x, y, one }
}

fn interpreted_fast_run() -> FunctionOptions {
    FunctionOptions::default().with_mode(Mode::new("fast_run", LinkerKind::Perform))
}

#[test]
fn test_gemm_cannot_read_the_buffer_it_overwrites() {
    let GemmInputs { mut graph, z, one, .. } = gemm_inputs();
    let err = blas::gemm_inplace(&mut graph, z, one, z, z, one).unwrap_err();
    assert!(err.is_inconsistency(), "{:?}", err);
}

#[test]
fn test_protected_input_cannot_be_destroyed() {
    let GemmInputs { mut graph, z, x, y, one } = gemm_inputs();
    let out = blas::gemm_inplace(&mut graph, z, one, x, y, one).unwrap();
    let mut fg = FunctionGraph::new(graph, vec![z, x, y], vec![out]).unwrap();
    let err = fg
        .attach_feature(Box::new(DestroyHandler::new(Vec::<VarId>::new())))
        .unwrap_err();
    assert!(matches!(err, GraphError::Inconsistency(ref msg) if msg.contains("protected")), "{:?}", err);
}

#[test]
fn test_reader_after_the_destroyer_is_rejected() {
    // Z is read by a node that needs the gemm result, so it cannot run first
    let GemmInputs { mut graph, z, x, y, one } = gemm_inputs();
    let gz = blas::gemm_inplace(&mut graph, z, one, x, y, one).unwrap();
    let out = elemwise::add(&mut graph, &[gz, z]).unwrap();
    let mut fg = FunctionGraph::new(graph, vec![z, x, y], vec![out]).unwrap();
    let err = fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap_err();
    assert!(err.is_inconsistency(), "{:?}", err);
}

#[test]
fn test_independent_reader_runs_before_the_destroyer() {
    let GemmInputs { mut graph, z, x, y, one } = gemm_inputs();
    let read = elemwise::exp(&mut graph, z).unwrap();
    let gz = blas::gemm_inplace(&mut graph, z, one, x, y, one).unwrap();
    let reader = graph.owner(read).unwrap();
    let destroyer = graph.owner(gz).unwrap();
    let mut fg = FunctionGraph::new(graph, vec![z, x, y], vec![gz, read]).unwrap();
    fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap();

    let order = fg.toposort().unwrap();
    let position = |n| order.iter().position(|m| *m == n).unwrap();
    assert!(position(reader) < position(destroyer), "{:?}", order);
}

#[test]
fn test_two_destroyers_of_one_buffer_are_rejected() {
    let GemmInputs { mut graph, z, x, y, one } = gemm_inputs();
    let gz = blas::gemm_inplace(&mut graph, z, one, x, y, one).unwrap();
    let neg: OpRef = Arc::new(Elemwise::new(ScalarOp::Neg).with_inplace(0));
    let nz = graph.apply1(neg, &[z]).unwrap();
    let mut fg = FunctionGraph::new(graph, vec![z, x, y], vec![gz, nz]).unwrap();
    let err = fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap_err();
    assert!(err.is_inconsistency(), "{:?}", err);
}

#[test]
fn test_destroyed_output_is_rejected() {
    let GemmInputs { mut graph, z, x, y, one } = gemm_inputs();
    let gz = blas::gemm_inplace(&mut graph, z, one, x, y, one).unwrap();
    let mut fg = FunctionGraph::new(graph, vec![z, x, y], vec![gz, z]).unwrap();
    let err = fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap_err();
    assert!(err.is_inconsistency(), "{:?}", err);
}

#[test]
fn test_second_destroy_handler_is_refused() {
    let GemmInputs { graph, z, .. } = gemm_inputs();
    let mut fg = FunctionGraph::new(graph, vec![z], vec![z]).unwrap();
    fg.attach_feature(Box::new(DestroyHandler::new([z]))).unwrap();
    assert!(fg.attach_feature(Box::new(DestroyHandler::new([z]))).is_err());
}

fn product_plus_z() -> (Graph, [VarId; 3], VarId) {
    let mut g = Graph::new();
    let z = g.input("Z", TensorType::matrix(F64));
    let x = g.input("X", TensorType::matrix(F64));
    let y = g.input("Y", TensorType::matrix(F64));
    let xy = blas::dot(&mut g, x, y).unwrap();
    let out = elemwise::add(&mut g, &[z, xy]).unwrap();
    (g, [z, x, y], out)
}

fn product_args() -> Vec<TensorValue> {
    vec![
        TensorValue::matrix(F64, &[vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap(),
        TensorValue::matrix(F64, &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap(),
        TensorValue::matrix(F64, &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap(),
    ]
}

#[test]
fn test_mutable_input_is_overwritten_in_the_arena() {
    let (g, [z, x, y], out) = product_plus_z();
    let inputs = [In::mutable(z), In::new(x), In::new(y)];
    let f = function(&g, &inputs, &[out], &interpreted_fast_run()).unwrap();
    assert!(f.op_names().contains(&"Gemm{inplace}".to_string()), "{:?}", f.op_names());

    let mut storage = f.new_storage();
    let result = f.call_with_storage(&mut storage, &product_args()).unwrap();
    let expected = TensorValue::matrix(F64, &[vec![2.0, 3.0], vec![4.0, 5.0]]).unwrap();
    assert_eq!(result[0], expected);

    let z_cell = f.plan().input_cells()[0];
    assert_eq!(storage.get(z_cell), Some(&expected));
}

#[test]
fn test_protected_input_keeps_its_value() {
    let (g, [z, x, y], out) = product_plus_z();
    let f = function(&g, &[z.into(), x.into(), y.into()], &[out], &interpreted_fast_run()).unwrap();
    assert!(f.op_names().contains(&"Gemm{no_inplace}".to_string()), "{:?}", f.op_names());

    let args = product_args();
    let mut storage = f.new_storage();
    let result = f.call_with_storage(&mut storage, &args).unwrap();
    assert_eq!(result[0], TensorValue::matrix(F64, &[vec![2.0, 3.0], vec![4.0, 5.0]]).unwrap());
    let z_cell = f.plan().input_cells()[0];
    assert_eq!(storage.get(z_cell), Some(&args[0]));
}

#[test]
fn test_shared_intermediate_overwritten_at_most_once() {
    // e feeds two elementwise readers; only one may take its buffer
    let mut g = Graph::new();
    let x = g.input("x", TensorType::vector(F64));
    let e = elemwise::exp(&mut g, x).unwrap();
    let n = elemwise::neg(&mut g, e).unwrap();
    let s = elemwise::sqrt(&mut g, e).unwrap();
    let f = function(&g, &[x.into()], &[n, s], &interpreted_fast_run()).unwrap();
    let names = f.op_names();
    let inplace = names.iter().filter(|n| n.contains("[inplace:")).count();
    assert!(inplace <= 1, "{:?}", names);

    let result = f.call(&[TensorValue::vector(F64, vec![0.0, 2.0_f64.ln()])]).unwrap();
    assert!(result[0].allclose(&TensorValue::vector(F64, vec![-1.0, -2.0]), 1e-12, 1e-12));
    assert!(result[1].allclose(&TensorValue::vector(F64, vec![1.0, 2.0_f64.sqrt()]), 1e-12, 1e-12));
}
