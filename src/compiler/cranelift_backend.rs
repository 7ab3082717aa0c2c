// Cranelift Backend: JIT compilation of elementwise kernels
//
// Lowers the scalar program of an `Elemwise` node to a flat loop
// `kernel(inputs, out, n)` over inputs already broadcast to the output shape.
// Each instruction is rounded to its dtype exactly as the interpreter rounds
// it, so both paths agree bit for bit.

use crate::compiler::backend::{Backend, NodeKernel};
use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::op::op_as;
use crate::ir::types::ScalarType;
use crate::ir::value::TensorValue;
use crate::ops::elemwise::{broadcast_shapes, Elemwise};
use crate::ops::scalar::{ScalarArg, ScalarOp, ScalarProgram};
use cranelift::codegen::ir::FuncRef;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use std::borrow::Cow;
use std::sync::Arc;

/// Arguments: (input pointers, output, element count)
type ElemwiseKernelFn = unsafe extern "C" fn(*const *const f64, *mut f64, i64);

/// Thread-safe wrapper for a finalized function pointer
/// SAFETY: JIT-compiled kernels are stateless and safe to call from any thread
#[derive(Clone, Copy)]
struct KernelPtr(*const u8);

unsafe impl Send for KernelPtr {}
unsafe impl Sync for KernelPtr {}

extern "C" fn sg_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn sg_log(x: f64) -> f64 {
    x.ln()
}

fn jit_error(err: impl std::fmt::Display) -> GraphError {
    GraphError::Compile(format!("cranelift: {}", err))
}

/// Cranelift JIT backend
#[derive(Debug, Default)]
pub struct CraneliftBackend;

impl CraneliftBackend {
    pub fn new() -> Self {
        CraneliftBackend
    }

    fn new_module() -> Result<JITModule> {
        let mut builder =
            JITBuilder::new(cranelift_module::default_libcall_names()).map_err(jit_error)?;
        builder.symbol("sg_exp", sg_exp as *const u8);
        builder.symbol("sg_log", sg_log as *const u8);
        Ok(JITModule::new(builder))
    }

    /// Compile a scalar program into a loop kernel
    pub fn compile_program(&self, program: &ScalarProgram) -> Result<JitKernel> {
        program.validate()?;
        log::debug!("jit: compiling {}", program);

        let mut module = Self::new_module()?;
        let mut unary = module.make_signature();
        unary.params.push(AbiParam::new(types::F64));
        unary.returns.push(AbiParam::new(types::F64));
        let exp_id = module
            .declare_function("sg_exp", Linkage::Import, &unary)
            .map_err(jit_error)?;
        let log_id = module
            .declare_function("sg_log", Linkage::Import, &unary)
            .map_err(jit_error)?;

        let mut ctx = module.make_context();
        let mut func_ctx = FunctionBuilderContext::new();
        let ptr_type = module.target_config().pointer_type();
        ctx.func.signature.params.push(AbiParam::new(ptr_type)); // inputs
        ctx.func.signature.params.push(AbiParam::new(ptr_type)); // out
        ctx.func.signature.params.push(AbiParam::new(types::I64)); // n

        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut func_ctx);
        let entry_block = builder.create_block();
        let loop_header = builder.create_block();
        let loop_body = builder.create_block();
        let loop_exit = builder.create_block();

        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        let ins = builder.block_params(entry_block)[0];
        let out = builder.block_params(entry_block)[1];
        let n = builder.block_params(entry_block)[2];

        // base pointer of every input, loaded once
        let bases: Vec<Value> = (0..program.n_inputs())
            .map(|k| {
                builder
                    .ins()
                    .load(ptr_type, MemFlags::trusted(), ins, (k * 8) as i32)
            })
            .collect();
        let zero = builder.ins().iconst(types::I64, 0);
        builder.ins().jump(loop_header, &[zero]);
        builder.seal_block(entry_block);

        // while i < n
        builder.switch_to_block(loop_header);
        builder.append_block_param(loop_header, types::I64);
        let i = builder.block_params(loop_header)[0];
        let cmp = builder.ins().icmp(IntCC::SignedLessThan, i, n);
        builder.ins().brif(cmp, loop_body, &[], loop_exit, &[]);

        builder.switch_to_block(loop_body);
        let offset = builder.ins().imul_imm(i, 8);
        let args: Vec<Value> = bases
            .iter()
            .map(|base| {
                let addr = builder.ins().iadd(*base, offset);
                builder.ins().load(types::F64, MemFlags::trusted(), addr, 0)
            })
            .collect();
        let exp_ref = module.declare_func_in_func(exp_id, &mut builder.func);
        let log_ref = module.declare_func_in_func(log_id, &mut builder.func);
        let result = emit_program(&mut builder, program, &args, exp_ref, log_ref)?;
        let out_addr = builder.ins().iadd(out, offset);
        builder
            .ins()
            .store(MemFlags::trusted(), result, out_addr, 0);
        let next = builder.ins().iadd_imm(i, 1);
        builder.ins().jump(loop_header, &[next]);

        builder.switch_to_block(loop_exit);
        builder.ins().return_(&[]);

        builder.seal_block(loop_header);
        builder.seal_block(loop_body);
        builder.seal_block(loop_exit);
        builder.finalize();

        let id: FuncId = module
            .declare_function("sg_kernel", Linkage::Export, &ctx.func.signature)
            .map_err(jit_error)?;
        module.define_function(id, &mut ctx).map_err(jit_error)?;
        module.clear_context(&mut ctx);
        module.finalize_definitions().map_err(jit_error)?;
        let code_ptr = module.get_finalized_function(id);
        log::trace!("jit: kernel at {:p}", code_ptr);

        // code memory outlives the module handle
        Ok(JitKernel {
            ptr: KernelPtr(code_ptr),
            n_inputs: program.n_inputs(),
            dtype: program.output_dtype(),
        })
    }
}

/// Emit the instructions of `program`, returning the final value
fn emit_program(
    builder: &mut FunctionBuilder,
    program: &ScalarProgram,
    inputs: &[Value],
    exp_ref: FuncRef,
    log_ref: FuncRef,
) -> Result<Value> {
    let mut temps: Vec<Value> = Vec::with_capacity(program.instrs.len());
    for instr in &program.instrs {
        let args: Vec<Value> = instr
            .args
            .iter()
            .map(|a| match a {
                ScalarArg::Input(k) => inputs[*k],
                ScalarArg::Temp(t) => temps[*t],
                ScalarArg::Const(c) => builder.ins().f64const(*c),
            })
            .collect();
        let raw = match instr.op {
            ScalarOp::Add => fold(builder, &args, |b, x, y| b.ins().fadd(x, y)),
            ScalarOp::Mul => fold(builder, &args, |b, x, y| b.ins().fmul(x, y)),
            ScalarOp::Sub => builder.ins().fsub(args[0], args[1]),
            ScalarOp::TrueDiv => builder.ins().fdiv(args[0], args[1]),
            ScalarOp::Neg => builder.ins().fneg(args[0]),
            ScalarOp::Abs => builder.ins().fabs(args[0]),
            ScalarOp::Sqrt => builder.ins().sqrt(args[0]),
            ScalarOp::Exp => {
                let call = builder.ins().call(exp_ref, &[args[0]]);
                builder.inst_results(call)[0]
            }
            ScalarOp::Log => {
                let call = builder.ins().call(log_ref, &[args[0]]);
                builder.inst_results(call)[0]
            }
            // `a > b ? a : b`, matching the interpreter on NaN
            ScalarOp::Maximum => {
                let c = builder.ins().fcmp(FloatCC::GreaterThan, args[0], args[1]);
                builder.ins().select(c, args[0], args[1])
            }
            ScalarOp::Minimum => {
                let c = builder.ins().fcmp(FloatCC::LessThan, args[0], args[1]);
                builder.ins().select(c, args[0], args[1])
            }
            ScalarOp::Identity | ScalarOp::Cast(_) => args[0],
            ScalarOp::Second => args[1],
        };
        temps.push(emit_round(builder, instr.dtype, raw));
    }
    temps
        .last()
        .copied()
        .ok_or_else(|| GraphError::InvalidValue("empty scalar program".to_string()))
}

fn fold(
    builder: &mut FunctionBuilder,
    args: &[Value],
    op: impl Fn(&mut FunctionBuilder, Value, Value) -> Value,
) -> Value {
    let mut acc = args[0];
    for x in &args[1..] {
        acc = op(builder, acc, *x);
    }
    acc
}

/// Same rounding as `ScalarType::round`
fn emit_round(builder: &mut FunctionBuilder, dtype: ScalarType, x: Value) -> Value {
    match dtype {
        ScalarType::Float64 => x,
        ScalarType::Float32 => {
            let narrow = builder.ins().fdemote(types::F32, x);
            builder.ins().fpromote(types::F64, narrow)
        }
        ScalarType::Bool => {
            let zero = builder.ins().f64const(0.0);
            let one = builder.ins().f64const(1.0);
            let c = builder.ins().fcmp(FloatCC::NotEqual, x, zero);
            builder.ins().select(c, one, zero)
        }
        _ => builder.ins().trunc(x),
    }
}

/// A JIT-compiled elementwise loop
#[derive(Clone)]
pub struct JitKernel {
    ptr: KernelPtr,
    n_inputs: usize,
    dtype: ScalarType,
}

impl JitKernel {
    /// Evaluate over inputs broadcast together
    pub fn execute(&self, inputs: &[&TensorValue]) -> Result<TensorValue> {
        if inputs.len() != self.n_inputs {
            return Err(GraphError::InvalidValue(format!(
                "kernel takes {} inputs, got {}",
                self.n_inputs,
                inputs.len()
            )));
        }
        let shapes: Vec<&[usize]> = inputs.iter().map(|v| v.shape()).collect();
        let shape = broadcast_shapes(&shapes)?;
        let size: usize = shape.iter().product();
        let buffers = inputs
            .iter()
            .map(|v| {
                if v.shape() == shape.as_slice() {
                    Ok(Cow::Borrowed(v.data()))
                } else {
                    v.broadcast_to(&shape).map(Cow::Owned)
                }
            })
            .collect::<Result<Vec<Cow<[f64]>>>>()?;
        let pointers: Vec<*const f64> = buffers.iter().map(|b| b.as_ptr()).collect();
        let mut out = vec![0.0f64; size];

        // SAFETY: every buffer holds `size` elements and outlives the call;
        // the kernel reads `n_inputs` pointers and writes `size` outputs.
        unsafe {
            let kernel_fn: ElemwiseKernelFn = std::mem::transmute(self.ptr.0);
            kernel_fn(pointers.as_ptr(), out.as_mut_ptr(), size as i64);
        }
        Ok(TensorValue::from_raw(self.dtype, shape, out))
    }
}

impl NodeKernel for JitKernel {
    fn run(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        outputs[0] = Some(self.execute(inputs)?);
        Ok(())
    }
}

impl Backend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_node(&self, graph: &Graph, node: NodeId) -> Result<Option<Arc<dyn NodeKernel>>> {
        let Some(elemwise) = op_as::<Elemwise>(graph.op(node)) else {
            return Ok(None);
        };
        let dtypes: Vec<ScalarType> = graph
            .node(node)
            .inputs
            .iter()
            .map(|v| graph.ty(*v).dtype)
            .collect();
        let program = elemwise.program(&dtypes)?;
        let kernel = self.compile_program(&program)?;
        Ok(Some(Arc::new(kernel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::TensorType;
    use crate::ops::elemwise;

    const F64: ScalarType = ScalarType::Float64;

    #[test]
    fn test_backend_creation() {
        let backend = CraneliftBackend::new();
        assert_eq!(backend.name(), "cranelift");
        assert!(backend.is_available());
    }

    #[test]
    fn test_single_op_kernel() {
        let program = ScalarProgram::single(ScalarOp::Add, &[F64, F64]).unwrap();
        let kernel = CraneliftBackend::new().compile_program(&program).unwrap();
        let x = TensorValue::vector(F64, vec![1.0, 2.0, 3.0]);
        let y = TensorValue::vector(F64, vec![10.0, 20.0, 30.0]);
        let out = kernel.execute(&[&x, &y]).unwrap();
        assert_eq!(out.data(), &[11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_kernel_matches_interpreter() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let b = g.input("b", TensorType::row(F64));
        let s = elemwise::add(&mut g, &[x, b]).unwrap();
        let e = elemwise::exp(&mut g, s).unwrap();
        let node = g.owner(e).unwrap();

        let xv = TensorValue::matrix(F64, &[vec![0.0, 1.0], vec![-1.0, 2.0]]).unwrap();
        let bv = TensorValue::new(F64, vec![1, 2], vec![0.5, -0.5]).unwrap();
        let sv = elemwise::run_program(
            &ScalarProgram::single(ScalarOp::Add, &[F64, F64]).unwrap(),
            &[&xv, &bv],
        )
        .unwrap();

        let kernel = CraneliftBackend::new()
            .compile_node(&g, node)
            .unwrap()
            .unwrap();
        let mut jit_out = vec![None];
        kernel.run(&[&sv], &mut jit_out).unwrap();
        let mut reference = vec![None];
        g.op(node).perform(&[&sv], &mut reference).unwrap();
        assert_eq!(jit_out[0], reference[0]);
    }

    #[test]
    fn test_integer_rounding() {
        let program = ScalarProgram::single(ScalarOp::TrueDiv, &[F64, F64]).unwrap();
        let cast = ScalarProgram::single(ScalarOp::Cast(ScalarType::Int32), &[F64]).unwrap();
        let fused = cast.inline_input(0, &program);
        let kernel = CraneliftBackend::new().compile_program(&fused).unwrap();
        let x = TensorValue::vector(F64, vec![7.0, -7.0]);
        let y = TensorValue::vector(F64, vec![2.0, 2.0]);
        let out = kernel.execute(&[&x, &y]).unwrap();
        assert_eq!(out.dtype(), ScalarType::Int32);
        assert_eq!(out.data(), &[3.0, -3.0]);
    }

    #[test]
    fn test_non_elemwise_nodes_are_skipped() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::matrix(F64));
        let t = crate::ops::transpose(&mut g, x).unwrap();
        let node = g.owner(t).unwrap();
        assert!(CraneliftBackend::new().compile_node(&g, node).unwrap().is_none());
    }
}
