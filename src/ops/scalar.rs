// Scalar Operations
//
// The per-element kernels of elementwise ops. A `ScalarProgram` is a short
// straight-line sequence of scalar instructions; a plain elementwise op is a
// one-instruction program, a fused one has several. The interpreter, the C
// generator and the JIT all evaluate the same program, rounding every
// intermediate to its dtype in the same order.

use crate::core::error::{GraphError, Result};
use crate::ir::types::ScalarType;
use std::fmt;

/// Scalar operator kinds
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarOp {
    /// Variadic sum, folded left to right
    Add,
    Sub,
    /// Variadic product, folded left to right
    Mul,
    TrueDiv,
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Maximum,
    Minimum,
    Identity,
    /// Convert to the given dtype
    Cast(ScalarType),
    /// Returns its second argument; broadcasts it to the first one's shape
    Second,
}

impl ScalarOp {
    pub fn name(&self) -> String {
        match self {
            ScalarOp::Add => "add".to_string(),
            ScalarOp::Sub => "sub".to_string(),
            ScalarOp::Mul => "mul".to_string(),
            ScalarOp::TrueDiv => "true_div".to_string(),
            ScalarOp::Neg => "neg".to_string(),
            ScalarOp::Abs => "abs".to_string(),
            ScalarOp::Sqrt => "sqrt".to_string(),
            ScalarOp::Exp => "exp".to_string(),
            ScalarOp::Log => "log".to_string(),
            ScalarOp::Maximum => "maximum".to_string(),
            ScalarOp::Minimum => "minimum".to_string(),
            ScalarOp::Identity => "identity".to_string(),
            ScalarOp::Cast(t) => format!("cast_{}", t),
            ScalarOp::Second => "second".to_string(),
        }
    }

    /// Number of arguments, None for variadic ops
    pub fn arity(&self) -> Option<usize> {
        match self {
            ScalarOp::Add | ScalarOp::Mul => None,
            ScalarOp::Sub
            | ScalarOp::TrueDiv
            | ScalarOp::Maximum
            | ScalarOp::Minimum
            | ScalarOp::Second => Some(2),
            _ => Some(1),
        }
    }

    pub fn check_arity(&self, n: usize) -> Result<()> {
        let ok = match self.arity() {
            Some(k) => n == k,
            None => n >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::TypeMismatch(format!(
                "{} does not take {} arguments",
                self.name(),
                n
            )))
        }
    }

    /// Result dtype for the given argument dtypes
    pub fn output_dtype(&self, inputs: &[ScalarType]) -> Result<ScalarType> {
        let up = ScalarType::upcast_all(inputs).ok_or_else(|| {
            GraphError::TypeMismatch(format!("{} needs at least one argument", self.name()))
        })?;
        Ok(match self {
            ScalarOp::Cast(t) => *t,
            ScalarOp::Second => inputs[inputs.len() - 1],
            ScalarOp::TrueDiv | ScalarOp::Sqrt | ScalarOp::Exp | ScalarOp::Log => {
                if up.is_float() {
                    up
                } else {
                    ScalarType::Float64
                }
            }
            ScalarOp::Neg | ScalarOp::Sub if up == ScalarType::Bool => {
                return Err(GraphError::TypeMismatch(format!(
                    "{} is not defined on bool",
                    self.name()
                )))
            }
            _ => up,
        })
    }

    /// Evaluate on f64 arguments, before rounding
    pub fn apply(&self, args: &[f64]) -> f64 {
        match self {
            ScalarOp::Add => args.iter().skip(1).fold(args[0], |acc, x| acc + x),
            ScalarOp::Mul => args.iter().skip(1).fold(args[0], |acc, x| acc * x),
            ScalarOp::Sub => args[0] - args[1],
            ScalarOp::TrueDiv => args[0] / args[1],
            ScalarOp::Neg => -args[0],
            ScalarOp::Abs => args[0].abs(),
            ScalarOp::Sqrt => args[0].sqrt(),
            ScalarOp::Exp => args[0].exp(),
            ScalarOp::Log => args[0].ln(),
            ScalarOp::Maximum => {
                if args[0] > args[1] {
                    args[0]
                } else {
                    args[1]
                }
            }
            ScalarOp::Minimum => {
                if args[0] < args[1] {
                    args[0]
                } else {
                    args[1]
                }
            }
            ScalarOp::Identity | ScalarOp::Cast(_) => args[0],
            ScalarOp::Second => args[1],
        }
    }

    /// C expression over argument expressions, before rounding
    pub fn c_expr(&self, args: &[String]) -> String {
        match self {
            ScalarOp::Add => format!("({})", args.join(" + ")),
            ScalarOp::Mul => format!("({})", args.join(" * ")),
            ScalarOp::Sub => format!("({} - {})", args[0], args[1]),
            ScalarOp::TrueDiv => format!("({} / {})", args[0], args[1]),
            ScalarOp::Neg => format!("(-{})", args[0]),
            ScalarOp::Abs => format!("fabs({})", args[0]),
            ScalarOp::Sqrt => format!("sqrt({})", args[0]),
            ScalarOp::Exp => format!("exp({})", args[0]),
            ScalarOp::Log => format!("log({})", args[0]),
            ScalarOp::Maximum => format!("({0} > {1} ? {0} : {1})", args[0], args[1]),
            ScalarOp::Minimum => format!("({0} < {1} ? {0} : {1})", args[0], args[1]),
            ScalarOp::Identity | ScalarOp::Cast(_) => args[0].clone(),
            ScalarOp::Second => args[1].clone(),
        }
    }
}

impl fmt::Display for ScalarOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// C expression rounding `expr` to `dtype`
pub fn c_round(dtype: ScalarType, expr: &str) -> String {
    match dtype {
        ScalarType::Float64 => expr.to_string(),
        ScalarType::Float32 => format!("((double)(float)({}))", expr),
        ScalarType::Bool => format!("(({}) != 0.0 ? 1.0 : 0.0)", expr),
        _ => format!("trunc({})", expr),
    }
}

/// C literal for an f64 that round-trips exactly
pub fn c_literal(x: f64) -> String {
    if x.is_nan() {
        "NAN".to_string()
    } else if x.is_infinite() {
        if x > 0.0 {
            "INFINITY".to_string()
        } else {
            "(-INFINITY)".to_string()
        }
    } else {
        let s = format!("{:?}", x);
        if s.contains('.') || s.contains('e') {
            s
        } else {
            format!("{}.0", s)
        }
    }
}

/// Argument of a scalar instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    /// Program input
    Input(usize),
    /// Result of an earlier instruction
    Temp(usize),
    Const(f64),
}

impl fmt::Display for ScalarArg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarArg::Input(i) => write!(f, "i{}", i),
            ScalarArg::Temp(t) => write!(f, "t{}", t),
            ScalarArg::Const(c) => write!(f, "{:?}", c),
        }
    }
}

/// One instruction; the result is rounded to `dtype`
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarInstr {
    pub op: ScalarOp,
    pub args: Vec<ScalarArg>,
    pub dtype: ScalarType,
}

/// Straight-line scalar program; the last instruction is the result
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarProgram {
    pub input_dtypes: Vec<ScalarType>,
    pub instrs: Vec<ScalarInstr>,
}

impl ScalarProgram {
    /// Program applying `op` to its inputs in order
    pub fn single(op: ScalarOp, input_dtypes: &[ScalarType]) -> Result<Self> {
        op.check_arity(input_dtypes.len())?;
        let dtype = op.output_dtype(input_dtypes)?;
        Ok(ScalarProgram {
            input_dtypes: input_dtypes.to_vec(),
            instrs: vec![ScalarInstr {
                op,
                args: (0..input_dtypes.len()).map(ScalarArg::Input).collect(),
                dtype,
            }],
        })
    }

    pub fn n_inputs(&self) -> usize {
        self.input_dtypes.len()
    }

    pub fn output_dtype(&self) -> ScalarType {
        self.instrs
            .last()
            .map(|i| i.dtype)
            .unwrap_or(ScalarType::Float64)
    }

    /// Check argument references and arities
    pub fn validate(&self) -> Result<()> {
        if self.instrs.is_empty() {
            return Err(GraphError::InvalidValue("empty scalar program".to_string()));
        }
        for (k, instr) in self.instrs.iter().enumerate() {
            instr.op.check_arity(instr.args.len())?;
            for arg in &instr.args {
                let ok = match arg {
                    ScalarArg::Input(i) => *i < self.n_inputs(),
                    ScalarArg::Temp(t) => *t < k,
                    ScalarArg::Const(_) => true,
                };
                if !ok {
                    return Err(GraphError::InvalidValue(format!(
                        "instruction {} has a dangling argument {}",
                        k, arg
                    )));
                }
            }
        }
        Ok(())
    }

    /// Evaluate on one element; `temps` is scratch space
    pub fn eval(&self, inputs: &[f64], temps: &mut Vec<f64>) -> f64 {
        temps.clear();
        let mut args: Vec<f64> = Vec::with_capacity(4);
        for instr in &self.instrs {
            args.clear();
            args.extend(instr.args.iter().map(|a| match a {
                ScalarArg::Input(i) => inputs[*i],
                ScalarArg::Temp(t) => temps[*t],
                ScalarArg::Const(c) => *c,
            }));
            temps.push(instr.dtype.round(instr.op.apply(&args)));
        }
        temps.last().copied().unwrap_or(0.0)
    }

    /// C statements computing the program into `out` (an lvalue)
    pub fn c_body(&self, inputs: &[String], out: &str, prefix: &str) -> String {
        let mut code = String::new();
        for (k, instr) in self.instrs.iter().enumerate() {
            let args: Vec<String> = instr
                .args
                .iter()
                .map(|a| match a {
                    ScalarArg::Input(i) => inputs[*i].clone(),
                    ScalarArg::Temp(t) => format!("{}{}", prefix, t),
                    ScalarArg::Const(c) => c_literal(*c),
                })
                .collect();
            code.push_str(&format!(
                "double {}{} = {};\n",
                prefix,
                k,
                c_round(instr.dtype, &instr.op.c_expr(&args))
            ));
        }
        code.push_str(&format!("{} = {}{};\n", out, prefix, self.instrs.len() - 1));
        code
    }

    /// Splice `producer` into this program in place of input `index`.
    ///
    /// The producer's inputs are appended after this program's remaining
    /// inputs. Repeated variables are left to `merge_inputs`.
    pub fn inline_input(&self, index: usize, producer: &ScalarProgram) -> ScalarProgram {
        let kept: Vec<usize> = (0..self.n_inputs()).filter(|i| *i != index).collect();
        let mut input_dtypes: Vec<ScalarType> = kept.iter().map(|i| self.input_dtypes[*i]).collect();
        let producer_base = input_dtypes.len();
        input_dtypes.extend(producer.input_dtypes.iter().copied());

        let mut instrs = Vec::with_capacity(producer.instrs.len() + self.instrs.len());
        for instr in &producer.instrs {
            instrs.push(ScalarInstr {
                op: instr.op,
                args: instr
                    .args
                    .iter()
                    .map(|a| match a {
                        ScalarArg::Input(i) => ScalarArg::Input(producer_base + i),
                        other => *other,
                    })
                    .collect(),
                dtype: instr.dtype,
            });
        }
        let produced = ScalarArg::Temp(producer.instrs.len() - 1);
        let shift = producer.instrs.len();
        for instr in &self.instrs {
            instrs.push(ScalarInstr {
                op: instr.op,
                args: instr
                    .args
                    .iter()
                    .map(|a| match a {
                        ScalarArg::Input(i) if *i == index => produced,
                        ScalarArg::Input(i) => {
                            ScalarArg::Input(kept.iter().position(|k| k == i).unwrap_or(0))
                        }
                        ScalarArg::Temp(t) => ScalarArg::Temp(t + shift),
                        other => *other,
                    })
                    .collect(),
                dtype: instr.dtype,
            });
        }
        ScalarProgram {
            input_dtypes,
            instrs,
        }
    }

    /// Merge inputs `a` and `b` (b > a) that carry the same variable
    pub fn merge_inputs(&self, a: usize, b: usize) -> ScalarProgram {
        let remap = |i: usize| -> usize {
            if i == b {
                a
            } else if i > b {
                i - 1
            } else {
                i
            }
        };
        let mut input_dtypes = self.input_dtypes.clone();
        input_dtypes.remove(b);
        ScalarProgram {
            input_dtypes,
            instrs: self
                .instrs
                .iter()
                .map(|instr| ScalarInstr {
                    op: instr.op,
                    args: instr
                        .args
                        .iter()
                        .map(|arg| match arg {
                            ScalarArg::Input(i) => ScalarArg::Input(remap(*i)),
                            other => *other,
                        })
                        .collect(),
                    dtype: instr.dtype,
                })
                .collect(),
        }
    }
}

impl fmt::Display for ScalarProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let parts: Vec<String> = self
            .instrs
            .iter()
            .enumerate()
            .map(|(k, instr)| {
                let args: Vec<String> = instr.args.iter().map(|a| a.to_string()).collect();
                format!("t{}={}<{}>({})", k, instr.op, instr.dtype, args.join(", "))
            })
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ScalarType::*;

    #[test]
    fn test_output_dtype() {
        assert_eq!(ScalarOp::Add.output_dtype(&[Int32, Float32]).unwrap(), Float64);
        assert_eq!(ScalarOp::TrueDiv.output_dtype(&[Int32, Int32]).unwrap(), Float64);
        assert_eq!(ScalarOp::Cast(Int8).output_dtype(&[Float64]).unwrap(), Int8);
        assert!(ScalarOp::Neg.output_dtype(&[Bool]).is_err());
    }

    #[test]
    fn test_single_program_eval() {
        let p = ScalarProgram::single(ScalarOp::Sub, &[Float64, Float64]).unwrap();
        let mut temps = Vec::new();
        assert_eq!(p.eval(&[5.0, 2.0], &mut temps), 3.0);
        assert!(ScalarProgram::single(ScalarOp::Sub, &[Float64]).is_err());
    }

    #[test]
    fn test_inline_input() {
        // consumer: i0 * i1, producer: i0 + i1 feeding consumer input 1
        let mul = ScalarProgram::single(ScalarOp::Mul, &[Float64, Float64]).unwrap();
        let add = ScalarProgram::single(ScalarOp::Add, &[Float64, Float64]).unwrap();
        let fused = mul.inline_input(1, &add);
        fused.validate().unwrap();
        assert_eq!(fused.n_inputs(), 3);
        let mut temps = Vec::new();
        // x * (y + z) with x=2, y=3, z=4
        assert_eq!(fused.eval(&[2.0, 3.0, 4.0], &mut temps), 14.0);

        // same variable feeding inputs 0 and 2
        let merged = fused.merge_inputs(0, 2);
        assert_eq!(merged.n_inputs(), 2);
        assert_eq!(merged.eval(&[2.0, 3.0], &mut temps), 10.0);
    }

    #[test]
    fn test_rounding_per_instruction() {
        let p = ScalarProgram {
            input_dtypes: vec![Float64],
            instrs: vec![
                ScalarInstr {
                    op: ScalarOp::Cast(Int32),
                    args: vec![ScalarArg::Input(0)],
                    dtype: Int32,
                },
                ScalarInstr {
                    op: ScalarOp::Mul,
                    args: vec![ScalarArg::Temp(0), ScalarArg::Const(0.5)],
                    dtype: Float64,
                },
            ],
        };
        let mut temps = Vec::new();
        assert_eq!(p.eval(&[3.9], &mut temps), 1.5);
    }

    #[test]
    fn test_c_body() {
        let p = ScalarProgram::single(ScalarOp::Maximum, &[Float32, Float32]).unwrap();
        let code = p.c_body(&["a".to_string(), "b".to_string()], "out[0]", "t");
        assert!(code.contains("double t0 = ((double)(float)((a > b ? a : b)));"));
        assert!(code.ends_with("out[0] = t0;\n"));
        assert_eq!(c_literal(4.12345678), "4.12345678");
        assert_eq!(c_literal(2.0), "2.0");
    }
}
