// C Back End
//
// Drives the system C compiler over generated translation units and loads the
// resulting shared objects. `CModule::run` is the one place where Rust buffers
// cross into generated code.

use crate::compiler::backend::{Backend, NodeKernel};
use crate::compiler::cache::{CacheKey, ModuleCache};
use crate::compiler::codegen::{self, CStep, ENTRY_SYMBOL, ERROR_MSG_LEN};
use crate::config::CompileConfig;
use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::shape::Shape;
use crate::ir::value::TensorValue;
use libloading::Library;
use std::collections::HashMap;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Mirror of `sg_array` in the generated prelude
#[repr(C)]
pub struct SgArray {
    pub data: *mut f64,
    pub ndim: i64,
    pub shape: *const i64,
    pub size: i64,
}

/// Mirror of `sg_error` in the generated prelude
#[repr(C)]
pub struct SgError {
    pub node: i64,
    pub msg: [c_char; ERROR_MSG_LEN],
}

type EntryFn = unsafe extern "C" fn(*mut SgArray, i64, *mut SgError) -> i32;

lazy_static::lazy_static! {
    /// `--version` banner per compiler executable
    static ref VERSIONS: Mutex<HashMap<String, std::result::Result<String, String>>> =
        Mutex::new(HashMap::new());
}

/// A C compiler executable and the flags it is run with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CCompiler {
    cc: String,
    flags: Vec<String>,
}

impl CCompiler {
    pub fn new(cc: impl Into<String>, flags: Vec<String>) -> Self {
        CCompiler {
            cc: cc.into(),
            flags,
        }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        CCompiler::new(config.cc.clone(), config.compiler_flags())
    }

    pub fn cc(&self) -> &str {
        &self.cc
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    /// First line of `cc --version`, probed once per executable
    pub fn version(&self) -> Result<String> {
        let mut versions = VERSIONS.lock().unwrap_or_else(|e| e.into_inner());
        let entry = versions.entry(self.cc.clone()).or_insert_with(|| {
            match Command::new(&self.cc).arg("--version").output() {
                Ok(output) if output.status.success() => {
                    let banner = String::from_utf8_lossy(&output.stdout);
                    Ok(banner.lines().next().unwrap_or("").trim().to_string())
                }
                Ok(output) => Err(format!(
                    "{} --version exited with {}",
                    self.cc, output.status
                )),
                Err(err) => Err(format!("cannot run {}: {}", self.cc, err)),
            }
        });
        entry.clone().map_err(GraphError::Compile)
    }

    pub fn is_available(&self) -> bool {
        self.version().is_ok()
    }

    /// Compile `src` into the shared object `out`
    pub fn compile(&self, src: &Path, out: &Path) -> Result<()> {
        log::info!("compiling {} with {}", src.display(), self.cc);
        let output = Command::new(&self.cc)
            .args(&self.flags)
            .arg("-o")
            .arg(out)
            .arg(src)
            .arg("-lm")
            .output()
            .map_err(|err| GraphError::Compile(format!("cannot run {}: {}", self.cc, err)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GraphError::Compile(format!(
                "{} failed on {}: {}",
                self.cc,
                src.display(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Failure reported by a generated module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    /// Step that failed; None when the call itself was malformed
    pub step: Option<usize>,
    pub message: String,
}

/// A loaded module exposing `sg_entry`
pub struct CModule {
    _lib: Library,
    entry: EntryFn,
    path: PathBuf,
}

impl std::fmt::Debug for CModule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CModule").field("path", &self.path).finish()
    }
}

impl CModule {
    pub fn load(path: &Path) -> Result<Self> {
        // SAFETY: modules are produced by `codegen` and only define static helpers
        // and the entry point; loading runs no initializers.
        let lib = unsafe { Library::new(path) }
            .map_err(|err| GraphError::Compile(format!("cannot load {}: {}", path.display(), err)))?;
        // SAFETY: the symbol has the `EntryFn` signature in every generated module.
        let entry = unsafe {
            lib.get::<EntryFn>(ENTRY_SYMBOL.as_bytes())
                .map(|symbol| *symbol)
        }
        .map_err(|err| GraphError::Compile(format!("{}: {}", path.display(), err)))?;
        Ok(CModule {
            _lib: lib,
            entry,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the module over `cells`.
    ///
    /// Every cell must already hold a buffer of its final shape; outputs are
    /// written in place.
    pub fn run(&self, cells: &mut [TensorValue]) -> std::result::Result<(), ModuleFailure> {
        let shapes: Vec<Vec<i64>> = cells
            .iter()
            .map(|c| c.shape().iter().map(|n| *n as i64).collect())
            .collect();
        let mut arrays: Vec<SgArray> = cells
            .iter_mut()
            .zip(&shapes)
            .map(|(cell, shape)| SgArray {
                ndim: shape.len() as i64,
                shape: shape.as_ptr(),
                size: cell.size() as i64,
                data: cell.data_mut().as_mut_ptr(),
            })
            .collect();
        let mut err = SgError {
            node: -1,
            msg: [0; ERROR_MSG_LEN],
        };
        // SAFETY: `arrays` points into `cells` and `shapes`, both alive and
        // unaliased for the duration of the call; the module indexes only
        // within each array's declared size.
        let status = unsafe { (self.entry)(arrays.as_mut_ptr(), arrays.len() as i64, &mut err) };
        if status == 0 {
            return Ok(());
        }
        let bytes: Vec<u8> = err
            .msg
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        Err(ModuleFailure {
            step: usize::try_from(err.node).ok(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

/// Concrete output shapes of `node` for concrete input shapes
pub fn concrete_output_shapes(
    graph: &Graph,
    node: NodeId,
    input_shapes: &[&[usize]],
) -> Result<Vec<Vec<usize>>> {
    let shapes: Vec<Shape> = input_shapes.iter().map(|s| Shape::concrete(s)).collect();
    graph
        .op(node)
        .infer_shape(graph, node, &shapes)?
        .iter()
        .map(Shape::to_concrete)
        .collect()
}

/// Per-node C kernels, cached on disk
pub struct CBackend {
    compiler: CCompiler,
    cache: Arc<ModuleCache>,
}

impl CBackend {
    pub fn new(compiler: CCompiler, cache: Arc<ModuleCache>) -> Self {
        CBackend { compiler, cache }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        CBackend::new(
            CCompiler::from_config(config),
            ModuleCache::shared(&config.compiledir),
        )
    }

    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }
}

impl Backend for CBackend {
    fn name(&self) -> &str {
        "c"
    }

    fn is_available(&self) -> bool {
        self.compiler.is_available()
    }

    fn compile_node(&self, graph: &Graph, node: NodeId) -> Result<Option<Arc<dyn NodeKernel>>> {
        let (sub, _, outs) = graph.extract_node(node);
        let Some(sub_node) = outs.first().and_then(|v| sub.owner(*v)) else {
            return Ok(None);
        };
        let apply = sub.node(sub_node);
        let n_inputs = apply.inputs.len();
        let destroy_map = apply.op.destroy_map();
        let mut next = n_inputs;
        let mut output_cells = Vec::with_capacity(apply.outputs.len());
        for k in 0..apply.outputs.len() {
            match destroy_map.get(&k).and_then(|v| v.first()) {
                Some(input) => output_cells.push(*input),
                None => {
                    output_cells.push(next);
                    next += 1;
                }
            }
        }
        let step = CStep {
            node: sub_node,
            inputs: (0..n_inputs).collect(),
            outputs: output_cells.clone(),
        };
        let source = match codegen::translation_unit(&sub, &[step], next) {
            Ok(source) => source,
            Err(GraphError::NotImplemented(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let key = CacheKey::new(&source, &self.compiler)?;
        let (module, _) = self.cache.get_or_compile(&key, &source, &self.compiler)?;
        Ok(Some(Arc::new(CNodeKernel {
            module,
            graph: sub,
            node: sub_node,
            output_cells,
            n_cells: next,
        })))
    }
}

/// One node compiled to its own module
struct CNodeKernel {
    module: Arc<CModule>,
    graph: Graph,
    node: NodeId,
    output_cells: Vec<usize>,
    n_cells: usize,
}

impl NodeKernel for CNodeKernel {
    fn run(&self, inputs: &[&TensorValue], outputs: &mut [Option<TensorValue>]) -> Result<()> {
        let input_shapes: Vec<&[usize]> = inputs.iter().map(|v| v.shape()).collect();
        let shapes = concrete_output_shapes(&self.graph, self.node, &input_shapes)?;
        let mut cells: Vec<TensorValue> = inputs.iter().map(|v| (*v).clone()).collect();
        for (k, cell) in self.output_cells.iter().enumerate() {
            if *cell >= inputs.len() {
                let dtype = self.graph.ty(self.graph.node(self.node).outputs[k]).dtype;
                cells.push(TensorValue::zeros(dtype, shapes[k].clone()));
            }
        }
        if cells.len() != self.n_cells {
            return Err(GraphError::InvalidValue(format!(
                "kernel expects {} cells, got {}",
                self.n_cells,
                cells.len()
            )));
        }
        self.module
            .run(&mut cells)
            .map_err(|failure| GraphError::InvalidValue(failure.message))?;
        for (slot, cell) in outputs.iter_mut().zip(&self.output_cells) {
            *slot = Some(cells[*cell].clone());
        }
        Ok(())
    }
}
