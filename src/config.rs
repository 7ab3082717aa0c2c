// Compilation settings
//
// Resolved from the environment once per call to `from_env`; every field is
// public so callers and tests can set them directly instead.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_MAX_ITERATIONS: usize = 64;
pub const DEFAULT_MODE: &str = "fast_run";

/// Settings shared by the optimizer and the native back ends
#[derive(Debug, Clone, PartialEq)]
pub struct CompileConfig {
    /// Root of the on-disk module cache
    pub compiledir: PathBuf,
    /// C compiler executable
    pub cc: String,
    /// Extra flags appended after the base compiler flags
    pub cflags: Vec<String>,
    /// Cap on fixpoint iterations of an equilibrium rewriter
    pub max_iterations: usize,
    /// Name of the default compilation mode
    pub mode: String,
    /// Run the infer-shape checker after every perform-linked call
    pub check_infer_shape: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            compiledir: env::temp_dir().join("symgraph_compiledir"),
            cc: "cc".to_string(),
            cflags: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            mode: DEFAULT_MODE.to_string(),
            check_infer_shape: false,
        }
    }
}

impl CompileConfig {
    /// Defaults overridden by `SYMGRAPH_*` variables and `CC`
    pub fn from_env() -> Self {
        let mut config = CompileConfig::default();
        if let Some(dir) = non_empty("SYMGRAPH_COMPILEDIR") {
            config.compiledir = PathBuf::from(dir);
        }
        if let Some(cc) = non_empty("CC") {
            config.cc = cc;
        }
        if let Some(flags) = non_empty("SYMGRAPH_CFLAGS") {
            config.cflags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = non_empty("SYMGRAPH_OPTIMIZER_MAX_ITERATIONS") {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_iterations = n,
                _ => log::warn!(
                    "ignoring SYMGRAPH_OPTIMIZER_MAX_ITERATIONS={}: expected a positive integer",
                    value
                ),
            }
        }
        if let Some(mode) = non_empty("SYMGRAPH_MODE") {
            config.mode = mode.trim().to_string();
        }
        if let Some(value) = non_empty("SYMGRAPH_CHECK_INFER_SHAPE") {
            config.check_infer_shape = parse_bool(&value);
        }
        config
    }

    /// Base compiler flags followed by the user's
    pub fn compiler_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = ["-O2", "-shared", "-fPIC", "-ffp-contract=off"]
            .iter()
            .map(|f| f.to_string())
            .collect();
        flags.extend(self.cflags.iter().cloned());
        flags
    }
}

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
