// Core Layer: Error Types
// Every fallible operation in the crate reports one of these variants.

use std::fmt;

/// Errors raised while building, rewriting, compiling or running graphs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An op rejected its input types, or a replacement changed a variable's type
    TypeMismatch(String),
    /// A graph references a free variable that is neither an input nor a constant
    MissingInput(String),
    /// A destructive rewrite violated aliasing constraints
    Inconsistency(String),
    /// Topological sorting failed: cycle or inconsistent dependency memo
    Ordering(String),
    /// A replacement would make a variable depend on itself
    Cycle(String),
    /// An op failed while executing a node
    Runtime {
        node: String,
        op: String,
        message: String,
    },
    /// Two linkers produced different values for the same variable
    CheckerMismatch {
        node: String,
        variable: String,
        message: String,
    },
    /// A gradient was demanded through an op without a gradient implementation
    GradNotImplemented(String),
    /// A gradient was demanded where it is mathematically undefined
    GradUndefined(String),
    /// A rewrite group did not converge within the configured iteration cap
    FixpointNotReached { rewriter: String, iterations: usize },
    /// Native code generation or compilation failed
    Compile(String),
    /// Filesystem failure in the compilation cache
    Io(String),
    /// Invalid argument value
    InvalidValue(String),
    /// Runtime shapes are not compatible
    DimensionMismatch(String),
    /// A declared function input does not contribute to any output
    UnusedInput(String),
    /// Requested feature is not implemented
    NotImplemented(String),
}

impl GraphError {
    /// Attach the failing node's identity to an execution error
    pub fn at_node(self, node: impl fmt::Display, op: &str) -> Self {
        match self {
            // already located, keep the innermost description
            err @ GraphError::Runtime { .. } => err,
            other => GraphError::Runtime {
                node: node.to_string(),
                op: op.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// True for the error raised by destroy/view validation
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, GraphError::Inconsistency(_))
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch(msg) => write!(f, "Type mismatch: {}", msg),
            Self::MissingInput(msg) => write!(f, "Missing input: {}", msg),
            Self::Inconsistency(msg) => write!(f, "Inconsistent destroy/view pattern: {}", msg),
            Self::Ordering(msg) => write!(f, "Ordering error: {}", msg),
            Self::Cycle(msg) => write!(f, "Replacement would create a cycle: {}", msg),
            Self::Runtime { node, op, message } => {
                write!(f, "Error in node {} ({}): {}", node, op, message)
            }
            Self::CheckerMismatch {
                node,
                variable,
                message,
            } => write!(
                f,
                "Linkers disagree on {} (output of node {}): {}",
                variable, node, message
            ),
            Self::GradNotImplemented(msg) => write!(f, "Gradient not implemented: {}", msg),
            Self::GradUndefined(msg) => write!(f, "Gradient undefined: {}", msg),
            Self::FixpointNotReached {
                rewriter,
                iterations,
            } => write!(
                f,
                "Rewriter {} did not reach a fixpoint after {} iterations",
                rewriter, iterations
            ),
            Self::Compile(msg) => write!(f, "Compilation failed: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
            Self::DimensionMismatch(msg) => write!(f, "Dimension mismatch: {}", msg),
            Self::UnusedInput(msg) => write!(f, "Unused input: {}", msg),
            Self::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io(err.to_string())
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_node_wraps_once() {
        let err = GraphError::DimensionMismatch("3 vs 4".to_string()).at_node("n2", "Dot22");
        assert_eq!(
            err.to_string(),
            "Error in node n2 (Dot22): Dimension mismatch: 3 vs 4"
        );
        let again = err.clone().at_node("n7", "Elemwise{add}");
        assert_eq!(again, err);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GraphError = io.into();
        assert!(matches!(err, GraphError::Io(_)));
    }
}
