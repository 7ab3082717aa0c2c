// C Code Generation
//
// Concatenates the `c_code` fragments of a sequence of nodes into one
// translation unit. Every variable lives in a storage cell (`cells[i]`), and
// every node's failure path jumps to a single `sg_fail` label after recording
// the failing step, so no later step runs once one has failed.

use crate::core::error::{GraphError, Result};
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;
use crate::ir::op::CNode;

/// Highest rank the generated broadcasting helpers handle
pub const MAX_NDIM: usize = 8;

/// Exported symbol of every generated module
pub const ENTRY_SYMBOL: &str = "sg_entry";

/// Length of `sg_error::msg`, terminator included
pub const ERROR_MSG_LEN: usize = 256;

/// Declarations shared by every translation unit
pub const PRELUDE: &str = r#"#include <stdint.h>
#include <stdio.h>
#include <math.h>

#define SG_MAX_NDIM 8

typedef struct {
    double* data;
    int64_t ndim;
    const int64_t* shape;
    int64_t size;
} sg_array;

typedef struct {
    int64_t node;
    char msg[256];
} sg_error;

#define SG_FAIL(k) { err->node = (k); goto sg_fail; }

/* element strides reading `in` broadcast to the shape of `out`; nonzero on
   mismatch. Only axes flagged in `bcast` may stretch an extent of 1. */
static int sg_bcast_strides(const sg_array* in, const char* bcast, const sg_array* out, int64_t* strides) {
    if (in->ndim != out->ndim || in->ndim > SG_MAX_NDIM) return 1;
    int64_t st = 1;
    for (int64_t d = in->ndim - 1; d >= 0; --d) {
        if (in->shape[d] == out->shape[d]) {
            strides[d] = in->shape[d] == 1 ? 0 : st;
        } else if (in->shape[d] == 1 && bcast[d]) {
            strides[d] = 0;
        } else {
            return 1;
        }
        st *= in->shape[d];
    }
    return 0;
}

static int64_t sg_offset(int64_t flat, const sg_array* out, const int64_t* strides) {
    int64_t off = 0;
    for (int64_t d = out->ndim - 1; d >= 0; --d) {
        off += (flat % out->shape[d]) * strides[d];
        flat /= out->shape[d];
    }
    return off;
}
"#;

/// One node of a translation unit, wired to storage cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStep {
    pub node: NodeId,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Generated source plus what else decides its meaning
#[derive(Debug, Clone)]
pub struct CSource {
    pub code: String,
    /// (op name, `c_code_cache_version`) for every step, in order
    pub op_versions: Vec<(String, u32)>,
    pub n_cells: usize,
}

fn cell(index: usize) -> String {
    format!("(&cells[{}])", index)
}

fn comment_safe(text: &str) -> String {
    text.replace("*/", "* /")
}

/// Generate the module running `steps` in order over `n_cells` cells.
///
/// Fails with `NotImplemented` when a node has no C fragment.
pub fn translation_unit(graph: &Graph, steps: &[CStep], n_cells: usize) -> Result<CSource> {
    let mut code = String::from(PRELUDE);
    let mut op_versions = Vec::with_capacity(steps.len());
    code.push_str(&format!(
        "\nint32_t {}(sg_array* cells, int64_t n_cells, sg_error* err) {{\n",
        ENTRY_SYMBOL
    ));
    code.push_str(&format!(
        "if (n_cells != {n}) {{\n\
         snprintf(err->msg, sizeof(err->msg), \"expected {n} storage cells, got %lld\", (long long)n_cells);\n\
         err->node = -1;\nreturn 1;\n}}\n",
        n = n_cells
    ));

    for (k, step) in steps.iter().enumerate() {
        let op = graph.op(step.node);
        let apply = graph.node(step.node);
        if step.inputs.len() != apply.inputs.len() || step.outputs.len() != apply.outputs.len() {
            return Err(GraphError::Compile(format!(
                "step {} is wired to {} inputs and {} outputs, node {} has {} and {}",
                k,
                step.inputs.len(),
                step.outputs.len(),
                step.node,
                apply.inputs.len(),
                apply.outputs.len()
            )));
        }
        if let Some(bad) = step.inputs.iter().chain(&step.outputs).find(|c| **c >= n_cells) {
            return Err(GraphError::Compile(format!(
                "step {} refers to cell {} of {}",
                k, bad, n_cells
            )));
        }
        let cnode = CNode {
            index: k,
            inputs: step.inputs.iter().map(|c| cell(*c)).collect(),
            outputs: step.outputs.iter().map(|c| cell(*c)).collect(),
            input_types: apply.inputs.iter().map(|v| graph.ty(*v).clone()).collect(),
            output_types: apply.outputs.iter().map(|v| graph.ty(*v).clone()).collect(),
            fail: format!("SG_FAIL({});", k),
        };
        let name = op.name();
        let fragment = op.c_code(&cnode).ok_or_else(|| {
            GraphError::NotImplemented(format!("{} has no C implementation", name))
        })?;
        code.push_str(&format!("/* step {}: {} */\n{{\n", k, comment_safe(&name)));
        code.push_str(&fragment);
        code.push_str("}\n");
        op_versions.push((name, op.c_code_cache_version()));
    }

    code.push_str("return 0;\nsg_fail:\nreturn 1;\n}\n");
    log::trace!(
        "generated {} bytes of C for {} steps",
        code.len(),
        steps.len()
    );
    Ok(CSource {
        code,
        op_versions,
        n_cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{ScalarType, TensorType};
    use crate::ops::{basic, elemwise};

    #[test]
    fn test_fragments_are_wired_to_cells() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        let y = g.input("y", TensorType::vector(ScalarType::Float64));
        let s = elemwise::add(&mut g, &[x, y]).unwrap();
        let e = elemwise::exp(&mut g, s).unwrap();
        let steps = vec![
            CStep {
                node: g.owner(s).unwrap(),
                inputs: vec![0, 1],
                outputs: vec![2],
            },
            CStep {
                node: g.owner(e).unwrap(),
                inputs: vec![2],
                outputs: vec![3],
            },
        ];
        let source = translation_unit(&g, &steps, 4).unwrap();
        assert!(source.code.contains("int32_t sg_entry(sg_array* cells"));
        assert!(source.code.contains("/* step 1: Elemwise{exp} */"));
        assert!(source.code.contains("(&cells[3])"));
        assert_eq!(source.op_versions.len(), 2);
        assert_eq!(source.op_versions[0].0, "Elemwise{add}");
    }

    #[test]
    fn test_failure_paths_name_their_step() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        let c = g.input("c", TensorType::scalar(ScalarType::Float64));
        let checked = basic::assert_op(&mut g, x, &[c], "c must hold").unwrap();
        let steps = vec![CStep {
            node: g.owner(checked).unwrap(),
            inputs: vec![0, 1],
            outputs: vec![2],
        }];
        let source = translation_unit(&g, &steps, 3).unwrap();
        assert!(source.code.contains("SG_FAIL(0);"));
        assert!(source.code.contains("assertion failed: c must hold"));
    }

    #[test]
    fn test_out_of_range_cell_is_rejected() {
        let mut g = Graph::new();
        let x = g.input("x", TensorType::vector(ScalarType::Float64));
        let e = elemwise::exp(&mut g, x).unwrap();
        let steps = vec![CStep {
            node: g.owner(e).unwrap(),
            inputs: vec![0],
            outputs: vec![5],
        }];
        assert!(matches!(
            translation_unit(&g, &steps, 2),
            Err(GraphError::Compile(_))
        ));
    }
}
