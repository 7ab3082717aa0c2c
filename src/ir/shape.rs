// Symbolic Shape Tracking
//
// Shapes flow through `Op::infer_shape`. With concrete input shapes they give
// the exact runtime extents used to size native buffers; with symbolic ones
// they still catch incompatible dimensions early.

use crate::core::error::{GraphError, Result};
use std::fmt;

/// Symbolic dimension (can be concrete or symbolic)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Concrete dimension size
    Concrete(usize),
    /// Symbolic dimension (e.g., "x.0")
    Symbolic(String),
}

impl Dim {
    pub fn is_concrete(&self) -> bool {
        matches!(self, Dim::Concrete(_))
    }

    /// Check if two dimensions are compatible (can be unified)
    pub fn compatible_with(&self, other: &Dim) -> bool {
        match (self, other) {
            (Dim::Concrete(a), Dim::Concrete(b)) => a == b,
            (Dim::Symbolic(a), Dim::Symbolic(b)) => a == b,
            _ => true, // Symbolic can unify with anything
        }
    }

    /// The more informative of two compatible dimensions
    pub fn unify(&self, other: &Dim) -> Dim {
        match (self, other) {
            (Dim::Concrete(_), _) => self.clone(),
            (_, Dim::Concrete(_)) => other.clone(),
            _ => self.clone(),
        }
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Dim::Concrete(1))
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Dim::Concrete(n) => write!(f, "{}", n),
            Dim::Symbolic(s) => write!(f, "{}", s),
        }
    }
}

/// Shape of a tensor, one `Dim` per axis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<Dim>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn concrete(dims: &[usize]) -> Self {
        Shape(dims.iter().map(|d| Dim::Concrete(*d)).collect())
    }

    /// Fully symbolic shape named after a variable, length-1 where broadcastable
    pub fn symbolic(name: &str, broadcastable: &[bool]) -> Self {
        Shape(
            broadcastable
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    if *b {
                        Dim::Concrete(1)
                    } else {
                        Dim::Symbolic(format!("{}.{}", name, i))
                    }
                })
                .collect(),
        )
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// Check if shape is fully concrete
    pub fn is_concrete(&self) -> bool {
        self.0.iter().all(Dim::is_concrete)
    }

    /// Concrete extents, or an error naming the first symbolic dimension
    pub fn to_concrete(&self) -> Result<Vec<usize>> {
        self.0
            .iter()
            .map(|d| match d {
                Dim::Concrete(n) => Ok(*n),
                Dim::Symbolic(s) => Err(GraphError::InvalidValue(format!(
                    "shape dimension {} is not known",
                    s
                ))),
            })
            .collect()
    }

    /// Broadcast several equal-rank shapes together
    pub fn broadcast(shapes: &[Shape]) -> Result<Shape> {
        let rank = shapes.first().map(Shape::rank).unwrap_or(0);
        let mut out = Vec::with_capacity(rank);
        for axis in 0..rank {
            let mut dim = Dim::Concrete(1);
            for shape in shapes {
                if shape.rank() != rank {
                    return Err(GraphError::DimensionMismatch(format!(
                        "cannot broadcast rank {} with rank {}",
                        shape.rank(),
                        rank
                    )));
                }
                let d = &shape.0[axis];
                if d.is_one() {
                    continue;
                }
                if dim.is_one() {
                    dim = d.clone();
                } else if dim.compatible_with(d) {
                    dim = dim.unify(d);
                } else {
                    return Err(GraphError::DimensionMismatch(format!(
                        "axis {}: {} vs {}",
                        axis, dim, d
                    )));
                }
            }
            out.push(dim);
        }
        Ok(Shape(out))
    }

    /// Infer the result shape of a matrix product
    pub fn matmul(a: &Shape, b: &Shape) -> Result<Shape> {
        let mismatch = |x: &Dim, y: &Dim| {
            GraphError::DimensionMismatch(format!("inner dimensions {} and {} differ", x, y))
        };
        match (a.0.as_slice(), b.0.as_slice()) {
            ([m, k1], [k2, n]) => {
                if k1.compatible_with(k2) {
                    Ok(Shape(vec![m.clone(), n.clone()]))
                } else {
                    Err(mismatch(k1, k2))
                }
            }
            ([m, k1], [k2]) => {
                if k1.compatible_with(k2) {
                    Ok(Shape(vec![m.clone()]))
                } else {
                    Err(mismatch(k1, k2))
                }
            }
            ([k1], [k2, n]) => {
                if k1.compatible_with(k2) {
                    Ok(Shape(vec![n.clone()]))
                } else {
                    Err(mismatch(k1, k2))
                }
            }
            ([k1], [k2]) => {
                if k1.compatible_with(k2) {
                    Ok(Shape::scalar())
                } else {
                    Err(mismatch(k1, k2))
                }
            }
            _ => Err(GraphError::DimensionMismatch(format!(
                "dot of shapes {} and {}",
                a, b
            ))),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        if dims.len() == 1 {
            write!(f, "({},)", dims[0])
        } else {
            write!(f, "({})", dims.join(", "))
        }
    }
}
