// IR Type System
//
// A variable's type is a tensor type: an element dtype plus a broadcastable
// pattern. The pattern fixes the rank and marks dimensions statically known
// to have length 1. Scalars are 0-d tensors.

use crate::core::error::{GraphError, Result};
use crate::ir::value::TensorValue;
use std::fmt;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl ScalarType {
    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int8 => 1,
            ScalarType::Int16 => 2,
            ScalarType::Int32 => 4,
            ScalarType::Int64 => 8,
            ScalarType::Uint8 => 1,
            ScalarType::Uint16 => 2,
            ScalarType::Uint32 => 4,
            ScalarType::Uint64 => 8,
            ScalarType::Float32 => 4,
            ScalarType::Float64 => 8,
        }
    }

    /// Check if this is a floating-point type
    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float() && !matches!(self, ScalarType::Bool)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
        ) || self.is_float()
    }

    /// Numeric promotion of two dtypes.
    ///
    /// Floats absorb integers (a 32-bit float meeting an integer wider than
    /// 16 bits widens to 64 bits), signed and unsigned integers meet at the
    /// next signed width that holds both.
    pub fn upcast(a: ScalarType, b: ScalarType) -> ScalarType {
        use ScalarType::*;
        if a == b {
            return a;
        }
        match (a, b) {
            (Bool, other) | (other, Bool) => other,
            (Float64, _) | (_, Float64) => Float64,
            (Float32, other) | (other, Float32) => {
                if other.size_bytes() <= 2 {
                    Float32
                } else {
                    Float64
                }
            }
            (x, y) if x.is_signed() == y.is_signed() => {
                if x.size_bytes() >= y.size_bytes() {
                    x
                } else {
                    y
                }
            }
            (x, y) => {
                let (signed, unsigned) = if x.is_signed() { (x, y) } else { (y, x) };
                if signed.size_bytes() > unsigned.size_bytes() {
                    signed
                } else {
                    match unsigned.size_bytes() {
                        1 => Int16,
                        2 => Int32,
                        _ => Int64,
                    }
                }
            }
        }
    }

    /// Promotion of a whole list of dtypes
    pub fn upcast_all(dtypes: &[ScalarType]) -> Option<ScalarType> {
        let mut iter = dtypes.iter().copied();
        let first = iter.next()?;
        Some(iter.fold(first, ScalarType::upcast))
    }

    /// Round an f64 to the value this dtype can represent.
    ///
    /// Every runtime buffer stores f64; this is the single place where
    /// narrower dtypes lose precision.
    pub fn round(&self, x: f64) -> f64 {
        match self {
            ScalarType::Float64 => x,
            ScalarType::Float32 => x as f32 as f64,
            ScalarType::Bool => {
                if x != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            _ => x.trunc(),
        }
    }

    /// Lowercase name used in printed graphs and generated code
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Uint8 => "uint8",
            ScalarType::Uint16 => "uint16",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "bool" => ScalarType::Bool,
            "int8" => ScalarType::Int8,
            "int16" => ScalarType::Int16,
            "int32" => ScalarType::Int32,
            "int64" => ScalarType::Int64,
            "uint8" => ScalarType::Uint8,
            "uint16" => ScalarType::Uint16,
            "uint32" => ScalarType::Uint32,
            "uint64" => ScalarType::Uint64,
            "float32" => ScalarType::Float32,
            "float64" => ScalarType::Float64,
            other => return Err(GraphError::InvalidValue(format!("unknown dtype {}", other))),
        })
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tensor type: dtype plus broadcastable pattern.
///
/// Types are immutable values compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dtype: ScalarType,
    pub broadcastable: Vec<bool>,
}

impl TensorType {
    pub fn new(dtype: ScalarType, broadcastable: Vec<bool>) -> Self {
        TensorType {
            dtype,
            broadcastable,
        }
    }

    /// 0-d tensor
    pub fn scalar(dtype: ScalarType) -> Self {
        TensorType::new(dtype, Vec::new())
    }

    pub fn vector(dtype: ScalarType) -> Self {
        TensorType::new(dtype, vec![false])
    }

    pub fn matrix(dtype: ScalarType) -> Self {
        TensorType::new(dtype, vec![false, false])
    }

    /// Matrix with a single row
    pub fn row(dtype: ScalarType) -> Self {
        TensorType::new(dtype, vec![true, false])
    }

    /// Matrix with a single column
    pub fn col(dtype: ScalarType) -> Self {
        TensorType::new(dtype, vec![false, true])
    }

    pub fn ndim(&self) -> usize {
        self.broadcastable.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.broadcastable.is_empty()
    }

    /// Every dimension is statically length 1
    pub fn all_broadcastable(&self) -> bool {
        self.broadcastable.iter().all(|b| *b)
    }

    /// Float matrix with no broadcastable dimension
    pub fn is_real_matrix(&self) -> bool {
        self.dtype.is_float() && self.broadcastable == [false, false]
    }

    pub fn is_real_vector(&self) -> bool {
        self.dtype.is_float() && self.broadcastable == [false]
    }

    /// Whether a variable of type `other` can stand where one of this type is expected.
    ///
    /// Same dtype and rank; `other` may know more dimensions to be length 1.
    pub fn accepts(&self, other: &TensorType) -> bool {
        self.dtype == other.dtype
            && self.ndim() == other.ndim()
            && self
                .broadcastable
                .iter()
                .zip(&other.broadcastable)
                .all(|(mine, theirs)| !*mine || *theirs)
    }

    /// Same dtype and rank, broadcast pattern ignored
    pub fn in_same_class(&self, other: &TensorType) -> bool {
        self.dtype == other.dtype && self.ndim() == other.ndim()
    }

    pub fn with_dtype(&self, dtype: ScalarType) -> Self {
        TensorType::new(dtype, self.broadcastable.clone())
    }

    /// Convert a runtime value for storage in a variable of this type.
    ///
    /// Lossless dtype conversions are applied silently; narrowing ones only
    /// with `allow_downcast`.
    pub fn filter(&self, value: TensorValue, allow_downcast: bool) -> Result<TensorValue> {
        let value = if value.dtype() == self.dtype {
            value
        } else if allow_downcast || ScalarType::upcast(value.dtype(), self.dtype) == self.dtype {
            value.cast(self.dtype)
        } else {
            return Err(GraphError::TypeMismatch(format!(
                "converting {} to {} loses precision",
                value.dtype(),
                self.dtype
            )));
        };
        value.check_type(self)?;
        Ok(value)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pattern: Vec<&str> = self
            .broadcastable
            .iter()
            .map(|b| if *b { "True" } else { "False" })
            .collect();
        write!(f, "TensorType({}, ({}))", self.dtype, pattern.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_type_sizes() {
        assert_eq!(ScalarType::Bool.size_bytes(), 1);
        assert_eq!(ScalarType::Int32.size_bytes(), 4);
        assert_eq!(ScalarType::Float64.size_bytes(), 8);
    }

    #[test]
    fn test_upcast() {
        use ScalarType::*;
        assert_eq!(ScalarType::upcast(Float32, Float64), Float64);
        assert_eq!(ScalarType::upcast(Float32, Int8), Float32);
        assert_eq!(ScalarType::upcast(Float32, Int32), Float64);
        assert_eq!(ScalarType::upcast(Int8, Uint8), Int16);
        assert_eq!(ScalarType::upcast(Int64, Uint8), Int64);
        assert_eq!(ScalarType::upcast(Bool, Int32), Int32);
        assert_eq!(ScalarType::upcast_all(&[Int8, Float32, Float64]), Some(Float64));
    }

    #[test]
    fn test_round() {
        assert_eq!(ScalarType::Int32.round(2.7), 2.0);
        assert_eq!(ScalarType::Int32.round(-2.7), -2.0);
        assert_eq!(ScalarType::Bool.round(0.25), 1.0);
        assert_eq!(ScalarType::Float32.round(0.1), 0.1f32 as f64);
    }

    #[test]
    fn test_accepts() {
        let m = TensorType::matrix(ScalarType::Float64);
        let r = TensorType::row(ScalarType::Float64);
        assert!(m.accepts(&r));
        assert!(!r.accepts(&m));
        assert!(!m.accepts(&TensorType::matrix(ScalarType::Float32)));
        assert!(m.in_same_class(&r));
        assert_eq!(
            r.to_string(),
            "TensorType(float64, (True, False))"
        );
    }

    #[test]
    fn test_filter_conversions() {
        let ty = TensorType::vector(ScalarType::Float32);
        let ints = TensorValue::vector(ScalarType::Int8, vec![1.0, 2.0]);
        assert_eq!(ty.filter(ints, false).unwrap().dtype(), ScalarType::Float32);
        let wide = TensorValue::vector(ScalarType::Float64, vec![0.1]);
        assert!(ty.filter(wide.clone(), false).is_err());
        assert_eq!(ty.filter(wide, true).unwrap().data(), &[0.1f32 as f64]);
        let row = TensorType::row(ScalarType::Float64);
        let m = TensorValue::zeros(ScalarType::Float64, vec![2, 3]);
        assert!(row.filter(m, false).is_err());
    }
}
