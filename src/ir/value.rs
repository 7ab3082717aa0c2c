// Runtime Tensor Values
//
// Dense row-major buffers. Every dtype is carried in f64 storage and rounded
// to its dtype on construction and after each elementwise step, so the
// interpreted and native execution paths share one numeric model.

use crate::core::error::{GraphError, Result};
use crate::ir::types::{ScalarType, TensorType};
use std::fmt;

/// A concrete tensor: dtype, extents and row-major data
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    dtype: ScalarType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// Row-major strides (in elements) for a shape
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

impl TensorValue {
    /// Create a value, rounding data to the dtype
    pub fn new(dtype: ScalarType, shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != data.len() {
            return Err(GraphError::DimensionMismatch(format!(
                "shape {:?} holds {} elements, got {}",
                shape,
                size,
                data.len()
            )));
        }
        let data = data.into_iter().map(|x| dtype.round(x)).collect();
        Ok(TensorValue { dtype, shape, data })
    }

    /// Wrap data already rounded to `dtype`
    pub(crate) fn from_raw(dtype: ScalarType, shape: Vec<usize>, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        TensorValue { dtype, shape, data }
    }

    pub fn scalar(dtype: ScalarType, value: f64) -> Self {
        TensorValue::from_raw(dtype, Vec::new(), vec![dtype.round(value)])
    }

    pub fn zeros(dtype: ScalarType, shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        TensorValue::from_raw(dtype, shape, vec![0.0; size])
    }

    pub fn filled(dtype: ScalarType, shape: Vec<usize>, value: f64) -> Self {
        let size = shape.iter().product();
        TensorValue::from_raw(dtype, shape, vec![dtype.round(value); size])
    }

    pub fn vector(dtype: ScalarType, data: Vec<f64>) -> Self {
        let len = data.len();
        TensorValue::from_raw(dtype, vec![len], data.into_iter().map(|x| dtype.round(x)).collect())
    }

    /// Build a matrix from rows; every row must have the same length
    pub fn matrix(dtype: ScalarType, rows: &[Vec<f64>]) -> Result<Self> {
        let ncols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(GraphError::DimensionMismatch(
                "matrix rows have different lengths".to_string(),
            ));
        }
        let data: Vec<f64> = rows.iter().flatten().copied().collect();
        TensorValue::new(dtype, vec![rows.len(), ncols], data)
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// The single element of a one-element tensor
    pub fn as_scalar(&self) -> Result<f64> {
        if self.data.len() == 1 {
            Ok(self.data[0])
        } else {
            Err(GraphError::InvalidValue(format!(
                "expected a single element, got shape {:?}",
                self.shape
            )))
        }
    }

    /// Element at a multi-index
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let strides = contiguous_strides(&self.shape);
        let mut offset = 0;
        for ((i, n), s) in index.iter().zip(&self.shape).zip(&strides) {
            if i >= n {
                return None;
            }
            offset += i * s;
        }
        self.data.get(offset).copied()
    }

    /// Broadcastable pattern a constant of this value gets
    pub fn broadcastable(&self) -> Vec<bool> {
        self.shape.iter().map(|n| *n == 1).collect()
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::new(self.dtype, self.broadcastable())
    }

    /// Check that this value can be stored in a variable of type `ty`
    pub fn check_type(&self, ty: &TensorType) -> Result<()> {
        if self.dtype != ty.dtype {
            return Err(GraphError::TypeMismatch(format!(
                "expected dtype {}, got {}",
                ty.dtype, self.dtype
            )));
        }
        if self.ndim() != ty.ndim() {
            return Err(GraphError::TypeMismatch(format!(
                "expected {} dimensions, got {}",
                ty.ndim(),
                self.ndim()
            )));
        }
        for (axis, (b, n)) in ty.broadcastable.iter().zip(&self.shape).enumerate() {
            if *b && *n != 1 {
                return Err(GraphError::TypeMismatch(format!(
                    "axis {} is broadcastable but has length {}",
                    axis, n
                )));
            }
        }
        Ok(())
    }

    /// Convert to another dtype, rounding
    pub fn cast(&self, dtype: ScalarType) -> TensorValue {
        TensorValue::from_raw(
            dtype,
            self.shape.clone(),
            self.data.iter().map(|x| dtype.round(*x)).collect(),
        )
    }

    /// Element strides for reading this value as if it had `out_shape`.
    ///
    /// Length-1 axes get stride 0; ranks must match.
    pub fn broadcast_strides(&self, out_shape: &[usize]) -> Result<Vec<usize>> {
        if self.shape.len() != out_shape.len() {
            return Err(GraphError::DimensionMismatch(format!(
                "cannot broadcast shape {:?} to {:?}",
                self.shape, out_shape
            )));
        }
        let strides = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(out_shape)
            .zip(strides)
            .map(|((n, out), s)| {
                if n == out {
                    Ok(if *n == 1 { 0 } else { s })
                } else if *n == 1 {
                    Ok(0)
                } else {
                    Err(GraphError::DimensionMismatch(format!(
                        "cannot broadcast shape {:?} to {:?}",
                        self.shape, out_shape
                    )))
                }
            })
            .collect()
    }

    /// Materialize this value broadcast to `out_shape`
    pub fn broadcast_to(&self, out_shape: &[usize]) -> Result<Vec<f64>> {
        let strides = self.broadcast_strides(out_shape)?;
        let size: usize = out_shape.iter().product();
        let mut out = Vec::with_capacity(size);
        for flat in 0..size {
            out.push(self.data[broadcast_offset(flat, out_shape, &strides)]);
        }
        Ok(out)
    }

    /// Largest absolute elementwise difference, None on shape mismatch
    pub fn max_abs_diff(&self, other: &TensorValue) -> Option<f64> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| if a == b { 0.0 } else { (a - b).abs() })
                .fold(0.0, f64::max),
        )
    }

    /// numpy-style closeness: |a - b| <= atol + rtol * |b|, NaNs equal
    pub fn allclose(&self, other: &TensorValue, rtol: f64, atol: f64) -> bool {
        self.shape == other.shape
            && self.data.iter().zip(&other.data).all(|(a, b)| {
                (a.is_nan() && b.is_nan()) || a == b || (a - b).abs() <= atol + rtol * b.abs()
            })
    }

    /// Stable textual identity used to merge equal constants
    pub fn signature(&self) -> String {
        let bits: Vec<String> = self.data.iter().map(|x| format!("{:x}", x.to_bits())).collect();
        format!("{}{:?}[{}]", self.dtype, self.shape, bits.join(","))
    }
}

/// Offset into a broadcast input for a flat index of the output
pub fn broadcast_offset(flat: usize, out_shape: &[usize], strides: &[usize]) -> usize {
    let mut rem = flat;
    let mut offset = 0;
    for axis in (0..out_shape.len()).rev() {
        let n = out_shape[axis];
        let idx = rem % n;
        rem /= n;
        offset += idx * strides[axis];
    }
    offset
}

impl fmt::Display for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.shape.is_empty() {
            return write!(f, "{}", self.data[0]);
        }
        if self.data.len() <= 16 {
            write!(f, "{}{:?}{:?}", self.dtype, self.shape, self.data)
        } else {
            write!(f, "{}{:?}[{} elements]", self.dtype, self.shape, self.data.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rounds_to_dtype() {
        let v = TensorValue::new(ScalarType::Int32, vec![2], vec![1.9, -1.9]).unwrap();
        assert_eq!(v.data(), &[1.0, -1.0]);
        assert!(TensorValue::new(ScalarType::Float64, vec![2, 2], vec![1.0]).is_err());
    }

    #[test]
    fn test_get_and_strides() {
        let m = TensorValue::matrix(
            ScalarType::Float64,
            &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        )
        .unwrap();
        assert_eq!(contiguous_strides(m.shape()), vec![3, 1]);
        assert_eq!(m.get(&[1, 2]), Some(6.0));
        assert_eq!(m.get(&[2, 0]), None);
    }

    #[test]
    fn test_broadcast_to() {
        let row = TensorValue::new(ScalarType::Float64, vec![1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let out = row.broadcast_to(&[2, 3]).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        assert!(row.broadcast_to(&[2, 4]).is_err());
    }

    #[test]
    fn test_check_type() {
        let row = TensorValue::new(ScalarType::Float64, vec![1, 3], vec![0.0; 3]).unwrap();
        assert!(row.check_type(&TensorType::row(ScalarType::Float64)).is_ok());
        assert!(row.check_type(&TensorType::col(ScalarType::Float64)).is_err());
        assert!(row.check_type(&TensorType::matrix(ScalarType::Float32)).is_err());
    }

    #[test]
    fn test_allclose() {
        let a = TensorValue::vector(ScalarType::Float64, vec![1.0, f64::NAN]);
        let b = TensorValue::vector(ScalarType::Float64, vec![1.0 + 1e-9, f64::NAN]);
        assert!(a.allclose(&b, 1e-5, 1e-8));
        let c = TensorValue::vector(ScalarType::Float64, vec![1.1, f64::NAN]);
        assert!(!a.allclose(&c, 1e-5, 1e-8));
    }
}
