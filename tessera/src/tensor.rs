//! Host tensor implementation.

use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::{Error, Result};

/// A host-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones are cheap (shared backing). Storage keeps
/// the dtype it was loaded in; compute reads values through
/// [`Tensor::to_f32_vec`].
#[derive(Clone)]
pub struct Tensor {
    data: Arc<Vec<u8>>,
    shape: Vec<usize>,
    dtype: DType,
}

impl Tensor {
    /// Create a tensor from an f32 slice.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self::from_raw(shape, DType::F32, bytemuck::cast_slice(data).to_vec())
    }

    /// Create a tensor from a u32 slice.
    #[must_use]
    pub fn from_u32(shape: &[usize], data: &[u32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(data.len(), numel);
        Self::from_raw(shape, DType::U32, bytemuck::cast_slice(data).to_vec())
    }

    /// Create a tensor from an i32 slice.
    #[must_use]
    pub fn from_i32(shape: &[usize], data: &[i32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(data.len(), numel);
        Self::from_raw(shape, DType::I32, bytemuck::cast_slice(data).to_vec())
    }

    /// Create a tensor from raw little-endian bytes with a given dtype.
    ///
    /// # Panics
    /// Panics if the byte length does not match `shape` and `dtype`.
    #[must_use]
    pub fn from_raw(shape: &[usize], dtype: DType, data: Vec<u8>) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel * dtype.size_in_bytes(),
            "raw data of {} bytes does not fit shape {shape:?} of {dtype}",
            data.len()
        );
        Self {
            data: Arc::new(data),
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Create a zero-filled f32 tensor.
    #[must_use]
    pub fn zeros_f32(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self::from_raw(shape, DType::F32, vec![0u8; numel * 4])
    }

    /// Returns the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the data type of tensor elements
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the total number of elements in the tensor
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the size of the tensor data in bytes
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice(&self.data)
    }

    /// Get the data as a u32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not U32.
    #[must_use]
    pub fn as_u32_slice(&self) -> &[u32] {
        assert_eq!(self.dtype, DType::U32, "expected U32 tensor");
        bytemuck::cast_slice(&self.data)
    }

    /// Get the data as an i32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not I32.
    #[must_use]
    pub fn as_i32_slice(&self) -> &[i32] {
        assert_eq!(self.dtype, DType::I32, "expected I32 tensor");
        bytemuck::cast_slice(&self.data)
    }

    /// Convert to an f32 Vec, casting from any dtype.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::BF16 => {
                let bf16s: &[half::bf16] = bytemuck::cast_slice(&self.data);
                bf16s.iter().map(|v| v.to_f32()).collect()
            }
            DType::F16 => {
                let f16s: &[half::f16] = bytemuck::cast_slice(&self.data);
                f16s.iter().map(|v| v.to_f32()).collect()
            }
            DType::I32 => self.as_i32_slice().iter().map(|&v| v as f32).collect(),
            DType::U32 => self.as_u32_slice().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Cast a floating point tensor to another floating point dtype.
    ///
    /// Returns a cheap clone when the dtype already matches.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDtype`] when either side is an integer type.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let unsupported = || Error::UnsupportedDtype(format!("cannot cast {} to {dtype}", self.dtype));
        if !self.dtype.is_float() {
            return Err(unsupported());
        }
        let values = self.to_f32_vec();
        let bytes = match dtype {
            DType::F32 => bytemuck::cast_slice(&values).to_vec(),
            DType::F16 => {
                let halfs: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halfs).to_vec()
            }
            DType::BF16 => {
                let halfs: Vec<half::bf16> =
                    values.iter().map(|&v| half::bf16::from_f32(v)).collect();
                bytemuck::cast_slice(&halfs).to_vec()
            }
            DType::I32 | DType::U32 => return Err(unsupported()),
        };
        Ok(Self::from_raw(&self.shape, dtype, bytes))
    }

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    pub fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    /// Copy out `len` entries starting at `start` along dimension `dim`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `dim` or the range is out of bounds.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        if dim >= self.ndim() || start + len > self.shape[dim] {
            return Err(Error::shape_mismatch(
                format!("narrow(dim={dim}, start={start}, len={len})"),
                &self.shape,
                &self.shape,
            ));
        }
        let out = narrow_bytes(&self.data, &self.shape, self.dtype, dim, start, len);
        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Self::from_raw(&shape, self.dtype, out))
    }

    /// Concatenate tensors along `dim`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the tensors disagree on dtype or on
    /// any dimension other than `dim`.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::shape_mismatch("cat of zero tensors", &[1], &[0]))?;
        if dim >= first.ndim() {
            return Err(Error::shape_mismatch(
                format!("cat(dim={dim})"),
                &first.shape,
                &first.shape,
            ));
        }
        for t in &tensors[1..] {
            let same_rank = t.ndim() == first.ndim();
            let same_other_dims = same_rank
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if t.dtype != first.dtype || !same_other_dims {
                return Err(Error::shape_mismatch(
                    format!("cat(dim={dim})"),
                    &first.shape,
                    &t.shape,
                ));
            }
        }

        let outer: usize = first.shape[..dim].iter().product();
        let inner_bytes: usize =
            first.shape[dim + 1..].iter().product::<usize>() * first.dtype.size_in_bytes();
        let total_dim: usize = tensors.iter().map(|t| t.shape[dim]).sum();

        let mut out = Vec::with_capacity(outer * total_dim * inner_bytes);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[dim] * inner_bytes;
                out.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }

        let mut shape = first.shape.clone();
        shape[dim] = total_dim;
        Ok(Self::from_raw(&shape, first.dtype, out))
    }
}

/// Copy `len` entries starting at `start` along `dim` out of a row-major
/// buffer. Bounds must already be checked.
pub(crate) fn narrow_bytes(
    data: &[u8],
    shape: &[usize],
    dtype: DType,
    dim: usize,
    start: usize,
    len: usize,
) -> Vec<u8> {
    let outer: usize = shape[..dim].iter().product();
    let inner_bytes: usize = shape[dim + 1..].iter().product::<usize>() * dtype.size_in_bytes();
    let src_stride = shape[dim] * inner_bytes;

    let mut out = Vec::with_capacity(outer * len * inner_bytes);
    for o in 0..outer {
        let begin = o * src_stride + start * inner_bytes;
        out.extend_from_slice(&data[begin..begin + len * inner_bytes]);
    }
    out
}

/// Bitwise equality of shape, dtype and contents.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.data == other.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_inner_dim() {
        let t = Tensor::from_f32(&[2, 4], &[0., 1., 2., 3., 4., 5., 6., 7.]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2]);
        assert_eq!(n.as_f32_slice(), &[1., 2., 5., 6.]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let t = Tensor::from_f32(&[2, 4], &[0.0; 8]);
        assert!(t.narrow(1, 3, 2).is_err());
        assert!(t.narrow(2, 0, 1).is_err());
    }

    #[test]
    fn test_cat_round_trips_narrow() {
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = Tensor::from_f32(&[2, 3, 4], &values);
        for dim in 0..3 {
            let size = t.shape()[dim];
            let parts: Vec<Tensor> = (0..size).map(|i| t.narrow(dim, i, 1).unwrap()).collect();
            assert_eq!(Tensor::cat(&parts, dim).unwrap(), t, "dim {dim}");
        }
    }

    #[test]
    fn test_cat_rejects_mismatched_shapes() {
        let a = Tensor::from_f32(&[2, 2], &[0.0; 4]);
        let b = Tensor::from_f32(&[3, 3], &[0.0; 9]);
        assert!(matches!(
            Tensor::cat(&[a, b], 0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_to_dtype_f16_round_trip() {
        let t = Tensor::from_f32(&[3], &[0.5, -1.25, 2.0]);
        let h = t.to_dtype(DType::F16).unwrap();
        assert_eq!(h.dtype(), DType::F16);
        assert_eq!(h.size_in_bytes(), 6);
        assert_eq!(h.to_f32_vec(), vec![0.5, -1.25, 2.0]);
    }

    #[test]
    fn test_to_dtype_rejects_integers() {
        let t = Tensor::from_i32(&[2], &[1, 2]);
        assert!(t.to_dtype(DType::F32).is_err());
        assert_eq!(t.to_dtype(DType::I32).unwrap(), t);
    }
}
