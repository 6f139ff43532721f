//! Host compute kernels.
//!
//! All arithmetic is f32 row-major. Weights are `(out, in)` matrices as stored
//! in checkpoints, so `C = A × Wᵀ` reduces to contiguous dot products of an
//! input row with a weight row. Output rows are parallelized with Rayon.

use std::str::FromStr;

use rayon::prelude::*;
use serde::Deserialize;

use crate::weights::LinearWeight;
use crate::{Error, Result};

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `A (M,K) × Wᵀ` for `W (N,K)` → `C (M,N)`.
#[allow(clippy::many_single_char_names)]
#[must_use]
pub fn matmul_nt(a: &[f32], w: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(w.len(), n * k);
    let mut c = vec![0.0f32; m * n];
    let row = |(r, c_row): (usize, &mut [f32])| {
        let a_row = &a[r * k..(r + 1) * k];
        for (col, out) in c_row.iter_mut().enumerate() {
            *out = dot(a_row, &w[col * k..(col + 1) * k]);
        }
    };
    if m == 1 {
        // GEMV (decode phase): single row, skip thread-pool overhead
        c.chunks_mut(n).enumerate().for_each(row);
    } else {
        c.par_chunks_mut(n).enumerate().for_each(row);
    }
    c
}

/// Dense f32 `(out, in)` weight, dequantized once when a model is loaded.
#[derive(Debug, Clone)]
pub struct DenseWeight {
    data: Vec<f32>,
    out_features: usize,
    in_features: usize,
}

impl DenseWeight {
    /// # Errors
    /// Returns [`Error::Quantization`] if a quantized weight's components
    /// are inconsistent with each other.
    pub fn from_linear(weight: &LinearWeight) -> Result<Self> {
        Ok(Self {
            data: weight.dequantize()?,
            out_features: weight.out_features(),
            in_features: weight.in_features(),
        })
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Apply a linear layer to `rows` input rows.
///
/// # Errors
/// Returns [`Error::ShapeMismatch`] if the input width or bias length does
/// not match the weight.
pub fn linear(
    input: &[f32],
    rows: usize,
    weight: &DenseWeight,
    bias: Option<&[f32]>,
) -> Result<Vec<f32>> {
    let (out_features, in_features) = (weight.out_features, weight.in_features);
    if input.len() != rows * in_features {
        return Err(Error::shape_mismatch(
            "linear input",
            &[rows, in_features],
            &[rows, input.len() / rows.max(1)],
        ));
    }
    let mut out = matmul_nt(input, &weight.data, rows, in_features, out_features);
    if let Some(bias) = bias {
        if bias.len() != out_features {
            return Err(Error::shape_mismatch("linear bias", &[out_features], &[bias.len()]));
        }
        for row in out.chunks_mut(out_features) {
            add_inplace(row, bias);
        }
    }
    Ok(out)
}

/// Layer normalization over the last dimension, row by row.
#[must_use]
pub fn layer_norm(input: &[f32], weight: &[f32], bias: &[f32], eps: f32) -> Vec<f32> {
    let hidden = weight.len();
    let mut out = vec![0.0f32; input.len()];
    for (row_in, row_out) in input.chunks(hidden).zip(out.chunks_mut(hidden)) {
        let mean = row_in.iter().sum::<f32>() / hidden as f32;
        let var = row_in.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / hidden as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for i in 0..hidden {
            row_out[i] = (row_in[i] - mean) * inv_std * weight[i] + bias[i];
        }
    }
    out
}

/// Numerically stable softmax, in place.
pub fn softmax_inplace(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

pub fn add_inplace(a: &mut [f32], b: &[f32]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

/// Element-wise activation named by `activation_function` in HF configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Activation {
    Relu,
    /// Exact (erf) GELU
    Gelu,
    /// Tanh approximation of GELU
    GeluNew,
    Silu,
}

impl Activation {
    pub fn apply(self, x: &mut [f32]) {
        match self {
            Self::Relu => x.iter_mut().for_each(|v| *v = v.max(0.0)),
            Self::Gelu => x
                .iter_mut()
                .for_each(|v| *v = 0.5 * *v * (1.0 + erf(*v / std::f32::consts::SQRT_2))),
            Self::GeluNew => x.iter_mut().for_each(|v| {
                let inner = 0.797_884_6 * (*v + 0.044_715 * *v * *v * *v);
                *v = 0.5 * *v * (1.0 + inner.tanh());
            }),
            Self::Silu => x.iter_mut().for_each(|v| *v /= 1.0 + (-*v).exp()),
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Self::Relu),
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::GeluNew),
            "silu" | "swish" => Ok(Self::Silu),
            other => Err(Error::InvalidConfig(format!(
                "unsupported activation function {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Abramowitz and Stegun 7.1.26, max error 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_6
            + t * (-0.284_496_74 + t * (1.421_413_7 + t * (-1.453_152_1 + t * 1.061_405_4))));
    sign * (1.0 - poly * (-x * x).exp())
}
