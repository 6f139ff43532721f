//! Quantized linear weights
//!
//! A linear layer's weight is one of three variants, chosen once when the
//! store's quantization mode is bound:
//!
//! - [`LinearWeight::Unquantized`]: a dense `(out, in)` matrix.
//! - [`LinearWeight::GroupQuantized`]: GPTQ int-packed weights with per-group
//!   scales and packed zero points, plus a row-to-group map (`g_idx`).
//! - [`LinearWeight::PackedQuantized`]: the symmetric 4-bit layout consumed by
//!   Marlin-style kernels; zero points are implicit and groups sequential.
//!
//! Models dequantize each weight once at load time into an
//! [`ops::DenseWeight`](crate::ops::DenseWeight).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::tensor::Tensor;
use crate::{DType, Error, Result};

/// Quantization modes selectable at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantize {
    /// GPTQ group-wise integer quantization
    Gptq,
    /// GPTQ checkpoints executed by the packed Marlin kernel
    Marlin,
}

impl fmt::Display for Quantize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gptq => write!(f, "gptq"),
            Self::Marlin => write!(f, "marlin"),
        }
    }
}

impl FromStr for Quantize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gptq" => Ok(Self::Gptq),
            "marlin" => Ok(Self::Marlin),
            other => Err(Error::Quantization(format!(
                "unknown quantization mode {other} (expected gptq or marlin)"
            ))),
        }
    }
}

/// GPTQ checkpoint parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GptqParams {
    /// Number of bits per weight (typically 4)
    pub bits: u32,

    /// Number of input rows per quantization group.
    /// 0 means a single group spanning the whole input dimension
    /// (JSON value `-1`).
    #[serde(deserialize_with = "deserialize_group_size")]
    pub group_size: usize,

    /// Act-order: rows are not grouped sequentially, `g_idx` decides.
    #[serde(default)]
    pub desc_act: bool,

    #[serde(default = "default_sym")]
    pub sym: bool,
}

fn default_sym() -> bool {
    true
}

/// Deserialize `group_size`: -1 (per-channel) → 0 sentinel, positive values pass through.
#[allow(clippy::cast_sign_loss)]
fn deserialize_group_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(if value <= 0 { 0 } else { value as usize })
}

#[derive(Deserialize)]
struct ConfigWithQuantization {
    quantization_config: Option<GptqParams>,
}

impl GptqParams {
    /// Read parameters from a checkpoint directory: the `quantization_config`
    /// section of `config.json`, then `quantize_config.json`.
    ///
    /// # Errors
    /// Returns an error if a file exists but cannot be parsed.
    pub fn from_model_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join("config.json");
        if config_path.is_file() {
            let config: ConfigWithQuantization =
                serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
            if let Some(params) = config.quantization_config {
                return Ok(Some(params));
            }
        }
        let quantize_config = dir.join("quantize_config.json");
        if quantize_config.is_file() {
            let params = serde_json::from_str(&std::fs::read_to_string(&quantize_config)?)?;
            return Ok(Some(params));
        }
        Ok(None)
    }

    /// Values packed into one 32-bit word.
    #[must_use]
    pub fn pack_factor(&self) -> usize {
        (32 / self.bits) as usize
    }

    /// Check the parameters are usable in `mode`.
    ///
    /// # Errors
    /// Returns [`Error::Quantization`] for unsupported bit widths, and for
    /// Marlin unless the checkpoint is symmetric 4-bit without act-order.
    pub fn validate(&self, mode: Quantize) -> Result<()> {
        if !matches!(self.bits, 2 | 4 | 8) {
            return Err(Error::Quantization(format!(
                "{}-bit GPTQ weights are not supported; \
                 host dequantization handles 2, 4 and 8 bits",
                self.bits
            )));
        }
        if mode == Quantize::Marlin && (self.bits != 4 || !self.sym || self.desc_act) {
            return Err(Error::Quantization(format!(
                "marlin requires symmetric 4-bit weights without act-order, \
                 got bits={} sym={} desc_act={}",
                self.bits, self.sym, self.desc_act
            )));
        }
        Ok(())
    }
}

/// Quantization state attached to a weight store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizationBinding {
    pub mode: Quantize,
    pub params: GptqParams,
}

/// GPTQ weight: int-packed values with per-group scales and zero points.
#[derive(Debug, Clone)]
pub struct GroupQuantized {
    /// `(in / pack, out)` packed values
    pub qweight: Tensor,
    /// `(groups, out / pack)` packed zero points
    pub qzeros: Tensor,
    /// `(groups, out)` scales
    pub scales: Tensor,
    /// `(in,)` group of each input row
    pub g_idx: Tensor,
    pub bits: u32,
    pub group_size: usize,
}

/// Symmetric packed weight: sequential groups, implicit zero point.
#[derive(Debug, Clone)]
pub struct PackedQuantized {
    /// `(in / pack, out)` packed values
    pub qweight: Tensor,
    /// `(groups, out)` scales
    pub scales: Tensor,
    pub bits: u32,
    pub group_size: usize,
}

/// A linear layer weight in whichever representation the checkpoint uses.
#[derive(Debug, Clone)]
pub enum LinearWeight {
    /// Dense `(out, in)` matrix
    Unquantized(Tensor),
    GroupQuantized(GroupQuantized),
    PackedQuantized(PackedQuantized),
}

impl LinearWeight {
    #[must_use]
    pub fn out_features(&self) -> usize {
        match self {
            Self::Unquantized(w) => w.shape()[0],
            Self::GroupQuantized(q) => q.qweight.shape()[1],
            Self::PackedQuantized(q) => q.qweight.shape()[1],
        }
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        match self {
            Self::Unquantized(w) => w.shape()[1],
            Self::GroupQuantized(q) => q.qweight.shape()[0] * (32 / q.bits) as usize,
            Self::PackedQuantized(q) => q.qweight.shape()[0] * (32 / q.bits) as usize,
        }
    }

    /// Dense `(out, in)` f32 values.
    ///
    /// # Errors
    /// Returns [`Error::Quantization`] if the packed components are
    /// inconsistent with each other.
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        match self {
            Self::Unquantized(w) => Ok(w.to_f32_vec()),
            Self::GroupQuantized(q) => {
                let zeros = unpack_columns(&q.qzeros, q.bits)?;
                let g_idx: Vec<usize> = q
                    .g_idx
                    .as_i32_slice()
                    .iter()
                    .map(|&g| usize::try_from(g).unwrap_or(usize::MAX))
                    .collect();
                // GPTQ stores zero points minus one.
                dequantize_groups(&q.qweight, &q.scales, q.bits, |row, col| {
                    let group = g_idx[row];
                    let zero = zeros.get(group).and_then(|z| z.get(col)).ok_or_else(|| {
                        Error::Quantization(format!("group {group} of row {row} has no zero point"))
                    })?;
                    Ok((group, *zero as f32 + 1.0))
                })
            }
            Self::PackedQuantized(q) => {
                let in_features = self.in_features();
                let group_size = if q.group_size == 0 {
                    in_features
                } else {
                    q.group_size
                };
                let zero = (1u32 << (q.bits - 1)) as f32;
                dequantize_groups(&q.qweight, &q.scales, q.bits, |row, _| {
                    Ok((row / group_size, zero))
                })
            }
        }
    }
}

/// Unpack a `(rows, cols / pack)` int32 tensor into `(rows, cols)` values.
fn unpack_columns(packed: &Tensor, bits: u32) -> Result<Vec<Vec<u32>>> {
    check_int(packed, "qzeros")?;
    let pack = (32 / bits) as usize;
    let mask = (1u32 << bits) - 1;
    let [rows, words] = dims2(packed, "qzeros")?;
    let data = packed.as_i32_slice();
    Ok((0..rows)
        .map(|r| {
            (0..words * pack)
                .map(|c| {
                    let word = data[r * words + c / pack] as u32;
                    (word >> ((c % pack) as u32 * bits)) & mask
                })
                .collect()
        })
        .collect())
}

/// Shared GPTQ-style dequantization loop; `group_and_zero(row, col)` maps an
/// input row and output column to its group and zero point.
fn dequantize_groups(
    qweight: &Tensor,
    scales: &Tensor,
    bits: u32,
    group_and_zero: impl Fn(usize, usize) -> Result<(usize, f32)>,
) -> Result<Vec<f32>> {
    check_int(qweight, "qweight")?;
    let pack = (32 / bits) as usize;
    let mask = (1u32 << bits) - 1;
    let [words, out] = dims2(qweight, "qweight")?;
    let in_features = words * pack;
    let [groups, scale_cols] = dims2(scales, "scales")?;
    if scale_cols != out {
        return Err(Error::Quantization(format!(
            "scales have {scale_cols} columns, qweight has {out}"
        )));
    }
    let scales = scales.to_f32_vec();
    let qweight = qweight.as_i32_slice();

    let mut dense = vec![0.0f32; out * in_features];
    for row in 0..in_features {
        let shift = (row % pack) as u32 * bits;
        for col in 0..out {
            let (group, zero) = group_and_zero(row, col)?;
            if group >= groups {
                return Err(Error::Quantization(format!(
                    "row {row} maps to group {group}, only {groups} groups"
                )));
            }
            let q = ((qweight[(row / pack) * out + col] as u32) >> shift) & mask;
            dense[col * in_features + row] = (q as f32 - zero) * scales[group * out + col];
        }
    }
    Ok(dense)
}

fn check_int(t: &Tensor, what: &str) -> Result<()> {
    if t.dtype() == DType::I32 {
        Ok(())
    } else {
        Err(Error::Quantization(format!(
            "{what} must be i32, got {}",
            t.dtype()
        )))
    }
}

fn dims2(t: &Tensor, what: &str) -> Result<[usize; 2]> {
    match *t.shape() {
        [a, b] => Ok([a, b]),
        _ => Err(Error::Quantization(format!(
            "{what} must be 2-D, got {:?}",
            t.shape()
        ))),
    }
}

/// Pack `(rows, cols)` small unsigned values along rows into `(rows / pack, cols)`
/// int32 words, the GPTQ `qweight` layout.
#[must_use]
pub fn pack_rows(values: &[u32], rows: usize, cols: usize, bits: u32) -> Vec<i32> {
    let pack = (32 / bits) as usize;
    let mut out = vec![0u32; rows / pack * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[(r / pack) * cols + c] |= values[r * cols + c] << ((r % pack) as u32 * bits);
        }
    }
    out.into_iter().map(|w| w as i32).collect()
}

/// Pack `(rows, cols)` small unsigned values along columns into
/// `(rows, cols / pack)` int32 words, the GPTQ `qzeros` layout.
#[must_use]
pub fn pack_columns(values: &[u32], rows: usize, cols: usize, bits: u32) -> Vec<i32> {
    let pack = (32 / bits) as usize;
    let mut out = vec![0u32; rows * (cols / pack)];
    for r in 0..rows {
        for c in 0..cols {
            out[r * (cols / pack) + c / pack] |= values[r * cols + c] << ((c % pack) as u32 * bits);
        }
    }
    out.into_iter().map(|w| w as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8 input rows, 8 output columns, 4-bit, groups of 4 rows.
    fn gptq_fixture() -> (GroupQuantized, Vec<f32>) {
        let (rows, cols, bits, group_size) = (8usize, 8usize, 4u32, 4usize);
        let values: Vec<u32> = (0..rows * cols).map(|i| (i * 7 % 16) as u32).collect();
        let zeros: Vec<u32> = (0..2 * cols).map(|i| (i % 5) as u32 + 6).collect();
        let scales: Vec<f32> = (0..2 * cols).map(|i| 0.01 * (i + 1) as f32).collect();

        let mut expected = vec![0.0f32; cols * rows];
        for r in 0..rows {
            let g = r / group_size;
            for c in 0..cols {
                // Stored zero points are one below the effective zero.
                let zero = zeros[g * cols + c] as f32 + 1.0;
                expected[c * rows + r] = (values[r * cols + c] as f32 - zero) * scales[g * cols + c];
            }
        }

        let q = GroupQuantized {
            qweight: Tensor::from_i32(&[rows / 8, cols], &pack_rows(&values, rows, cols, bits)),
            qzeros: Tensor::from_i32(&[2, cols / 8], &pack_columns(&zeros, 2, cols, bits)),
            scales: Tensor::from_f32(&[2, cols], &scales),
            g_idx: Tensor::from_i32(&[rows], &(0..rows).map(|r| (r / group_size) as i32).collect::<Vec<_>>()),
            bits,
            group_size,
        };
        (q, expected)
    }

    #[test]
    fn test_quantize_parse() {
        assert_eq!("GPTQ".parse::<Quantize>().unwrap(), Quantize::Gptq);
        assert_eq!("marlin".parse::<Quantize>().unwrap(), Quantize::Marlin);
        assert!("awq".parse::<Quantize>().is_err());
    }

    #[test]
    fn test_params_group_size_minus_one() {
        let params: GptqParams =
            serde_json::from_str(r#"{"bits": 4, "group_size": -1, "desc_act": true}"#).unwrap();
        assert_eq!(params.group_size, 0);
        assert!(params.desc_act);
        assert!(params.sym);
        assert_eq!(params.pack_factor(), 8);
    }

    #[test]
    fn test_marlin_validation() {
        let params = GptqParams {
            bits: 4,
            group_size: 128,
            desc_act: false,
            sym: true,
        };
        assert!(params.validate(Quantize::Marlin).is_ok());
        let act_order = GptqParams {
            desc_act: true,
            ..params
        };
        assert!(act_order.validate(Quantize::Gptq).is_ok());
        assert!(act_order.validate(Quantize::Marlin).is_err());
        let eight_bit = GptqParams { bits: 8, ..params };
        assert!(eight_bit.validate(Quantize::Marlin).is_err());
        let three_bit = GptqParams { bits: 3, ..params };
        match three_bit.validate(Quantize::Gptq) {
            Err(Error::Quantization(msg)) => assert!(msg.contains("2, 4 and 8 bits")),
            other => panic!("expected a quantization error, got {other:?}"),
        }
    }

    #[test]
    fn test_group_quantized_dequantize() {
        let (q, expected) = gptq_fixture();
        let weight = LinearWeight::GroupQuantized(q);
        assert_eq!(weight.in_features(), 8);
        assert_eq!(weight.out_features(), 8);
        let dense = weight.dequantize().unwrap();
        for (got, want) in dense.iter().zip(&expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn test_packed_quantized_uses_midpoint() {
        let (rows, cols) = (8usize, 2usize);
        let values: Vec<u32> = (0..rows * cols).map(|i| (i % 16) as u32).collect();
        let weight = LinearWeight::PackedQuantized(PackedQuantized {
            qweight: Tensor::from_i32(&[1, cols], &pack_rows(&values, rows, cols, 4)),
            scales: Tensor::from_f32(&[1, cols], &[0.5, 2.0]),
            bits: 4,
            group_size: 0,
        });
        let dense = weight.dequantize().unwrap();
        // Column 1, row 3: value 7, zero 8, scale 2.0
        assert_eq!(dense[rows + 3], -2.0);
        assert_eq!(dense[0], (0.0 - 8.0) * 0.5);
    }

    #[test]
    fn test_out_of_range_group_is_an_error() {
        let (mut q, _) = gptq_fixture();
        q.g_idx = Tensor::from_i32(&[8], &[0, 0, 0, 0, 1, 1, 1, 5]);
        assert!(matches!(
            LinearWeight::GroupQuantized(q).dequantize(),
            Err(Error::Quantization(_))
        ));
    }

    #[test]
    fn test_params_from_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(GptqParams::from_model_dir(dir.path()).unwrap(), None);

        std::fs::write(
            dir.path().join("quantize_config.json"),
            r#"{"bits": 4, "group_size": 64, "desc_act": false}"#,
        )
        .unwrap();
        assert_eq!(
            GptqParams::from_model_dir(dir.path()).unwrap().unwrap().group_size,
            64
        );

        // config.json takes precedence over quantize_config.json
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "opt", "quantization_config": {"bits": 8, "group_size": 128, "quant_method": "gptq"}}"#,
        )
        .unwrap();
        assert_eq!(GptqParams::from_model_dir(dir.path()).unwrap().unwrap().bits, 8);
    }
}
