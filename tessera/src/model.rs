//! Model trait and configuration shared by every architecture
//!
//! Architectures implement [`CausalLm`]; the runtime only ever talks to
//! models through it.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::dtype::DType;
use crate::kv_cache::KvCache;
use crate::tensor::Tensor;
use crate::weights::Quantize;
use crate::{Error, Result};

/// Medusa-style speculator head configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculatorConfig {
    /// Identity the speculator was requested by
    pub model_id: String,
    /// Directory holding its `config.json` and weights
    pub path: PathBuf,
    /// Number of speculative heads (tokens proposed ahead)
    pub num_heads: usize,
    /// Residual blocks per head
    pub num_layers: usize,
}

#[derive(Deserialize)]
struct MedusaJson {
    medusa_num_heads: usize,
    #[serde(default = "default_medusa_num_layers")]
    medusa_num_layers: usize,
}

fn default_medusa_num_layers() -> usize {
    1
}

impl SpeculatorConfig {
    /// Read `config.json` from a speculator directory.
    ///
    /// # Errors
    /// Returns an error if the file is missing or lacks `medusa_num_heads`.
    pub fn from_dir(model_id: &str, dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(dir.join("config.json"))?;
        let json: MedusaJson = serde_json::from_str(&content)?;
        if json.medusa_num_heads == 0 {
            return Err(Error::InvalidConfig(format!(
                "speculator {model_id} declares zero heads"
            )));
        }
        Ok(Self {
            model_id: model_id.to_string(),
            path: dir.to_path_buf(),
            num_heads: json.medusa_num_heads,
            num_layers: json.medusa_num_layers,
        })
    }
}

/// A model's `config.json` plus the serving options injected at load time.
///
/// Architecture crates read their typed view through [`ModelConfig::parse`].
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_type: String,
    pub pad_token_id: Option<u32>,
    /// Declared `torch_dtype`, informational only.
    pub torch_dtype: Option<DType>,
    pub quantize: Option<Quantize>,
    pub speculator: Option<SpeculatorConfig>,
    raw: serde_json::Value,
}

#[derive(Deserialize)]
struct CommonFields {
    model_type: String,
    #[serde(default)]
    pad_token_id: Option<u32>,
    #[serde(default)]
    torch_dtype: Option<String>,
}

impl ModelConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or lacks `model_type`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&content)?)
    }

    /// # Errors
    /// Returns an error if `model_type` is missing.
    pub fn from_json(raw: serde_json::Value) -> Result<Self> {
        let common: CommonFields = serde_json::from_value(raw.clone())?;
        Ok(Self {
            model_type: common.model_type,
            pad_token_id: common.pad_token_id,
            torch_dtype: common.torch_dtype.and_then(|d| d.parse().ok()),
            quantize: None,
            speculator: None,
            raw,
        })
    }

    /// Attach the serving options. Consumes the config so it is fixed once
    /// loading starts.
    #[must_use]
    pub fn with_serving_options(
        mut self,
        quantize: Option<Quantize>,
        speculator: Option<SpeculatorConfig>,
    ) -> Self {
        self.quantize = quantize;
        self.speculator = speculator;
        self
    }

    /// Deserialize the architecture-specific view of the configuration.
    ///
    /// # Errors
    /// Returns an error if required fields are missing or mistyped.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.raw)?)
    }

    #[must_use]
    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

/// Result of one forward step.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `(batch, seq, vocab)` unnormalized scores for every input position
    pub logits: Tensor,
    /// `(batch, num_heads * vocab)` speculator scores for the last position,
    /// `None` without a speculator
    pub speculative_logits: Option<Tensor>,
    /// The input cache extended with this step's positions
    pub past_key_values: KvCache,
}

/// A decoder-only model loaded for one rank.
///
/// Every rank of a group must call `forward` with the same inputs in the same
/// order; implementations combine partial results across ranks internally.
pub trait CausalLm: Send + Sync {
    fn num_layers(&self) -> usize;

    /// Full vocabulary size (logits width).
    fn vocab_size(&self) -> usize;

    /// One decoding step. `input_ids` and `position_ids` are `(batch, seq)`,
    /// `attention_mask` is `(batch, past + seq)`, all u32.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] for inconsistent inputs; the cache
    /// passed in is never modified.
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        position_ids: &Tensor,
        past_key_values: Option<&KvCache>,
    ) -> Result<ForwardOutput>;
}

/// Batch geometry of a validated forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepShape {
    pub batch: usize,
    /// New positions in this call
    pub seq: usize,
    /// Positions already in the cache
    pub past: usize,
}

/// Check that forward inputs agree with each other and with the cache.
///
/// # Errors
/// Returns [`Error::ShapeMismatch`] on any disagreement and
/// [`Error::UnsupportedDtype`] for non-u32 inputs.
pub fn check_forward_inputs(
    input_ids: &Tensor,
    attention_mask: &Tensor,
    position_ids: &Tensor,
    past_key_values: Option<&KvCache>,
) -> Result<StepShape> {
    for (name, t) in [
        ("input_ids", input_ids),
        ("attention_mask", attention_mask),
        ("position_ids", position_ids),
    ] {
        if t.ndim() != 2 {
            return Err(Error::shape_mismatch(
                format!("{name} (expected 2-D)"),
                &[0, 0],
                t.shape(),
            ));
        }
        if t.dtype() != DType::U32 {
            return Err(Error::UnsupportedDtype(format!(
                "{name} must be u32, got {}",
                t.dtype()
            )));
        }
    }

    let [batch, seq] = [input_ids.shape()[0], input_ids.shape()[1]];
    for (name, t) in [("attention_mask", attention_mask), ("position_ids", position_ids)] {
        if t.shape()[0] != batch {
            return Err(Error::shape_mismatch(
                format!("{name} batch"),
                &[batch],
                &[t.shape()[0]],
            ));
        }
    }
    if position_ids.shape()[1] != seq {
        return Err(Error::shape_mismatch(
            "position_ids",
            input_ids.shape(),
            position_ids.shape(),
        ));
    }

    let past = match past_key_values {
        None => 0,
        Some(cache) => {
            if let Some(cache_batch) = cache.batch_size() {
                if cache_batch != batch {
                    return Err(Error::shape_mismatch(
                        "past_key_values batch",
                        &[batch],
                        &[cache_batch],
                    ));
                }
            }
            cache.seq_len()
        }
    };
    if attention_mask.shape()[1] != past + seq {
        return Err(Error::shape_mismatch(
            "attention_mask (batch, past + seq)",
            &[batch, past + seq],
            attention_mask.shape(),
        ));
    }
    if seq == 0 {
        return Err(Error::shape_mismatch("input_ids (empty step)", &[batch, 1], input_ids.shape()));
    }

    Ok(StepShape { batch, seq, past })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::LayerKv;

    fn ids(batch: usize, seq: usize) -> Tensor {
        Tensor::from_u32(&[batch, seq], &vec![1; batch * seq])
    }

    fn cache(batch: usize, seq: usize) -> KvCache {
        let shape = [batch, 1, seq, 2];
        let n = shape.iter().product();
        let t = Tensor::from_f32(&shape, &vec![0.0; n]);
        KvCache::from_layers(vec![LayerKv::new(t.clone(), t).unwrap()]).unwrap()
    }

    #[test]
    fn test_config_common_fields_and_injection() {
        let raw = serde_json::json!({
            "model_type": "opt",
            "pad_token_id": 1,
            "torch_dtype": "float16",
            "hidden_size": 768
        });
        let config = ModelConfig::from_json(raw)
            .unwrap()
            .with_serving_options(Some(Quantize::Gptq), None);
        assert_eq!(config.model_type, "opt");
        assert_eq!(config.pad_token_id, Some(1));
        assert_eq!(config.torch_dtype, Some(DType::F16));
        assert_eq!(config.quantize, Some(Quantize::Gptq));
        assert!(config.speculator.is_none());

        #[derive(Deserialize)]
        struct Hidden {
            hidden_size: usize,
        }
        assert_eq!(config.parse::<Hidden>().unwrap().hidden_size, 768);
    }

    #[test]
    fn test_config_requires_model_type() {
        assert!(ModelConfig::from_json(serde_json::json!({"hidden_size": 8})).is_err());
    }

    #[test]
    fn test_speculator_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"medusa_num_heads": 3, "medusa_num_layers": 1}"#,
        )
        .unwrap();
        let spec = SpeculatorConfig::from_dir("org/medusa", dir.path()).unwrap();
        assert_eq!(spec.num_heads, 3);
        assert_eq!(spec.num_layers, 1);
        assert_eq!(spec.path, dir.path());
    }

    #[test]
    fn test_check_first_step() {
        let shape = check_forward_inputs(&ids(2, 5), &ids(2, 5), &ids(2, 5), None).unwrap();
        assert_eq!(
            shape,
            StepShape {
                batch: 2,
                seq: 5,
                past: 0
            }
        );
    }

    #[test]
    fn test_check_mask_batch_mismatch() {
        let err = check_forward_inputs(&ids(3, 4), &ids(4, 4), &ids(3, 4), None).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(err.to_string().contains("attention_mask"));
    }

    #[test]
    fn test_check_cache_batch_mismatch() {
        let past = cache(2, 4);
        let err = check_forward_inputs(&ids(3, 1), &ids(3, 5), &ids(3, 1), Some(&past)).unwrap_err();
        assert!(err.to_string().contains("past_key_values"));
    }

    #[test]
    fn test_check_mask_covers_past() {
        let past = cache(1, 4);
        assert!(check_forward_inputs(&ids(1, 1), &ids(1, 5), &ids(1, 1), Some(&past)).is_ok());
        assert!(check_forward_inputs(&ids(1, 1), &ids(1, 1), &ids(1, 1), Some(&past)).is_err());
    }

    #[test]
    fn test_check_rejects_float_ids() {
        let float_ids = Tensor::from_f32(&[1, 1], &[1.0]);
        assert!(matches!(
            check_forward_inputs(&float_ids, &ids(1, 1), &ids(1, 1), None),
            Err(Error::UnsupportedDtype(_))
        ));
    }
}
