//! OPT model configuration

use serde::Deserialize;

use tessera::ops::Activation;
use tessera::{Error, ModelConfig, Result};

/// Configuration for OPT models
///
/// Parsed from the model's `config.json` file
#[derive(Debug, Clone, Deserialize)]
pub struct OptConfig {
    /// Vocabulary size
    pub vocab_size: usize,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Number of decoder layers
    pub num_hidden_layers: usize,

    /// Feed-forward inner dimension
    pub ffn_dim: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of learned positions (the table holds two more rows)
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Width of the token embeddings; differs from `hidden_size` on models
    /// with `project_in` / `project_out`
    #[serde(default)]
    pub word_embed_proj_dim: Option<usize>,

    /// Pre-norm (`true`, all sizes except 350m) or post-norm blocks
    #[serde(default = "default_true")]
    pub do_layer_norm_before: bool,

    /// Drop the decoder's final layer norm
    #[serde(default, rename = "_remove_final_layer_norm")]
    pub remove_final_layer_norm: bool,

    /// Linear layers carry biases
    #[serde(default = "default_true")]
    pub enable_bias: bool,

    /// Layer norms carry weight and bias
    #[serde(default = "default_true")]
    pub layer_norm_elementwise_affine: bool,

    #[serde(default = "default_activation")]
    pub activation_function: Activation,

    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

fn default_activation() -> Activation {
    Activation::Relu
}

/// Learned position embeddings are indexed at `position + POSITION_OFFSET`.
pub const POSITION_OFFSET: usize = 2;

/// Layer norm epsilon used by every OPT checkpoint.
pub const LAYER_NORM_EPS: f32 = 1e-5;

impl OptConfig {
    /// Typed view of a loaded model configuration.
    ///
    /// # Errors
    /// Returns an error if required fields are missing or the shape is
    /// inconsistent.
    pub fn from_model_config(config: &ModelConfig) -> Result<Self> {
        let opt: Self = config.parse()?;
        opt.validate()?;
        Ok(opt)
    }

    fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.word_embed_proj_dim.unwrap_or(self.hidden_size)
    }

    /// Token embeddings are projected to and from `hidden_size`.
    #[must_use]
    pub fn has_projections(&self) -> bool {
        self.embed_dim() != self.hidden_size
    }

    #[must_use]
    pub fn has_final_layer_norm(&self) -> bool {
        self.do_layer_norm_before && !self.remove_final_layer_norm
    }
}
