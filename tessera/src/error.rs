//! Error types for Tessera

use thiserror::Error;

/// Result type alias using Tessera's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tessera operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Weight not found: {0}")]
    MissingWeight(String),

    #[error(
        "Cannot shard {name}: dimension {dim} has size {size}, \
         not divisible by world_size {world_size}"
    )]
    ShardAlignment {
        name: String,
        dim: usize,
        size: usize,
        world_size: usize,
    },

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Position {position} out of range (max {max})")]
    PositionOutOfRange { position: usize, max: usize },

    #[error("Token id {token} out of range (vocab size {vocab_size})")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("Quantization error: {0}")]
    Quantization(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("No weight files with extension {extension} in {dir}")]
    WeightFilesNotFound { dir: String, extension: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error(
        "Model type {0} is not built in; loading it requires trust_remote_code"
    )]
    RemoteCodeNotTrusted(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::ShapeMismatch`] for the named input.
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Whether this error can only arise while a model is being loaded.
    ///
    /// Load-time errors mean the checkpoint, its configuration, or the
    /// process group is unusable; the process should abort startup.
    /// Everything else is local to a single call.
    #[must_use]
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            Self::Topology(_)
                | Self::MissingWeight(_)
                | Self::ShardAlignment { .. }
                | Self::Assembly(_)
                | Self::Quantization(_)
                | Self::ModelNotFound(_)
                | Self::WeightFilesNotFound { .. }
                | Self::InvalidConfig(_)
                | Self::UnsupportedModel(_)
                | Self::RemoteCodeNotTrusted(_)
                | Self::SafeTensors(_)
        )
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}
