//! Construction options for [`ShardedCausalLm`](crate::ShardedCausalLm)

use tessera::{DType, Quantize};

/// What to load and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Local directory or Hugging Face model id
    pub model_id: String,
    /// Branch, tag or commit for hub ids (default `main`)
    pub revision: Option<String>,
    pub quantize: Option<Quantize>,
    /// Directory or hub id of a Medusa speculator
    pub speculator: Option<String>,
    /// Storage dtype override; otherwise chosen from the hardware
    pub dtype: Option<DType>,
    /// Allow architectures that are not built in
    pub trust_remote_code: bool,
}

impl RuntimeOptions {
    #[must_use]
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            quantize: None,
            speculator: None,
            dtype: None,
            trust_remote_code: false,
        }
    }

    #[must_use]
    pub fn with_speculator(mut self, speculator: impl Into<String>) -> Self {
        self.speculator = Some(speculator.into());
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    #[must_use]
    pub fn with_quantize(mut self, quantize: Quantize) -> Self {
        self.quantize = Some(quantize);
        self
    }
}
