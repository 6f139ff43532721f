//! OPT model implementation for Tessera

mod config;
mod model;
pub mod sharding;

pub use config::{OptConfig, LAYER_NORM_EPS, POSITION_OFFSET};
pub use model::{build, OptForCausalLm};

/// `model_type` handled by [`build`].
pub const MODEL_TYPE: &str = "opt";
