//! Weight loading
//!
//! [`WeightStore`] is the only entry point model code uses: it resolves names
//! across checkpoint files, slices tensors for this rank and hands out linear
//! weights in their quantized or dense representation.

pub mod quantization;
mod safetensors;
mod store;

pub use quantization::{
    GptqParams, GroupQuantized, LinearWeight, PackedQuantized, QuantizationBinding, Quantize,
};
pub use self::safetensors::save_safetensors;
pub use store::WeightStore;
