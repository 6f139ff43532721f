//! Tessera: sharded causal-LM serving core
//!
//! This crate provides the pieces every rank of a tensor-parallel group needs
//! before and during inference: process groups, device/precision policy,
//! weight stores that hand out per-rank shards, the KV cache threaded through
//! forward calls, and the [`CausalLm`] trait architectures implement.
//! Architectures live in their own crates (`tessera-opt`); the bootstrap
//! sequence lives in `tessera-runtime`.

pub mod device;
pub mod distributed;
pub mod dtype;
pub mod error;
pub mod hub;
pub mod kv_cache;
pub mod model;
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub mod ops;
pub mod registry;
pub mod shard;
pub mod speculative;
pub mod tensor;
pub mod tokenizer;
#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub mod weights;

pub use device::{Device, DeviceSpec, Hardware};
pub use distributed::{ProcessGroup, TopologyEnv};
pub use dtype::DType;
pub use error::{Error, Result};
pub use kv_cache::{KvCache, LayerKv};
pub use model::{CausalLm, ForwardOutput, ModelConfig, SpeculatorConfig, StepShape};
pub use registry::{ArchitectureRegistry, ModelBuilder};
pub use shard::{ShardConfig, ShardStrategy};
pub use speculative::MedusaSpeculator;
pub use tensor::Tensor;
pub use tokenizer::{Batch, TokenizerPolicy};
pub use weights::{LinearWeight, Quantize, WeightStore};
