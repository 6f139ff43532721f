//! Tessera Runtime: sharded causal-LM bootstrap
//!
//! [`ShardedCausalLm`] runs the per-rank construction sequence (topology,
//! device, tokenizer, configuration, weights, architecture) and exposes the
//! single-step forward contract a generation loop drives.
//!
//! ```text
//! ShardedCausalLm   ← tokenizer policy + forward contract
//!   └── Box<dyn CausalLm>  ← this rank's shard of the model
//!         └── WeightStore  ← mmapped checkpoint, sharded reads
//! ```

mod options;
mod runtime;

pub use options::RuntimeOptions;
pub use runtime::{builtin_registry, ShardedCausalLm};
