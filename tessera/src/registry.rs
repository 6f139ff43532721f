//! Architecture resolution by `model_type`
//!
//! Built-in architectures are always available. Builders registered with
//! [`ArchitectureRegistry::register_remote`] stand in for code shipped with a
//! checkpoint and are only handed out when the caller trusts remote code.
//! Nothing is ever compiled or executed from the model source itself.

use std::collections::HashMap;

use crate::model::{CausalLm, ModelConfig};
use crate::weights::WeightStore;
use crate::{Error, Result};

/// Builds a model for one rank from its configuration and weights.
pub type ModelBuilder = fn(&ModelConfig, &WeightStore) -> Result<Box<dyn CausalLm>>;

#[derive(Default, Clone)]
pub struct ArchitectureRegistry {
    builtin: HashMap<String, ModelBuilder>,
    remote: HashMap<String, ModelBuilder>,
}

impl ArchitectureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically known architecture.
    pub fn register(&mut self, model_type: &str, builder: ModelBuilder) -> &mut Self {
        self.builtin.insert(model_type.to_string(), builder);
        self
    }

    /// Register an externally supplied loader, gated by `trust_remote_code`.
    pub fn register_remote(&mut self, model_type: &str, builder: ModelBuilder) -> &mut Self {
        self.remote.insert(model_type.to_string(), builder);
        self
    }

    /// Built-in model types, sorted.
    #[must_use]
    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.builtin.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// # Errors
    /// Returns [`Error::RemoteCodeNotTrusted`] for an unknown type when
    /// `trust_remote_code` is false, and [`Error::UnsupportedModel`] when no
    /// loader exists at all.
    pub fn resolve(&self, model_type: &str, trust_remote_code: bool) -> Result<ModelBuilder> {
        if let Some(builder) = self.builtin.get(model_type) {
            return Ok(*builder);
        }
        if !trust_remote_code {
            return Err(Error::RemoteCodeNotTrusted(model_type.to_string()));
        }
        self.remote.get(model_type).copied().ok_or_else(|| {
            Error::UnsupportedModel(format!(
                "{model_type} (built in: {})",
                self.model_types().join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuse(_: &ModelConfig, _: &WeightStore) -> Result<Box<dyn CausalLm>> {
        Err(Error::UnsupportedModel("test builder".into()))
    }

    #[test]
    fn test_builtin_resolves_without_trust() {
        let mut registry = ArchitectureRegistry::new();
        registry.register("opt", refuse);
        assert!(registry.resolve("opt", false).is_ok());
        assert_eq!(registry.model_types(), vec!["opt"]);
    }

    #[test]
    fn test_unknown_requires_trust() {
        let mut registry = ArchitectureRegistry::new();
        registry.register_remote("custom", refuse);
        assert!(matches!(
            registry.resolve("custom", false),
            Err(Error::RemoteCodeNotTrusted(_))
        ));
        assert!(registry.resolve("custom", true).is_ok());
        assert!(matches!(
            registry.resolve("mystery", true),
            Err(Error::UnsupportedModel(_))
        ));
    }
}
