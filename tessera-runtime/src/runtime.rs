//! Sharded causal LM: construction sequence and forward-step contract

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, info_span};

use tessera::device::{self, DeviceSpec, Hardware};
use tessera::{
    distributed, hub, ArchitectureRegistry, CausalLm, ForwardOutput, KvCache, ModelConfig,
    ProcessGroup, Result, SpeculatorConfig, Tensor, TokenizerPolicy, WeightStore,
};

use crate::RuntimeOptions;

/// Registry with every architecture shipped in this workspace.
#[must_use]
pub fn builtin_registry() -> ArchitectureRegistry {
    let mut registry = ArchitectureRegistry::new();
    registry.register(tessera_opt::MODEL_TYPE, tessera_opt::build);
    registry
}

/// One rank's view of a tensor-parallel causal LM.
///
/// Every rank of the group constructs its own instance with the same
/// options and then issues the same forward calls in the same order.
pub struct ShardedCausalLm {
    group: ProcessGroup,
    device: DeviceSpec,
    model_dir: PathBuf,
    config: ModelConfig,
    tokenizer: TokenizerPolicy,
    model: Box<dyn CausalLm>,
}

impl std::fmt::Debug for ShardedCausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCausalLm")
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .field("device", &self.device)
            .field("model_type", &self.config.model_type)
            .finish_non_exhaustive()
    }
}

impl ShardedCausalLm {
    /// Join the process group described by the environment and load this
    /// rank's shard.
    ///
    /// # Errors
    /// Returns an error if the group cannot be formed or loading fails.
    pub fn new(options: &RuntimeOptions) -> Result<Self> {
        let group = distributed::initialize()?;
        Self::load(options, group, &Hardware::detect(), &builtin_registry())
    }

    /// Load this rank's shard into an existing process group.
    ///
    /// Contains two group-wide barriers; every rank must call this.
    ///
    /// # Errors
    /// Returns an error if the model, its tokenizer or its weights cannot be
    /// loaded, or if the architecture is unknown and not trusted.
    pub fn load(
        options: &RuntimeOptions,
        group: ProcessGroup,
        hardware: &Hardware,
        registry: &ArchitectureRegistry,
    ) -> Result<Self> {
        let span = info_span!("load", rank = group.rank(), world_size = group.world_size());
        let _enter = span.enter();
        let start = Instant::now();

        let device = device::select(hardware, group.rank(), options.dtype);
        info!(model_id = %options.model_id, %device, "Selected device");

        let revision = options.revision.as_deref();
        let model_dir = hub::resolve_model_dir(&options.model_id, revision)?;
        let speculator = options
            .speculator
            .as_deref()
            .map(|id| -> Result<SpeculatorConfig> {
                let dir = hub::resolve_model_dir(id, None)?;
                SpeculatorConfig::from_dir(id, &dir)
            })
            .transpose()?;
        let config = ModelConfig::from_file(model_dir.join("config.json"))?
            .with_serving_options(options.quantize, speculator);

        let max_length = config
            .raw()
            .get("max_position_embeddings")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| usize::try_from(n).ok());
        let tokenizer = TokenizerPolicy::from_pretrained(&model_dir, config.pad_token_id, max_length)?;
        debug!(pad_token_id = tokenizer.pad_token_id(), "Loaded tokenizer");

        group.barrier()?;

        let files = hub::weight_files(&model_dir, ".safetensors")?;
        let mut weights = WeightStore::open(&files, device, group.clone())?;
        weights.bind_quantization(&options.model_id, revision, options.quantize)?;

        let builder = registry.resolve(&config.model_type, options.trust_remote_code)?;
        let model = builder(&config, &weights)?;

        group.barrier()?;
        info!(
            model_type = %config.model_type,
            layers = model.num_layers(),
            vocab_size = model.vocab_size(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model ready"
        );

        Ok(Self {
            group,
            device,
            model_dir,
            config,
            tokenizer,
            model,
        })
    }

    /// Batches of unequal length must be left-padded before [`forward`](Self::forward).
    #[must_use]
    pub fn requires_padding(&self) -> bool {
        true
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    #[must_use]
    pub fn process_group(&self) -> &ProcessGroup {
        &self.group
    }

    #[must_use]
    pub fn device(&self) -> DeviceSpec {
        self.device
    }

    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn tokenizer(&self) -> &TokenizerPolicy {
        &self.tokenizer
    }

    #[must_use]
    pub fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Advance every sequence of the batch by the given positions.
    ///
    /// Pass `None` on the first call of a sequence and the returned
    /// `past_key_values` on every later one; the cache passed in is left
    /// untouched, so a failed step can be retried with it.
    ///
    /// # Errors
    /// Returns [`tessera::Error::ShapeMismatch`] for inconsistent inputs and
    /// [`tessera::Error::PositionOutOfRange`] for positions beyond the model's
    /// position table.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        position_ids: &Tensor,
        past_key_values: Option<&KvCache>,
    ) -> Result<ForwardOutput> {
        self.model
            .forward(input_ids, attention_mask, position_ids, past_key_values)
    }
}
