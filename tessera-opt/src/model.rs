//! OPT causal LM, one tensor-parallel shard per rank
//!
//! Each rank holds a slice of the attention heads, of the feed-forward
//! columns and of the vocabulary. Partial results are combined with the
//! group's collectives so every rank ends a forward call with the same
//! hidden states and the same full-vocabulary logits.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use tessera::model::check_forward_inputs;
use tessera::ops::{self, Activation, DenseWeight};
use tessera::{
    CausalLm, Error, ForwardOutput, KvCache, LayerKv, LinearWeight, MedusaSpeculator,
    ModelConfig, ProcessGroup, Result, ShardStrategy, Tensor, WeightStore,
};

use crate::config::{OptConfig, LAYER_NORM_EPS, POSITION_OFFSET};
use crate::sharding::{LocalSizes, OptParam};

const PREFIX: &str = "model.decoder";

fn missing_to_assembly(e: Error) -> Error {
    match e {
        Error::MissingWeight(name) => Error::Assembly(format!("missing parameter {name}")),
        other => other,
    }
}

/// Reads parameters and checks them against the configuration.
struct Loader<'a> {
    weights: &'a WeightStore,
    config: &'a OptConfig,
}

impl Loader<'_> {
    fn tensor(&self, name: &str, strategy: ShardStrategy, expected: &[usize]) -> Result<Tensor> {
        let tensor = self
            .weights
            .get_with_strategy(name, strategy)
            .map_err(missing_to_assembly)?;
        if tensor.shape() != expected {
            return Err(Error::Assembly(format!(
                "{name} has shape {:?}, expected {expected:?}",
                tensor.shape()
            )));
        }
        Ok(tensor)
    }

    fn layer_norm(&self, prefix: &str, dim: usize) -> Result<LayerNorm> {
        if !self.config.layer_norm_elementwise_affine {
            return Ok(LayerNorm {
                weight: vec![1.0; dim],
                bias: vec![0.0; dim],
            });
        }
        let strategy = OptParam::LayerNorm.strategy();
        Ok(LayerNorm {
            weight: self
                .tensor(&format!("{prefix}.weight"), strategy, &[dim])?
                .to_f32_vec(),
            bias: self
                .tensor(&format!("{prefix}.bias"), strategy, &[dim])?
                .to_f32_vec(),
        })
    }

    /// `(out, in)` are this rank's dimensions.
    fn linear(&self, prefix: &str, param: OptParam, out: usize, inp: usize) -> Result<Linear> {
        let weight = self
            .weights
            .get_linear(prefix, param.strategy())
            .map_err(missing_to_assembly)?;
        if (weight.out_features(), weight.in_features()) != (out, inp) {
            return Err(Error::Assembly(format!(
                "{prefix} is {}x{}, expected {out}x{inp}",
                weight.out_features(),
                weight.in_features()
            )));
        }
        let bias = if self.config.enable_bias {
            let name = format!("{prefix}.bias");
            Some(self.tensor(&name, param.bias_strategy(), &[out])?.to_f32_vec())
        } else {
            None
        };
        Ok(Linear {
            weight: DenseWeight::from_linear(&weight)?,
            bias,
        })
    }

    /// Bias-free replicated projection between embedding and hidden width.
    fn projection(&self, name: &str, out: usize, inp: usize) -> Result<DenseWeight> {
        let weight = self.tensor(name, OptParam::Projection.strategy(), &[out, inp])?;
        DenseWeight::from_linear(&LinearWeight::Unquantized(weight))
    }
}

struct LayerNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl LayerNorm {
    fn forward(&self, x: &[f32]) -> Vec<f32> {
        ops::layer_norm(x, &self.weight, &self.bias, LAYER_NORM_EPS)
    }
}

struct Linear {
    weight: DenseWeight,
    bias: Option<Vec<f32>>,
}

impl Linear {
    fn forward(&self, x: &[f32], rows: usize) -> Result<Vec<f32>> {
        ops::linear(x, rows, &self.weight, self.bias.as_deref())
    }

    /// Row-parallel application: partial products are summed across ranks
    /// and the replicated bias is added once afterwards.
    fn forward_reduced(&self, x: &[f32], rows: usize, group: &ProcessGroup) -> Result<Vec<f32>> {
        let mut out = ops::linear(x, rows, &self.weight, None)?;
        group.all_reduce_sum(&mut out)?;
        if let Some(bias) = &self.bias {
            for row in out.chunks_mut(bias.len()) {
                ops::add_inplace(row, bias);
            }
        }
        Ok(out)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    /// Heads held by this rank
    num_heads: usize,
    head_dim: usize,
    scaling: f32,
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

/// OPT decoder with the token embedding tied as output head.
pub struct OptForCausalLm {
    config: OptConfig,
    group: ProcessGroup,
    sizes: LocalSizes,
    /// `(local_vocab, embed_dim)` rows `[vocab_start, vocab_start + local_vocab)`
    embed_tokens: Vec<f32>,
    /// `(max_position_embeddings + 2, hidden)`
    embed_positions: Vec<f32>,
    project_in: Option<DenseWeight>,
    project_out: Option<DenseWeight>,
    final_layer_norm: Option<LayerNorm>,
    layers: Vec<DecoderLayer>,
    activation: Activation,
    speculator: Option<MedusaSpeculator>,
}

impl OptForCausalLm {
    /// Load this rank's shard of an OPT checkpoint.
    ///
    /// # Errors
    /// Returns [`Error::Assembly`] if a parameter is missing or shaped
    /// inconsistently with the configuration, and [`Error::ShardAlignment`]
    /// if heads, feed-forward width or vocabulary do not divide by the
    /// world size.
    pub fn assemble(model_config: &ModelConfig, weights: &WeightStore) -> Result<Self> {
        let start = Instant::now();
        let config = OptConfig::from_model_config(model_config)?;
        let group = weights.process_group().clone();
        let sizes = LocalSizes::new(&config, group.shard_config())?;
        if model_config.quantize.is_some() && weights.quantization().is_none() {
            return Err(Error::Assembly(
                "quantize is set but the weight store has no quantization parameters".into(),
            ));
        }
        let loader = Loader {
            weights,
            config: &config,
        };

        let hidden = config.hidden_size;
        let embed_dim = config.embed_dim();
        let head_dim = config.head_dim();
        let local_hidden = sizes.heads * head_dim;

        let embed_tokens = loader
            .tensor(
                &format!("{PREFIX}.embed_tokens.weight"),
                OptParam::TokenEmbedding.strategy(),
                &[sizes.vocab, embed_dim],
            )?
            .to_f32_vec();
        let embed_positions = loader
            .tensor(
                &format!("{PREFIX}.embed_positions.weight"),
                OptParam::PositionEmbedding.strategy(),
                &[config.max_position_embeddings + POSITION_OFFSET, hidden],
            )?
            .to_f32_vec();

        let (project_in, project_out) = if config.has_projections() {
            let project_in = format!("{PREFIX}.project_in.weight");
            let project_out = format!("{PREFIX}.project_out.weight");
            (
                Some(loader.projection(&project_in, hidden, embed_dim)?),
                Some(loader.projection(&project_out, embed_dim, hidden)?),
            )
        } else {
            (None, None)
        };
        let final_layer_norm = if config.has_final_layer_norm() {
            Some(loader.layer_norm(&format!("{PREFIX}.final_layer_norm"), hidden)?)
        } else {
            None
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let p = format!("{PREFIX}.layers.{i}");
            let attn_in = |name: &str| {
                let prefix = format!("{p}.self_attn.{name}");
                loader.linear(&prefix, OptParam::AttentionInput, local_hidden, hidden)
            };
            let out_proj = format!("{p}.self_attn.out_proj");
            layers.push(DecoderLayer {
                self_attn: Attention {
                    q_proj: attn_in("q_proj")?,
                    k_proj: attn_in("k_proj")?,
                    v_proj: attn_in("v_proj")?,
                    out_proj: loader.linear(&out_proj, OptParam::OutProj, hidden, local_hidden)?,
                    num_heads: sizes.heads,
                    head_dim,
                    scaling: (head_dim as f32).powf(-0.5),
                },
                self_attn_layer_norm: loader
                    .layer_norm(&format!("{p}.self_attn_layer_norm"), hidden)?,
                fc1: loader.linear(&format!("{p}.fc1"), OptParam::Fc1, sizes.ffn_dim, hidden)?,
                fc2: loader.linear(&format!("{p}.fc2"), OptParam::Fc2, hidden, sizes.ffn_dim)?,
                final_layer_norm: loader.layer_norm(&format!("{p}.final_layer_norm"), hidden)?,
            });
        }

        let speculator = match &model_config.speculator {
            Some(spec) => {
                let speculator = MedusaSpeculator::open(spec, weights)?;
                if speculator.hidden_size() != embed_dim || speculator.vocab_size() != config.vocab_size {
                    return Err(Error::Assembly(format!(
                        "speculator {} expects hidden {} / vocab {}, model has {embed_dim} / {}",
                        spec.model_id,
                        speculator.hidden_size(),
                        speculator.vocab_size(),
                        config.vocab_size
                    )));
                }
                Some(speculator)
            }
            None => None,
        };

        info!(
            rank = group.rank(),
            world_size = group.world_size(),
            layers = layers.len(),
            local_heads = sizes.heads,
            local_vocab = sizes.vocab,
            speculator = speculator.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Assembled OPT shard"
        );

        Ok(Self {
            activation: config.activation_function,
            config,
            group,
            sizes,
            embed_tokens,
            embed_positions,
            project_in,
            project_out,
            final_layer_norm,
            layers,
            speculator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &OptConfig {
        &self.config
    }

    #[must_use]
    pub fn speculator(&self) -> Option<&MedusaSpeculator> {
        self.speculator.as_ref()
    }

    /// Token embeddings for every input position, reduced across the
    /// vocabulary shards.
    fn embed(&self, input_ids: &[u32]) -> Result<Vec<f32>> {
        let dim = self.config.embed_dim();
        let (start, len) = (self.sizes.vocab_start, self.sizes.vocab);
        let mut out = vec![0.0f32; input_ids.len() * dim];
        for (&id, row) in input_ids.iter().zip(out.chunks_mut(dim)) {
            let id = id as usize;
            if (start..start + len).contains(&id) {
                let local = id - start;
                row.copy_from_slice(&self.embed_tokens[local * dim..(local + 1) * dim]);
            }
        }
        self.group.all_reduce_sum(&mut out)?;
        Ok(out)
    }

    fn add_positions(&self, hidden: &mut [f32], position_ids: &[u32]) {
        let dim = self.config.hidden_size;
        for (&pos, row) in position_ids.iter().zip(hidden.chunks_mut(dim)) {
            let idx = pos as usize + POSITION_OFFSET;
            ops::add_inplace(row, &self.embed_positions[idx * dim..(idx + 1) * dim]);
        }
    }

    fn check_ranges(&self, input_ids: &[u32], position_ids: &[u32]) -> Result<()> {
        if let Some(&token) = input_ids
            .iter()
            .find(|&&id| id as usize >= self.config.vocab_size)
        {
            return Err(Error::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        let max = self.config.max_position_embeddings;
        if let Some(&pos) = position_ids.iter().find(|&&p| p as usize >= max) {
            return Err(Error::PositionOutOfRange {
                position: pos as usize,
                max: max - 1,
            });
        }
        Ok(())
    }

    /// Full-vocabulary logits `(rows, vocab)` from the tied embedding.
    fn logits(&self, hidden: &[f32], rows: usize) -> Result<Vec<f32>> {
        let local = ops::matmul_nt(
            hidden,
            &self.embed_tokens,
            rows,
            self.config.embed_dim(),
            self.sizes.vocab,
        );
        let gathered = self.group.all_gather(&local)?;
        Ok(interleave_vocab_shards(
            &gathered,
            rows,
            self.sizes.vocab,
            self.group.world_size(),
        ))
    }
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        hidden: &[f32],
        step: Step<'_>,
        past: Option<&LayerKv>,
        pre_norm: bool,
        activation: Activation,
        group: &ProcessGroup,
    ) -> Result<(Vec<f32>, LayerKv)> {
        let rows = step.batch * step.seq;

        let x = if pre_norm {
            self.self_attn_layer_norm.forward(hidden)
        } else {
            hidden.to_vec()
        };
        let (attn, kv) = self.self_attn.forward(&x, step, past, group)?;
        let mut h = hidden.to_vec();
        ops::add_inplace(&mut h, &attn);
        if !pre_norm {
            h = self.self_attn_layer_norm.forward(&h);
        }

        let x = if pre_norm {
            self.final_layer_norm.forward(&h)
        } else {
            h.clone()
        };
        let mut ff = self.fc1.forward(&x, rows)?;
        activation.apply(&mut ff);
        let ff = self.fc2.forward_reduced(&ff, rows, group)?;
        ops::add_inplace(&mut h, &ff);
        if !pre_norm {
            h = self.final_layer_norm.forward(&h);
        }
        Ok((h, kv))
    }
}

/// Geometry and mask of one forward call.
#[derive(Clone, Copy)]
struct Step<'a> {
    batch: usize,
    seq: usize,
    past: usize,
    /// `(batch, past + seq)`
    mask: &'a [u32],
}

impl Attention {
    fn forward(
        &self,
        x: &[f32],
        step: Step<'_>,
        past: Option<&LayerKv>,
        group: &ProcessGroup,
    ) -> Result<(Vec<f32>, LayerKv)> {
        let rows = step.batch * step.seq;
        let mut q = self.q_proj.forward(x, rows)?;
        q.iter_mut().for_each(|v| *v *= self.scaling);
        let k = self.k_proj.forward(x, rows)?;
        let v = self.v_proj.forward(x, rows)?;

        let shape = [step.batch, self.num_heads, step.seq, self.head_dim];
        let to_cache = |x: &[f32]| {
            let split = split_heads(x, step.batch, step.seq, self.num_heads, self.head_dim);
            Tensor::from_f32(&shape, &split)
        };
        let (k, v) = (to_cache(&k), to_cache(&v));
        let kv = match past {
            Some(past) => past.append(&k, &v)?,
            None => LayerKv::new(k, v)?,
        };

        let context = attend(
            &q,
            kv.key.as_f32_slice(),
            kv.value.as_f32_slice(),
            step,
            self.num_heads,
            self.head_dim,
        );
        let out = self.out_proj.forward_reduced(&context, rows, group)?;
        Ok((out, kv))
    }
}

/// `(batch * seq, heads * head_dim)` → `(batch, heads, seq, head_dim)`.
fn split_heads(x: &[f32], batch: usize, seq: usize, heads: usize, head_dim: usize) -> Vec<f32> {
    let width = heads * head_dim;
    let mut out = vec![0.0f32; x.len()];
    for b in 0..batch {
        for s in 0..seq {
            let src = (b * seq + s) * width;
            for h in 0..heads {
                let dst = ((b * heads + h) * seq + s) * head_dim;
                out[dst..dst + head_dim]
                    .copy_from_slice(&x[src + h * head_dim..src + (h + 1) * head_dim]);
            }
        }
    }
    out
}

/// Scaled dot-product attention over cached and new positions.
///
/// `q` is `(batch * seq, heads * head_dim)`, already scaled; `key` and
/// `value` are `(batch, heads, past + seq, head_dim)`. Position `t` is hidden
/// from query `s` when it lies in the future (`t > past + s`) or is masked
/// out. Hidden scores are set to `f32::MIN`, so a query that sees nothing
/// attends uniformly instead of producing NaN.
fn attend(
    q: &[f32],
    key: &[f32],
    value: &[f32],
    step: Step<'_>,
    heads: usize,
    head_dim: usize,
) -> Vec<f32> {
    let total = step.past + step.seq;
    let width = heads * head_dim;

    let per_head: Vec<Vec<f32>> = (0..step.batch * heads)
        .into_par_iter()
        .map(|bh| {
            let (b, h) = (bh / heads, bh % heads);
            let mask = &step.mask[b * total..(b + 1) * total];
            let kv_base = bh * total * head_dim;
            let mut out = vec![0.0f32; step.seq * head_dim];
            let mut scores = vec![0.0f32; total];
            for s in 0..step.seq {
                let q_off = (b * step.seq + s) * width + h * head_dim;
                let q_vec = &q[q_off..q_off + head_dim];
                let query_pos = step.past + s;
                for (t, score) in scores.iter_mut().enumerate() {
                    *score = if t > query_pos || mask[t] == 0 {
                        f32::MIN
                    } else {
                        let k_vec = &key[kv_base + t * head_dim..kv_base + (t + 1) * head_dim];
                        q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum()
                    };
                }
                ops::softmax_inplace(&mut scores);
                let o = &mut out[s * head_dim..(s + 1) * head_dim];
                for (t, &p) in scores.iter().enumerate() {
                    let v_vec = &value[kv_base + t * head_dim..kv_base + (t + 1) * head_dim];
                    for (acc, v) in o.iter_mut().zip(v_vec) {
                        *acc += p * v;
                    }
                }
            }
            out
        })
        .collect();

    let mut context = vec![0.0f32; step.batch * step.seq * width];
    for (bh, head_out) in per_head.iter().enumerate() {
        let (b, h) = (bh / heads, bh % heads);
        for s in 0..step.seq {
            let dst = (b * step.seq + s) * width + h * head_dim;
            context[dst..dst + head_dim].copy_from_slice(&head_out[s * head_dim..(s + 1) * head_dim]);
        }
    }
    context
}

/// Rank-ordered `(world, rows, local_vocab)` → `(rows, world * local_vocab)`.
fn interleave_vocab_shards(gathered: &[f32], rows: usize, local_vocab: usize, world: usize) -> Vec<f32> {
    let vocab = local_vocab * world;
    let mut out = vec![0.0f32; rows * vocab];
    for rank in 0..world {
        for r in 0..rows {
            let src = (rank * rows + r) * local_vocab;
            let dst = r * vocab + rank * local_vocab;
            out[dst..dst + local_vocab].copy_from_slice(&gathered[src..src + local_vocab]);
        }
    }
    out
}

impl CausalLm for OptForCausalLm {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        position_ids: &Tensor,
        past_key_values: Option<&KvCache>,
    ) -> Result<ForwardOutput> {
        let start = Instant::now();
        let past_key_values = past_key_values.filter(|cache| cache.num_layers() > 0);
        let shape = check_forward_inputs(input_ids, attention_mask, position_ids, past_key_values)?;
        if let Some(cache) = past_key_values {
            if cache.num_layers() != self.layers.len() {
                return Err(Error::shape_mismatch(
                    "past_key_values layers",
                    &[self.layers.len()],
                    &[cache.num_layers()],
                ));
            }
        }
        let ids = input_ids.as_u32_slice();
        let positions = position_ids.as_u32_slice();
        self.check_ranges(ids, positions)?;

        let step = Step {
            batch: shape.batch,
            seq: shape.seq,
            past: shape.past,
            mask: attention_mask.as_u32_slice(),
        };
        let rows = shape.batch * shape.seq;

        let mut hidden = self.embed(ids)?;
        if let Some(project_in) = &self.project_in {
            hidden = ops::linear(&hidden, rows, project_in, None)?;
        }
        self.add_positions(&mut hidden, positions);

        let mut cache = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let past = past_key_values.and_then(|c| c.layer(i));
            let (h, kv) = layer.forward(
                &hidden,
                step,
                past,
                self.config.do_layer_norm_before,
                self.activation,
                &self.group,
            )?;
            hidden = h;
            cache.push(kv);
        }

        if let Some(norm) = &self.final_layer_norm {
            hidden = norm.forward(&hidden);
        }
        if let Some(project_out) = &self.project_out {
            hidden = ops::linear(&hidden, rows, project_out, None)?;
        }

        let vocab = self.config.vocab_size;
        let logits = self.logits(&hidden, rows)?;
        let speculative_logits = match &self.speculator {
            Some(speculator) => {
                let dim = self.config.embed_dim();
                let last: Vec<f32> = (0..shape.batch)
                    .flat_map(|b| {
                        let r = b * shape.seq + shape.seq - 1;
                        hidden[r * dim..(r + 1) * dim].iter().copied()
                    })
                    .collect();
                Some(speculator.forward(&last, shape.batch)?)
            }
            None => None,
        };

        debug!(
            batch = shape.batch,
            seq = shape.seq,
            past = shape.past,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "OPT forward"
        );
        Ok(ForwardOutput {
            logits: Tensor::from_f32(&[shape.batch, shape.seq, vocab], &logits),
            speculative_logits,
            past_key_values: KvCache::from_layers(cache)?,
        })
    }
}

/// [`tessera::ModelBuilder`] for `model_type = "opt"`.
///
/// # Errors
/// See [`OptForCausalLm::assemble`].
pub fn build(config: &ModelConfig, weights: &WeightStore) -> Result<Box<dyn CausalLm>> {
    Ok(Box::new(OptForCausalLm::assemble(config, weights)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(batch: usize, seq: usize, past: usize, mask: &[u32]) -> Step<'_> {
        Step {
            batch,
            seq,
            past,
            mask,
        }
    }

    #[test]
    fn test_split_heads() {
        // batch 1, seq 2, heads 2, head_dim 1: rows [a0 b0], [a1 b1]
        let out = split_heads(&[1.0, 2.0, 3.0, 4.0], 1, 2, 2, 1);
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_attend_is_causal() {
        // One head of width 1; values equal positions.
        let key = [1.0, 1.0, 1.0];
        let value = [0.0, 1.0, 2.0];
        let q = [0.0, 0.0, 0.0];
        let out = attend(&q, &key, &value, step(1, 3, 0, &[1, 1, 1]), 1, 1);
        // Equal scores: position s averages values 0..=s.
        for (got, want) in out.iter().zip([0.0, 0.5, 1.0]) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn test_attend_respects_padding_and_past() {
        let key = [1.0, 1.0, 1.0];
        let value = [10.0, 1.0, 2.0];
        // Position 0 is padding, two cached positions, one new query.
        let out = attend(&[0.0], &key, &value, step(1, 1, 2, &[0, 1, 1]), 1, 1);
        assert!((out[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_fully_masked_query_is_uniform() {
        let key = [1.0, 1.0];
        let value = [2.0, 4.0];
        let out = attend(&[5.0, 5.0], &key, &value, step(1, 2, 0, &[0, 0]), 1, 1);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_interleave_vocab_shards() {
        // Two ranks, two rows, two local ids each.
        let gathered = [0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0];
        assert_eq!(
            interleave_vocab_shards(&gathered, 2, 2, 2),
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]
        );
    }
}
