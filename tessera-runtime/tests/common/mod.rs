//! Tiny OPT checkpoints written to temporary directories.

#![allow(dead_code)]

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tessera::weights::save_safetensors;
use tessera::Tensor;

pub const VOCAB: usize = 16;
pub const HIDDEN: usize = 8;
pub const FFN: usize = 16;
pub const LAYERS: usize = 2;
pub const MAX_POSITIONS: usize = 32;
pub const PAD: u32 = 1;

const WORDS: [&str; 13] = [
    "the", "cat", "sat", "on", "mat", "a", "dog", "ran", "to", "big", "red", "sun", "sky",
];

/// Shape knobs for a fixture checkpoint.
#[derive(Debug, Clone)]
pub struct TinyOpt {
    pub model_type: &'static str,
    pub num_attention_heads: usize,
    /// `Some(d)` with `d != HIDDEN` adds `project_in` / `project_out`
    pub word_embed_proj_dim: Option<usize>,
    pub do_layer_norm_before: bool,
    /// Leave one tensor out of the checkpoint
    pub omit: Option<&'static str>,
    pub seed: u64,
}

impl Default for TinyOpt {
    fn default() -> Self {
        Self {
            model_type: "opt",
            num_attention_heads: 2,
            word_embed_proj_dim: None,
            do_layer_norm_before: true,
            omit: None,
            seed: 17,
        }
    }
}

fn random(rng: &mut StdRng, shape: &[usize], scale: f32) -> Tensor {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-scale..scale)).collect();
    Tensor::from_f32(shape, &data)
}

fn norm_weight(rng: &mut StdRng, dim: usize) -> Tensor {
    let data: Vec<f32> = (0..dim).map(|_| 1.0 + rng.gen_range(-0.1..0.1)).collect();
    Tensor::from_f32(&[dim], &data)
}

impl TinyOpt {
    pub fn embed_dim(&self) -> usize {
        self.word_embed_proj_dim.unwrap_or(HIDDEN)
    }

    /// Write `config.json`, `tokenizer.json` and `model.safetensors`.
    pub fn write(&self, dir: &Path) {
        let mut config = serde_json::json!({
            "model_type": self.model_type,
            "vocab_size": VOCAB,
            "hidden_size": HIDDEN,
            "num_hidden_layers": LAYERS,
            "ffn_dim": FFN,
            "num_attention_heads": self.num_attention_heads,
            "max_position_embeddings": MAX_POSITIONS,
            "do_layer_norm_before": self.do_layer_norm_before,
            "activation_function": "relu",
            "pad_token_id": PAD,
            "torch_dtype": "float16",
        });
        if let Some(dim) = self.word_embed_proj_dim {
            config["word_embed_proj_dim"] = dim.into();
        }
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        write_tokenizer(dir);

        let mut rng = StdRng::seed_from_u64(self.seed);
        let embed = self.embed_dim();
        let mut tensors: Vec<(String, Tensor)> = vec![
            (
                "model.decoder.embed_tokens.weight".into(),
                random(&mut rng, &[VOCAB, embed], 0.5),
            ),
            (
                "model.decoder.embed_positions.weight".into(),
                random(&mut rng, &[MAX_POSITIONS + 2, HIDDEN], 0.5),
            ),
        ];
        if embed != HIDDEN {
            tensors.push((
                "model.decoder.project_in.weight".into(),
                random(&mut rng, &[HIDDEN, embed], 0.5),
            ));
            tensors.push((
                "model.decoder.project_out.weight".into(),
                random(&mut rng, &[embed, HIDDEN], 0.5),
            ));
        }
        if self.do_layer_norm_before {
            tensors.push((
                "model.decoder.final_layer_norm.weight".into(),
                norm_weight(&mut rng, HIDDEN),
            ));
            tensors.push((
                "model.decoder.final_layer_norm.bias".into(),
                random(&mut rng, &[HIDDEN], 0.1),
            ));
        }
        for i in 0..LAYERS {
            let p = format!("model.decoder.layers.{i}");
            for (name, out, inp) in [
                ("self_attn.q_proj", HIDDEN, HIDDEN),
                ("self_attn.k_proj", HIDDEN, HIDDEN),
                ("self_attn.v_proj", HIDDEN, HIDDEN),
                ("self_attn.out_proj", HIDDEN, HIDDEN),
                ("fc1", FFN, HIDDEN),
                ("fc2", HIDDEN, FFN),
            ] {
                tensors.push((format!("{p}.{name}.weight"), random(&mut rng, &[out, inp], 0.5)));
                tensors.push((format!("{p}.{name}.bias"), random(&mut rng, &[out], 0.1)));
            }
            for norm in ["self_attn_layer_norm", "final_layer_norm"] {
                tensors.push((format!("{p}.{norm}.weight"), norm_weight(&mut rng, HIDDEN)));
                tensors.push((format!("{p}.{norm}.bias"), random(&mut rng, &[HIDDEN], 0.1)));
            }
        }

        let refs: Vec<(&str, &Tensor)> = tensors
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != self.omit)
            .map(|(name, t)| (name.as_str(), t))
            .collect();
        save_safetensors(dir.join("model.safetensors"), &refs).unwrap();
    }
}

fn write_tokenizer(dir: &Path) {
    let mut vocab = serde_json::Map::new();
    for (id, token) in ["<unk>", "<pad>", "</s>"].iter().chain(WORDS.iter()).enumerate() {
        vocab.insert((*token).to_string(), id.into());
    }
    let tokenizer = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
}

/// Write a Medusa speculator with `num_heads` single-block heads.
pub fn write_speculator(dir: &Path, num_heads: usize, hidden: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for h in 0..num_heads {
        tensors.push((format!("{h}.0.linear.weight"), random(&mut rng, &[hidden, hidden], 0.5)));
        tensors.push((format!("{h}.0.linear.bias"), random(&mut rng, &[hidden], 0.1)));
        tensors.push((format!("{h}.1.weight"), random(&mut rng, &[VOCAB, hidden], 0.5)));
    }
    let refs: Vec<(&str, &Tensor)> = tensors.iter().map(|(n, t)| (n.as_str(), t)).collect();
    save_safetensors(dir.join("medusa_lm_head.safetensors"), &refs).unwrap();
    std::fs::write(
        dir.join("config.json"),
        serde_json::json!({"medusa_num_heads": num_heads, "medusa_num_layers": 1}).to_string(),
    )
    .unwrap();
}

/// Rows of `(batch, seq)` inputs without padding, positions from `start`.
pub fn inputs(ids: &[Vec<u32>], start: u32, past: usize) -> (Tensor, Tensor, Tensor) {
    let batch = ids.len();
    let seq = ids[0].len();
    let positions: Vec<u32> = (0..batch)
        .flat_map(|_| (start..start + seq as u32).collect::<Vec<_>>())
        .collect();
    (
        Tensor::from_u32(&[batch, seq], &ids.concat()),
        Tensor::from_u32(&[batch, past + seq], &vec![1; batch * (past + seq)]),
        Tensor::from_u32(&[batch, seq], &positions),
    )
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}
