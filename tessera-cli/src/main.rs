//! Per-rank launcher
//!
//! Start one process per rank with the same arguments; the topology comes
//! from the environment:
//!
//!   RANK=0 WORLD_SIZE=2 MASTER_ADDR=127.0.0.1 MASTER_PORT=29500 \
//!     tessera-shard facebook/opt-125m --prompt "Hello"
//!   RANK=1 WORLD_SIZE=2 MASTER_ADDR=127.0.0.1 MASTER_PORT=29500 \
//!     tessera-shard facebook/opt-125m --prompt "Hello"
//!
//! Each rank loads its shard and runs one warmup forward on the prompt; rank
//! 0 prints the most likely next tokens.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera::{DType, Quantize, Result};
use tessera_runtime::{RuntimeOptions, ShardedCausalLm};

/// Load one rank of a sharded causal LM
#[derive(Parser)]
#[command(name = "tessera-shard", version)]
struct Cli {
    /// Local model directory or Hugging Face model id
    #[arg(env = "MODEL_ID")]
    model_id: String,

    /// Branch, tag or commit of a hub model
    #[arg(long, env = "REVISION")]
    revision: Option<String>,

    /// Quantization mode: gptq or marlin
    #[arg(long, env = "QUANTIZE")]
    quantize: Option<Quantize>,

    /// Directory or hub id of a Medusa speculator
    #[arg(long, env = "SPECULATOR")]
    speculator: Option<String>,

    /// Weight dtype: float32, float16 or bfloat16
    #[arg(long, env = "DTYPE")]
    dtype: Option<DType>,

    /// Allow architectures that are not built in
    #[arg(long, env = "TRUST_REMOTE_CODE")]
    trust_remote_code: bool,

    /// Prompt for the warmup forward
    #[arg(long, default_value = "Hello")]
    prompt: String,

    /// Number of next-token candidates rank 0 prints
    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info,tessera_runtime=info,tessera_opt=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = RuntimeOptions {
        model_id: cli.model_id.clone(),
        revision: cli.revision.clone(),
        quantize: cli.quantize,
        speculator: cli.speculator.clone(),
        dtype: cli.dtype,
        trust_remote_code: cli.trust_remote_code,
    };

    let runtime = ShardedCausalLm::new(&options)?;
    let batch = runtime.tokenizer().encode_batch(&[cli.prompt.as_str()])?;
    let out = runtime.forward(
        &batch.input_ids,
        &batch.attention_mask,
        &batch.position_ids,
        None,
    )?;
    info!(
        rank = runtime.rank(),
        cached = out.past_key_values.seq_len(),
        speculative = out.speculative_logits.is_some(),
        "Warmup forward done"
    );

    if runtime.process_group().is_coordinator() {
        let vocab = runtime.vocab_size();
        let logits = out.logits.as_f32_slice();
        let last = &logits[logits.len() - vocab..];
        let mut ranked: Vec<(usize, f32)> = last.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        println!("Next-token candidates for {:?}:", cli.prompt);
        for (id, score) in ranked.into_iter().take(cli.top_k) {
            let id = id as u32;
            let text = runtime.tokenizer().decode(&[id])?;
            println!("  {id:>6}  {score:>9.4}  {text:?}");
        }
    }
    Ok(())
}
