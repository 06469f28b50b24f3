use std::io::Write;
use std::sync::Arc;

use candle_core::Device;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paged_llm::config::DEFAULT_MAX_CACHE_SIZE;
use paged_llm::{
    Engine, EngineConfig, Error, ModelLoader, ModelRegistry, Result, SamplingConfig, Sequence,
};

#[derive(Parser, Debug)]
#[command(name = "paged-llm")]
#[command(about = "Greedy generation over a paged KV cache, split across one or more devices")]
struct Args {
    /// Model directory or HuggingFace model ID
    #[arg(short, long)]
    model: String,

    /// Comma-separated devices, e.g. "cpu" or "cuda:0,cuda:1"
    #[arg(short, long, default_value = "cpu")]
    devices: String,

    /// Input prompt
    #[arg(short, long)]
    prompt: String,

    /// Maximum tokens to generate
    #[arg(long, default_value = "256")]
    max_tokens: usize,

    /// Tokens per cache block
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Upper bound on cache memory in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CACHE_SIZE)]
    max_cache_size: usize,

    /// Weight dtype override ("half", "bfloat16", "float", ...)
    #[arg(long)]
    dtype: Option<String>,
}

fn parse_devices(names: &str) -> Result<Vec<Device>> {
    names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| -> Result<Device> {
            match name {
                "cpu" => Ok(Device::Cpu),
                "cuda" => Ok(Device::new_cuda(0)?),
                _ => match name.strip_prefix("cuda:") {
                    Some(ordinal) => {
                        let ordinal: usize = ordinal
                            .parse()
                            .map_err(|_| Error::Config(format!("invalid device: {name}")))?;
                        Ok(Device::new_cuda(ordinal)?)
                    }
                    None => Err(Error::UnsupportedDevice(name.to_string())),
                },
            }
        })
        .collect()
}

fn init_tracing() {
    let default_level = match std::env::var("PAGED_LLM_DEBUG") {
        Ok(v) if v == "1" => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let devices = parse_devices(&args.devices)?;
    let mut config = EngineConfig::default()
        .with_block_size(args.block_size)
        .with_max_cache_size(args.max_cache_size);
    config.dtype = args.dtype;

    let registry = Arc::new(ModelRegistry::with_defaults());
    let mut engine = Engine::new(devices, registry, config)?;
    engine.init(ModelLoader::from_path_or_hub(&args.model)?)?;

    let tokenizer = engine
        .tokenizer()
        .cloned()
        .ok_or_else(|| Error::Config("engine is not initialized".into()))?;
    let eos_token_ids = engine
        .model_args()
        .map(|a| a.eos_token_id.clone())
        .unwrap_or_default();

    let prompt_ids = tokenizer.encode(&args.prompt)?;
    info!("prompt has {} tokens", prompt_ids.len());

    let sampling_config = SamplingConfig {
        max_tokens: args.max_tokens,
        ..SamplingConfig::greedy()
    };
    let mut sequences = vec![Sequence::new(0, prompt_ids, args.block_size)
        .with_sampling_config(sampling_config)];

    let mut stdout = std::io::stdout();
    let mut printed = String::new();
    while !sequences[0].reached_max_tokens() {
        let output = engine.execute_model(&mut sequences)?;
        let token = output.next_tokens[0];
        if eos_token_ids.contains(&token) {
            break;
        }
        sequences[0].append_token(token);

        // Print the newly decoded suffix.
        let text = tokenizer.decode(sequences[0].output_token_ids())?;
        if let Some(suffix) = text.strip_prefix(printed.as_str()) {
            print!("{suffix}");
            stdout.flush()?;
        }
        printed = text;
    }
    println!();

    info!(
        "generated {} tokens, {} of {} cache blocks in use",
        sequences[0].num_generated_tokens(),
        engine.block_manager().map_or(0, |m| m.num_used_blocks()),
        engine.num_blocks()
    );
    engine.release_sequence(&mut sequences[0])?;
    Ok(())
}
