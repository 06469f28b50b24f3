//! Integration tests for model loading.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use paged_llm::model::{HfTokenizer, Tokenizer, WeightSource};
use paged_llm::{Engine, EngineConfig, Error, ModelArgs, ModelLoader, ModelRegistry, StateDict};

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": { "a": 0, "b": 1, "c": 2, "d": 3, "<unk>": 4 },
    "unk_token": "<unk>"
  }
}"#;

fn write_model(dir: &Path) {
    let dev = Device::Cpu;
    std::fs::write(
        dir.join("config.json"),
        r#"{
            "model_type": "tiny",
            "hidden_size": 4,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "vocab_size": 5,
            "torch_dtype": "bfloat16",
            "eos_token_id": [3, 4]
        }"#,
    )
    .unwrap();
    std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let eye = Tensor::eye(4, DType::F32, &dev).unwrap();
    let mut first = HashMap::new();
    first.insert(
        "embed_tokens.weight".to_string(),
        Tensor::ones((5, 4), DType::F32, &dev).unwrap(),
    );
    for i in 0..2 {
        for name in ["k_proj", "v_proj", "o_proj"] {
            first.insert(format!("layers.{i}.{name}.weight"), eye.clone());
        }
    }
    let mut second = HashMap::new();
    second.insert(
        "lm_head.weight".to_string(),
        Tensor::ones((5, 4), DType::F32, &dev).unwrap(),
    );

    candle_core::safetensors::save(&first, dir.join("model-00001-of-00002.safetensors")).unwrap();
    candle_core::safetensors::save(&second, dir.join("model-00002-of-00002.safetensors")).unwrap();
}

#[test]
fn test_parse_model_args() {
    let config = serde_json::json!({
        "model_type": "llama",
        "vocab_size": 151936,
        "hidden_size": 1024,
        "intermediate_size": 3072,
        "num_hidden_layers": 28,
        "num_attention_heads": 16,
        "num_key_value_heads": 8,
        "rms_norm_eps": 1e-6,
        "rope_theta": 1000000.0,
        "max_position_embeddings": 40960,
        "tie_word_embeddings": true,
        "torch_dtype": "bfloat16"
    });

    let args = ModelArgs::from_json(&config).unwrap();
    assert_eq!(args.vocab_size, 151936);
    assert_eq!(args.n_layers, 28);
    assert_eq!(args.n_heads, 16);
    assert_eq!(args.num_kv_heads(), 8);
    assert_eq!(args.head_dim(), 64);
    assert_eq!(args.num_local_kv_heads(2), 4);
    assert_eq!(args.dtype, "bfloat16");
    assert!(args.tie_word_embeddings);
    assert!(args.check_parallel(3).is_err());
}

#[test]
fn test_model_loader_reads_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let loader = ModelLoader::from_dir(dir.path()).unwrap();
    assert_eq!(loader.files().weights.len(), 2);

    let config = loader.config().unwrap();
    assert_eq!(config["model_type"], "tiny");

    let tokenizer = loader.tokenizer().unwrap();
    assert_eq!(tokenizer.vocab_size(), 5);
    assert_eq!(tokenizer.encode("a c d").unwrap(), vec![0, 2, 3]);

    let shards: Vec<StateDict> = loader
        .into_state_dicts()
        .collect::<paged_llm::Result<_>>()
        .unwrap();
    assert_eq!(shards.len(), 2);
    assert_eq!(shards[0].len(), 7);
    assert!(shards[1].get_tensor("lm_head.weight").is_some());
}

#[test]
fn test_tokenizer_unknown_word() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    let tokenizer = HfTokenizer::from_file(dir.path().join("tokenizer.json")).unwrap();
    assert_eq!(tokenizer.encode("b zzz").unwrap(), vec![1, 4]);
    assert_eq!(tokenizer.token_to_id("d"), Some(3));
}

#[test]
fn test_missing_tokenizer_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        HfTokenizer::from_file(dir.path().join("tokenizer.json")),
        Err(Error::Tokenization(_))
    ));
}

#[test]
fn test_engine_init_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let config = EngineConfig::default()
        .with_block_size(4)
        .with_max_cache_size(1 << 16);
    let mut engine = Engine::new(
        vec![Device::Cpu],
        Arc::new(ModelRegistry::with_defaults()),
        config,
    )
    .unwrap();
    engine.init(ModelLoader::from_dir(dir.path()).unwrap()).unwrap();

    // bfloat16 is requested, but the CPU always runs in f32.
    assert_eq!(engine.dtype(), Some(DType::F32));
    assert_eq!(engine.model_args().unwrap().eos_token_id, vec![3, 4]);
    // 2 * 4 tokens * 2 heads * 2 dims * 2 layers * 4 bytes = 256 bytes per block
    assert_eq!(engine.num_blocks(), 256);
}
