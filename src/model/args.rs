//! Model and quantization arguments read from a HuggingFace `config.json`.

use std::fmt;

use candle_core::{DType, Device};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Architecture hyper-parameters shared read-only by every worker.
///
/// Field names follow the checkpoint's `config.json`; the aliases cover the
/// spellings used by the common model families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    /// Registry key of the model family.
    pub model_type: String,
    /// Hidden dimension.
    #[serde(alias = "n_embd", alias = "d_model")]
    pub hidden_size: usize,
    /// Activation function name.
    #[serde(alias = "activation_function")]
    pub hidden_act: String,
    /// Intermediate dimension (MLP).
    #[serde(alias = "n_inner")]
    pub intermediate_size: usize,
    /// Number of transformer layers.
    #[serde(alias = "num_hidden_layers", alias = "n_layer")]
    pub n_layers: usize,
    /// Number of attention heads.
    #[serde(alias = "num_attention_heads", alias = "n_head")]
    pub n_heads: usize,
    /// Number of key-value heads; equal to `n_heads` when absent.
    #[serde(alias = "num_key_value_heads")]
    pub n_kv_heads: Option<usize>,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// RMSNorm epsilon.
    pub rms_norm_eps: f64,
    /// LayerNorm epsilon.
    #[serde(alias = "layer_norm_epsilon")]
    pub layer_norm_eps: f64,
    /// RoPE theta.
    pub rope_theta: f64,
    /// Rotary scaling settings, passed through untouched.
    pub rope_scaling: Option<serde_json::Value>,
    /// Share of the head dimension that gets rotary embeddings.
    pub rotary_pct: f64,
    /// Maximum sequence length.
    #[serde(alias = "n_positions")]
    pub max_position_embeddings: usize,
    /// Beginning-of-sequence token.
    pub bos_token_id: Option<u32>,
    /// End-of-sequence tokens. `config.json` may hold one id or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub eos_token_id: Vec<u32>,
    /// GPT-NeoX style parallel attention/MLP residual.
    pub use_parallel_residual: bool,
    /// Whether the lm head shares the embedding weight.
    pub tie_word_embeddings: bool,
    /// Weight dtype named by the checkpoint ("float16", "bfloat16", ...).
    #[serde(alias = "torch_dtype")]
    pub dtype: String,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model_type: String::new(),
            hidden_size: 0,
            hidden_act: String::new(),
            intermediate_size: 0,
            n_layers: 0,
            n_heads: 0,
            n_kv_heads: None,
            vocab_size: 0,
            rms_norm_eps: 0.0,
            layer_norm_eps: 0.0,
            rope_theta: 10000.0,
            rope_scaling: None,
            rotary_pct: 1.0,
            max_position_embeddings: 0,
            bos_token_id: None,
            eos_token_id: Vec::new(),
            use_parallel_residual: false,
            tie_word_embeddings: false,
            dtype: String::new(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

impl ModelArgs {
    /// Parse a `config.json` value.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(ModelArgs::deserialize(value)?)
    }

    /// Number of key-value heads across all ranks.
    pub fn num_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Dimension per attention head.
    pub fn head_dim(&self) -> usize {
        if self.n_heads == 0 {
            return 0;
        }
        self.hidden_size / self.n_heads
    }

    /// Key-value heads held by each of `world_size` ranks.
    pub fn num_local_kv_heads(&self, world_size: usize) -> usize {
        self.num_kv_heads() / world_size.max(1)
    }

    /// Check the model can be split over `world_size` ranks.
    pub fn check_parallel(&self, world_size: usize) -> Result<()> {
        if self.n_heads == 0 || self.hidden_size % self.n_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not divisible by n_heads {}",
                self.hidden_size, self.n_heads
            )));
        }
        if self.num_kv_heads() % world_size != 0 {
            return Err(Error::Config(format!(
                "n_kv_heads {} is not divisible by world_size {world_size}",
                self.num_kv_heads()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ModelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ModelArgs [model_type: {}, hidden_size: {}, hidden_act: {}, intermediate_size: {}, \
             n_layers: {}, n_heads: {}, n_kv_heads: {}, vocab_size: {}, rms_norm_eps: {}, \
             layer_norm_eps: {}, rope_theta: {}, rotary_pct: {}, max_position_embeddings: {}, \
             bos_token_id: {:?}, eos_token_id: {:?}, use_parallel_residual: {}, dtype: {}]",
            self.model_type,
            self.hidden_size,
            self.hidden_act,
            self.intermediate_size,
            self.n_layers,
            self.n_heads,
            self.num_kv_heads(),
            self.vocab_size,
            self.rms_norm_eps,
            self.layer_norm_eps,
            self.rope_theta,
            self.rotary_pct,
            self.max_position_embeddings,
            self.bos_token_id,
            self.eos_token_id,
            self.use_parallel_residual,
            self.dtype,
        )
    }
}

/// Weight quantization settings, from `quantization_config` in `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationArgs {
    /// Method name ("gptq", "awq", ...). Empty for unquantized checkpoints.
    pub quant_method: String,
    /// Bits per weight.
    pub bits: usize,
    /// Quantization group size.
    pub group_size: usize,
    /// GPTQ activation ordering.
    pub desc_act: bool,
    /// GPTQ sequential quantization.
    pub true_sequential: bool,
}

impl QuantizationArgs {
    /// Read `quantization_config` from a `config.json` value; default when absent.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value.get("quantization_config") {
            Some(quant) => Ok(QuantizationArgs::deserialize(quant)?),
            None => Ok(Self::default()),
        }
    }

    /// Whether the checkpoint is quantized.
    pub fn is_quantized(&self) -> bool {
        !self.quant_method.is_empty()
    }
}

impl fmt::Display for QuantizationArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuantizationArgs [quant_method: {}, bits: {}, group_size: {}, desc_act: {}, true_sequential: {}]",
            self.quant_method, self.bits, self.group_size, self.desc_act, self.true_sequential
        )
    }
}

/// Resolve the dtype to run the model in.
///
/// CPU always runs in f32. On accelerators, an empty string or "auto" means
/// f16; names are matched case-insensitively.
pub fn parse_dtype(dtype: &str, device: &Device) -> Result<DType> {
    if device.is_cpu() {
        return Ok(DType::F32);
    }

    match dtype.to_ascii_lowercase().as_str() {
        "half" | "float16" => Ok(DType::F16),
        "bfloat16" => Ok(DType::BF16),
        "float" | "float32" => Ok(DType::F32),
        "" | "auto" => Ok(DType::F16),
        other => Err(Error::Config(format!(
            "unsupported dtype {other} on device {device:?}"
        ))),
    }
}
