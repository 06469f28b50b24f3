//! Model interfaces and implementations.
//!
//! This module contains:
//! - The CausalLM, Tokenizer and WeightSource interfaces the engine drives
//! - ModelArgs / QuantizationArgs parsed from `config.json`
//! - The ModelRegistry mapping model types to factories
//! - Tensor-parallel layers and the `tiny` reference family
//! - Loading from a local directory or the HuggingFace Hub

pub mod args;
pub mod input_params;
pub mod layers;
pub mod loader;
pub mod registry;
pub mod state_dict;
pub mod tiny;

use std::sync::Arc;

use candle_core::Tensor;

pub use args::{parse_dtype, ModelArgs, QuantizationArgs};
pub use input_params::InputParameters;
pub use loader::{download_model, HfTokenizer, InMemoryWeights, ModelFiles, ModelLoader};
pub use registry::{CausalLMFactory, ModelArgsLoader, ModelRegistry, QuantArgsLoader};
pub use state_dict::StateDict;
pub use tiny::TinyForCausalLM;

use crate::core::kv_cache::KVCache;
use crate::error::Result;

/// A causal language model replica bound to one device.
pub trait CausalLM: Send {
    /// Run the model over the flattened token stream of a batch.
    ///
    /// # Arguments
    ///
    /// * `token_ids` - `[num_tokens]` u32
    /// * `positions` - `[num_tokens]` u32, position of each token in its sequence
    /// * `kv_caches` - One cache per layer; the new tokens' keys and values are written to
    ///   `input_params.slot_ids`
    /// * `input_params` - Cache addressing and sequence boundaries
    ///
    /// # Returns
    ///
    /// Logits `[num_seqs, vocab_size]` at `input_params.last_token_indices`.
    fn forward(
        &self,
        token_ids: &Tensor,
        positions: &Tensor,
        kv_caches: &mut [KVCache],
        input_params: &InputParameters,
    ) -> Result<Tensor>;

    /// Copy every parameter found in `state_dict`; names it does not know are ignored.
    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()>;

    /// Fail with [`crate::Error::MissingWeights`] if any parameter was never loaded.
    fn verify_loaded_weights(&self) -> Result<()>;
}

/// Text to token ids and back.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;
}

/// Where a model's configuration, tokenizer and weights come from.
///
/// The weights are a lazy, finite sequence of shards that is consumed once.
pub trait WeightSource {
    /// Parsed `config.json`.
    fn config(&self) -> Result<serde_json::Value>;

    /// Tokenizer matching the weights.
    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>>;

    /// Shards in file order.
    fn into_state_dicts(self) -> Box<dyn Iterator<Item = Result<StateDict>>>;
}
