//! Configuration types for paged-llm.

use serde::{Deserialize, Serialize};

use crate::core::block::DEFAULT_BLOCK_SIZE;
use crate::error::{Error, Result};

/// Default upper bound for the KV cache: 5 GiB.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Block size for the paged KV cache (tokens per block).
    pub block_size: usize,
    /// Upper bound on KV cache memory in bytes.
    pub max_cache_size: usize,
    /// Fraction of total device memory the engine may use, in `(0, 1]`.
    pub max_memory_utilization: f64,
    /// Overrides the dtype named by the model config ("half", "bfloat16", ...).
    pub dtype: Option<String>,
    /// Seed for every worker's sampler.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_memory_utilization: 0.9,
            dtype: None,
            seed: 42,
        }
    }
}

impl EngineConfig {
    /// Check the values an engine cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be greater than 0".into()));
        }
        if !(self.max_memory_utilization > 0.0 && self.max_memory_utilization <= 1.0) {
            return Err(Error::Config(format!(
                "max_memory_utilization must be in (0, 1], got {}",
                self.max_memory_utilization
            )));
        }
        Ok(())
    }

    /// Set the block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the cache size cap in bytes.
    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    /// Set the sampler seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (1.0 = no change, 0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Subtracted once per previous occurrence of a token.
    pub frequency_penalty: f32,
    /// Subtracted once if a token occurred at all.
    pub presence_penalty: f32,
    /// Divides positive logits (multiplies negative ones) of seen tokens. 1.0 = disabled.
    pub repetition_penalty: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repetition_penalty: 1.0,
            max_tokens: 256,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Whether any of the history-dependent penalties is active.
    pub fn has_penalties(&self) -> bool {
        self.frequency_penalty != 0.0
            || self.presence_penalty != 0.0
            || self.repetition_penalty != 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.block_size, 16);
        assert_eq!(config.max_cache_size, 5 * 1024 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EngineConfig::default().with_block_size(0).validate().is_err());

        let mut config = EngineConfig::default();
        config.max_memory_utilization = 0.0;
        assert!(config.validate().is_err());
        config.max_memory_utilization = 1.5;
        assert!(config.validate().is_err());
        config.max_memory_utilization = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{"block_size": 8}"#).unwrap();
        assert_eq!(config.block_size, 8);
        assert_eq!(config.max_memory_utilization, 0.9);
        assert!(config.dtype.is_none());
    }

    #[test]
    fn test_sampling_penalties() {
        assert!(!SamplingConfig::default().has_penalties());
        let config = SamplingConfig {
            presence_penalty: 0.5,
            ..SamplingConfig::greedy()
        };
        assert!(config.has_penalties());
        assert_eq!(config.temperature, 0.0);
    }
}
