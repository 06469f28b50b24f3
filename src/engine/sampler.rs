//! Token sampling strategies.
//!
//! This module provides sampling methods for selecting the next token
//! from a probability distribution:
//!
//! - **Penalties**: frequency, presence and repetition penalties over each
//!   sequence's token history
//! - **Temperature**: Controls randomness (0 = greedy)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [num_seqs, vocab_size]
//!     │
//!     ▼ Penalties (per sequence history)
//!     ▼ Temperature scaling  (temperature 0: argmax, stop here)
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + Sample
//! Next token + log-probability
//! ```
//!
//! Every worker runs its own sampler with the same seed, so identical logits
//! yield identical tokens on every rank.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, D};
use rand::distributions::Distribution;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};
use crate::model::InputParameters;

/// Per-sequence sampling settings for one batch, in batch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParameters {
    pub temperatures: Vec<f32>,
    pub top_k: Vec<usize>,
    pub top_p: Vec<f32>,
    pub frequency_penalties: Vec<f32>,
    pub presence_penalties: Vec<f32>,
    pub repetition_penalties: Vec<f32>,
}

impl SamplingParameters {
    /// Append one sequence's settings.
    pub fn push(&mut self, config: &SamplingConfig) {
        self.temperatures.push(config.temperature);
        self.top_k.push(config.top_k);
        self.top_p.push(config.top_p);
        self.frequency_penalties.push(config.frequency_penalty);
        self.presence_penalties.push(config.presence_penalty);
        self.repetition_penalties.push(config.repetition_penalty);
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    fn config(&self, i: usize) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperatures[i],
            top_k: self.top_k[i],
            top_p: self.top_p[i],
            frequency_penalty: self.frequency_penalties[i],
            presence_penalty: self.presence_penalties[i],
            repetition_penalty: self.repetition_penalties[i],
            ..SamplingConfig::default()
        }
    }
}

/// Sampled tokens of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputParameters {
    /// Next token per sequence.
    pub next_tokens: Vec<u32>,
    /// Log-probability of each next token under the sampling distribution.
    pub logprobs: Vec<f32>,
}

impl OutputParameters {
    /// Reorder rows: `out[i] = self[indices[i]]`.
    pub fn index_select(&self, indices: &[usize]) -> Self {
        Self {
            next_tokens: indices.iter().map(|&i| self.next_tokens[i]).collect(),
            logprobs: indices.iter().map(|&i| self.logprobs[i]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.next_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_tokens.is_empty()
    }
}

/// Seeded token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Random number generator.
    rng: rand::rngs::StdRng,
}

impl Sampler {
    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    /// Sample one token per row of `logits`.
    ///
    /// # Arguments
    ///
    /// * `logits` - `[num_seqs, vocab_size]`
    /// * `params` - Per-row sampling settings
    /// * `input_params` - Token history per row, for the penalties
    pub fn sample(
        &mut self,
        logits: &Tensor,
        params: &SamplingParameters,
        input_params: &InputParameters,
    ) -> Result<OutputParameters> {
        let (num_seqs, _vocab_size) = logits.dims2()?;
        if params.len() != num_seqs {
            return Err(Error::Config(format!(
                "{num_seqs} rows of logits but {} sampling configs",
                params.len()
            )));
        }

        let rows: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;
        let mut output = OutputParameters::default();
        for (i, mut row) in rows.into_iter().enumerate() {
            let config = params.config(i);
            if config.has_penalties() && i < input_params.seq_lens.len() {
                apply_penalties(&mut row, input_params.seq_token_ids(i), &config);
            }
            let (token, logprob) = self.sample_single(row, &config)?;
            output.next_tokens.push(token);
            output.logprobs.push(logprob);
        }
        Ok(output)
    }

    /// Sample a single token from one row of logits.
    fn sample_single(&mut self, logits: Vec<f32>, config: &SamplingConfig) -> Result<(u32, f32)> {
        let device = Device::Cpu;
        let vocab_size = logits.len();
        let logits = Tensor::from_vec(logits, vocab_size, &device)?;

        // For temperature = 0, use greedy decoding (argmax)
        if config.temperature == 0.0 {
            let token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            let log_probs: Vec<f32> = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1()?;
            return Ok((token, log_probs[token as usize]));
        }

        let logits = if config.temperature != 1.0 {
            (logits / config.temperature as f64)?
        } else {
            logits
        };

        // Apply top-k filtering
        let (logits, indices) = if config.top_k > 0 && config.top_k < vocab_size {
            apply_top_k(&logits, config.top_k)?
        } else {
            let indices: Vec<u32> = (0..vocab_size as u32).collect();
            (logits, indices)
        };

        // Compute probabilities with softmax
        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1()?;

        // Apply top-p filtering
        let (probs, indices) = if config.top_p < 1.0 && config.top_p > 0.0 {
            apply_top_p(probs, indices, config.top_p)
        } else {
            (probs, indices)
        };

        self.sample_from_probs(&probs, &indices)
    }

    /// Sample from the distribution, returning the token and its renormalized log-probability.
    fn sample_from_probs(&mut self, probs: &[f32], indices: &[u32]) -> Result<(u32, f32)> {
        let sum: f32 = probs.iter().sum();
        let normalized: Vec<f64> = probs.iter().map(|&p| (p / sum) as f64).collect();

        let dist = rand::distributions::WeightedIndex::new(&normalized)
            .map_err(|e| Error::Config(format!("Failed to create distribution: {e}")))?;

        let sampled_idx = dist.sample(&mut self.rng);
        Ok((indices[sampled_idx], (normalized[sampled_idx] as f32).ln()))
    }
}

/// Penalize tokens that already occur in `history`.
///
/// Frequency and presence penalties are subtracted (per occurrence and once,
/// respectively). The repetition penalty divides positive logits and
/// multiplies negative ones.
fn apply_penalties(logits: &mut [f32], history: &[u32], config: &SamplingConfig) {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in history {
        *counts.entry(token).or_default() += 1;
    }

    for (&token, &count) in &counts {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        if config.repetition_penalty != 1.0 {
            if *logit > 0.0 {
                *logit /= config.repetition_penalty;
            } else {
                *logit *= config.repetition_penalty;
            }
        }
        *logit -= config.frequency_penalty * count as f32 + config.presence_penalty;
    }
}

/// Apply top-k filtering: keep only the k tokens with highest logits.
fn apply_top_k(logits: &Tensor, k: usize) -> Result<(Tensor, Vec<u32>)> {
    let logits_vec: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = logits_vec.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);

    let indices: Vec<u32> = indexed.iter().map(|(i, _)| *i as u32).collect();
    let values: Vec<f32> = indexed.iter().map(|(_, v)| *v).collect();
    let k = values.len();
    Ok((Tensor::from_vec(values, k, logits.device())?, indices))
}

/// Apply top-p (nucleus) filtering: keep tokens until cumulative probability exceeds p.
fn apply_top_p(probs: Vec<f32>, indices: Vec<u32>, p: f32) -> (Vec<f32>, Vec<u32>) {
    let mut indexed: Vec<(f32, u32)> = probs.into_iter().zip(indices).collect();
    indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, (prob, _)) in indexed.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = i + 1;
            break;
        }
    }
    indexed.truncate(cutoff);
    indexed.into_iter().unzip()
}
