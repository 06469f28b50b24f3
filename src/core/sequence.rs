//! Sequence tracking for inference requests.
//!
//! A sequence represents a single in-flight request: its tokens, how much of it
//! already lives in the KV cache, and the blocks holding that cache.

use crate::config::SamplingConfig;
use crate::core::block::{compute_num_blocks, BlockTable};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// A sequence represents a single inference request.
///
/// It tracks:
/// - Prompt and generated tokens, as one ordered history
/// - How many leading tokens already have key/value state in the cache
/// - KV cache block allocation (via BlockTable)
///
/// A sequence with nothing cached is in its prefill phase; afterwards each
/// step processes exactly the one token appended by the previous step.
///
/// # Example
///
/// ```
/// use paged_llm::core::sequence::Sequence;
///
/// let mut seq = Sequence::new(1, vec![1, 2, 3, 4], 16);
/// assert!(seq.is_prefill());
/// assert_eq!(seq.prompt_len(), 4);
///
/// seq.append_token(5);
/// assert!(!seq.is_prefill());
/// assert_eq!(seq.num_generated_tokens(), 1);
/// assert_eq!(seq.len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Prompt followed by generated token IDs.
    token_ids: Vec<u32>,
    /// Number of prompt tokens at the front of `token_ids`.
    prompt_len: usize,
    /// Number of leading tokens whose key/value state is cached.
    num_cached_tokens: usize,
    /// Block table for KV cache mapping.
    block_table: BlockTable,
    /// Sampling configuration for this request.
    sampling_config: SamplingConfig,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(seq_id: SequenceId, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            seq_id,
            prompt_len: prompt_token_ids.len(),
            token_ids: prompt_token_ids,
            num_cached_tokens: 0,
            block_table: BlockTable::new(block_size),
            sampling_config: SamplingConfig::default(),
        }
    }

    /// Set the sampling configuration.
    pub fn with_sampling_config(mut self, sampling_config: SamplingConfig) -> Self {
        self.sampling_config = sampling_config;
        self
    }

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// All token IDs (prompt + generated).
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.prompt_len]
    }

    /// Get the generated token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get mutable access to the block table.
    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    /// Get the sampling configuration.
    pub fn sampling_config(&self) -> &SamplingConfig {
        &self.sampling_config
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Number of tokens generated so far.
    pub fn num_generated_tokens(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    /// Whether the generation budget in the sampling config is used up.
    pub fn reached_max_tokens(&self) -> bool {
        self.num_generated_tokens() >= self.sampling_config.max_tokens
    }

    /// Current logical length (context length) of the sequence.
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether the sequence holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Number of leading tokens already in the KV cache.
    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    /// Number of tokens the next forward pass has to process.
    pub fn num_new_tokens(&self) -> usize {
        self.token_ids.len() - self.num_cached_tokens
    }

    /// Whether the next step processes the whole prompt for the first time.
    pub fn is_prefill(&self) -> bool {
        self.num_cached_tokens == 0
    }

    /// Number of blocks the sequence needs at its current length.
    pub fn num_required_blocks(&self) -> usize {
        compute_num_blocks(self.token_ids.len(), self.block_table.block_size())
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    /// Append a generated token.
    ///
    /// Every token before it has been through a forward pass at this point, so
    /// they all count as cached.
    pub fn append_token(&mut self, token_id: u32) {
        self.num_cached_tokens = self.token_ids.len();
        self.token_ids.push(token_id);
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.seq_id == other.seq_id
    }
}

impl Eq for Sequence {}
