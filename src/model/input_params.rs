//! Per-step model inputs.

use candle_core::{Device, Tensor};

/// Everything a forward pass needs besides token ids and positions: cache
/// addressing for the new tokens, the sequence boundaries of the batch, and
/// the token history used by the sampler's penalties.
///
/// Built fresh by the batch preparer for every step. Sequences appear in batch
/// order: prefill sequences first, then decode sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputParameters {
    // Prefill sequences.
    /// Total number of tokens of the prefill sequences.
    pub num_prompt_tokens: usize,
    /// Boundaries of each prefill sequence in the token stream, `[num_prefill + 1]`.
    ///
    /// Three prompts of length 2, 3 and 4 give `[0, 2, 5, 9]`.
    pub cu_seq_lens: Vec<usize>,
    /// Longest prefill sequence.
    pub max_seq_len: usize,

    // Decode sequences.
    /// Block ids per decode sequence, padded with 0 to the longest table.
    pub block_tables: Vec<Vec<usize>>,
    /// Number of cached tokens to attend to per decode sequence, new token included.
    pub context_lens: Vec<usize>,
    /// Longest decode context.
    pub max_context_len: usize,

    // All sequences.
    /// Cache slot of every token in the stream.
    pub slot_ids: Vec<usize>,
    /// Position in the stream of each sequence's last token.
    pub last_token_indices: Vec<usize>,
    /// Token history per sequence, padded with 0 to the longest one.
    pub token_ids: Vec<Vec<u32>>,
    /// Unpadded length of each row of `token_ids`.
    pub seq_lens: Vec<usize>,
}

impl InputParameters {
    /// Number of prefill sequences.
    pub fn num_prefill_seqs(&self) -> usize {
        self.cu_seq_lens.len().saturating_sub(1)
    }

    /// Number of decode sequences.
    pub fn num_decode_seqs(&self) -> usize {
        self.context_lens.len()
    }

    /// Number of sequences in the batch.
    pub fn num_seqs(&self) -> usize {
        self.last_token_indices.len()
    }

    /// Number of tokens in the stream.
    pub fn num_tokens(&self) -> usize {
        self.slot_ids.len()
    }

    /// `last_token_indices` as a u32 tensor.
    pub fn last_token_indices_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        index_tensor(&self.last_token_indices, device)
    }

    /// The unpadded token history of sequence `i`.
    pub fn seq_token_ids(&self, i: usize) -> &[u32] {
        &self.token_ids[i][..self.seq_lens[i]]
    }
}

/// Build a u32 index tensor from host indices.
pub fn index_tensor(indices: &[usize], device: &Device) -> candle_core::Result<Tensor> {
    let indices: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Tensor::new(indices, device)
}
