//! Batch preparation.
//!
//! Turns the active sequences of one step into the flattened token stream and
//! the [`InputParameters`] a worker's forward call needs, assigning cache
//! blocks on the way.
//!
//! ## Layout
//!
//! ```text
//! caller order:   [D0, P0, P1]        (P = prefill, D = decode)
//! batch order:    [P0, P1, D0]
//!
//! token stream:   P0 P0 P0 | P1 P1 P1 P1 P1 | D0
//! cu_seq_lens:    [0, 3, 8]
//! last_token_indices: [2, 7, 8]
//! seq_indices:    [2, 0, 1]           out[i] = batch_out[seq_indices[i]]
//! ```
//!
//! Prefill sequences feed their whole prompt; decode sequences feed only
//! their newest token and attend to the rest through their block table.

use crate::core::block::compute_num_blocks;
use crate::core::block_manager::BlockManager;
use crate::core::sequence::Sequence;
use crate::engine::sampler::SamplingParameters;
use crate::error::{Error, Result};
use crate::model::InputParameters;

/// Inputs of one step, ready to hand to every worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    /// Flattened token stream.
    pub token_ids: Vec<u32>,
    /// Position of each token of the stream within its sequence.
    pub positions: Vec<u32>,
    pub input_params: InputParameters,
    /// Sampling settings in batch order.
    pub sampling_params: SamplingParameters,
    /// Batch row of each caller sequence.
    pub seq_indices: Vec<usize>,
}

impl PreparedBatch {
    pub fn num_seqs(&self) -> usize {
        self.seq_indices.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

/// Builds [`PreparedBatch`]es for a fixed block size.
#[derive(Debug, Clone, Copy)]
pub struct BatchPreparer {
    block_size: usize,
}

impl BatchPreparer {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Prepare one step over `sequences`.
    ///
    /// Sequences with no cached tokens are prefilled; the others must have
    /// exactly one new token. Block tables grow to `ceil(len / block_size)`
    /// blocks, one sequence at a time in batch order. On
    /// [`Error::CacheExhausted`] the sequences handled before the failing one
    /// keep the blocks they received.
    pub fn prepare(
        &self,
        sequences: &mut [Sequence],
        block_manager: &mut BlockManager,
    ) -> Result<PreparedBatch> {
        self.validate(sequences)?;

        let (prefill, decode): (Vec<usize>, Vec<usize>) =
            (0..sequences.len()).partition(|&i| sequences[i].is_prefill());
        let order: Vec<usize> = prefill.iter().chain(&decode).copied().collect();

        for &i in &order {
            self.allocate_blocks(&mut sequences[i], block_manager)?;
        }

        let mut batch = PreparedBatch::default();
        let params = &mut batch.input_params;
        params.cu_seq_lens.push(0);

        for &i in &prefill {
            let seq = &sequences[i];
            let start = seq.num_cached_tokens();
            let end = seq.len();

            batch.token_ids.extend_from_slice(&seq.token_ids()[start..end]);
            batch.positions.extend((start..end).map(|p| p as u32));
            params
                .slot_ids
                .extend(seq.block_table().slot_mapping(start, end)?);

            params.num_prompt_tokens += end - start;
            params.cu_seq_lens.push(params.num_prompt_tokens);
            params.max_seq_len = params.max_seq_len.max(end - start);
            params.last_token_indices.push(batch.token_ids.len() - 1);
        }
        if prefill.is_empty() {
            params.cu_seq_lens.clear();
        }

        for &i in &decode {
            let seq = &sequences[i];
            let pos = seq.len() - 1;

            batch.token_ids.push(seq.token_ids()[pos]);
            batch.positions.push(pos as u32);
            params.slot_ids.push(seq.block_table().slot_id(pos)?);

            params.block_tables.push(seq.block_table().block_ids().to_vec());
            params.context_lens.push(seq.len());
            params.max_context_len = params.max_context_len.max(seq.len());
            params.last_token_indices.push(batch.token_ids.len() - 1);
        }
        let max_blocks = params.block_tables.iter().map(Vec::len).max().unwrap_or(0);
        for table in &mut params.block_tables {
            table.resize(max_blocks, 0);
        }

        let max_len = order.iter().map(|&i| sequences[i].len()).max().unwrap_or(0);
        for &i in &order {
            let seq = &sequences[i];
            let mut history = seq.token_ids().to_vec();
            history.resize(max_len, 0);
            params.token_ids.push(history);
            params.seq_lens.push(seq.len());
            batch.sampling_params.push(seq.sampling_config());
        }

        batch.seq_indices = vec![0; order.len()];
        for (row, &i) in order.iter().enumerate() {
            batch.seq_indices[i] = row;
        }

        Ok(batch)
    }

    fn validate(&self, sequences: &[Sequence]) -> Result<()> {
        for seq in sequences {
            if seq.block_table().block_size() != self.block_size {
                return Err(Error::Config(format!(
                    "sequence {} uses block size {}, engine uses {}",
                    seq.seq_id(),
                    seq.block_table().block_size(),
                    self.block_size
                )));
            }
            if seq.is_empty() {
                return Err(Error::Config(format!("sequence {} is empty", seq.seq_id())));
            }
            if !seq.is_prefill() && seq.num_new_tokens() != 1 {
                return Err(Error::Config(format!(
                    "decode sequence {} has {} new tokens, expected 1",
                    seq.seq_id(),
                    seq.num_new_tokens()
                )));
            }
        }
        Ok(())
    }

    /// Grow the block table to cover every token of `seq`.
    fn allocate_blocks(&self, seq: &mut Sequence, block_manager: &mut BlockManager) -> Result<()> {
        let required = compute_num_blocks(seq.len(), self.block_size);
        let missing = required.saturating_sub(seq.block_table().num_blocks());
        if missing > 0 {
            let block_ids = block_manager.allocate(missing)?;
            seq.block_table_mut().extend_blocks(block_ids);
        }
        Ok(())
    }
}
