//! Block tables for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how an operating
//! system manages physical memory with pages. A sequence's block table maps its
//! logical token positions onto physical blocks.

use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Physical block identifier, unique within one device's pool.
pub type BlockId = usize;

/// Maps a sequence's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the device's cache pool
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// Blocks are only ever appended, so the table never reorders or compacts
/// while the sequence is alive.
///
/// # Example
///
/// ```
/// use paged_llm::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
///
/// assert_eq!(table.slot_id(0).unwrap(), 5 * 16);
/// assert_eq!(table.slot_id(17).unwrap(), 12 * 16 + 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in growth order.
    block_ids: Vec<BlockId>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create an empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create an empty block table with the default block size.
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Add a new physical block to the end of the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Add several blocks, preserving their order.
    pub fn extend_blocks(&mut self, block_ids: impl IntoIterator<Item = BlockId>) {
        self.block_ids.extend(block_ids);
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Number of token positions the current blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Get all physical block IDs for this sequence.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Global cache slot for token position `pos`.
    ///
    /// `slot = block_ids[pos / block_size] * block_size + pos % block_size`
    pub fn slot_id(&self, pos: usize) -> Result<usize> {
        let physical_block = self.get_block_id(pos / self.block_size)?;
        Ok(physical_block * self.block_size + pos % self.block_size)
    }

    /// Global slot indices for the token positions in `start..end`.
    pub fn slot_mapping(&self, start: usize, end: usize) -> Result<Vec<usize>> {
        (start..end).map(|pos| self.slot_id(pos)).collect()
    }

    /// Remove and return all blocks, leaving the table empty.
    pub fn take_blocks(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use paged_llm::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_table_basic() {
        let mut table = BlockTable::new(16);
        assert!(table.is_empty());
        assert_eq!(table.num_blocks(), 0);

        table.append_block(5);
        table.extend_blocks([12, 3]);

        assert!(!table.is_empty());
        assert_eq!(table.num_blocks(), 3);
        assert_eq!(table.capacity(), 48);
        assert_eq!(table.block_ids(), &[5, 12, 3]);
    }

    #[test]
    fn test_block_table_get_block_id() {
        let mut table = BlockTable::new(16);
        table.extend_blocks([5, 12, 3]);

        assert_eq!(table.get_block_id(0).unwrap(), 5);
        assert_eq!(table.get_block_id(2).unwrap(), 3);

        assert!(matches!(
            table.get_block_id(3),
            Err(Error::BlockIndexOutOfBounds {
                logical_idx: 3,
                num_blocks: 3
            })
        ));
    }

    #[test]
    fn test_slot_mapping() {
        let mut table = BlockTable::new(16);
        table.extend_blocks([5, 12]);

        let slots = table.slot_mapping(0, 20).unwrap();
        assert_eq!(slots.len(), 20);

        // First 16 tokens in block 5 (slots 80-95)
        assert_eq!(slots[0], 80);
        assert_eq!(slots[15], 95);

        // Next 4 tokens in block 12 (slots 192-195)
        assert_eq!(slots[16], 192);
        assert_eq!(slots[19], 195);

        // Position 32 would need a third block
        assert!(table.slot_id(32).is_err());
    }

    #[test]
    fn test_take_blocks() {
        let mut table = BlockTable::new(4);
        table.extend_blocks([1, 2]);
        assert_eq!(table.take_blocks(), vec![1, 2]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(100, 16), 7);
    }
}
