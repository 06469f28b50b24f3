//! Block manager for the paged KV cache.
//!
//! The BlockManager hands out block ids from a fixed pool, similar to how an
//! operating system manages physical memory pages.
//!
//! ## Features
//!
//! - **Free stack allocation**: O(1) allocation and deallocation per block
//! - **All-or-nothing**: a request either gets every block it asked for or none
//! - **Fixed pool**: sized once from measured device memory, never resized
//!
//! Exhaustion is reported to the caller; eviction and waiting are decided
//! outside this type.
//!
//! ## Example
//!
//! ```
//! use paged_llm::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(1024, 16);
//!
//! let blocks = manager.allocate(2).unwrap();
//! assert_eq!(manager.num_free_blocks(), 1022);
//!
//! manager.free(&blocks).unwrap();
//! assert_eq!(manager.num_free_blocks(), 1024);
//! ```

use crate::core::block::BlockId;
use crate::error::{Error, Result};

/// Manages allocation and deallocation of KV cache blocks for one pool.
#[derive(Debug)]
pub struct BlockManager {
    /// Free block IDs. Popped from the back, so recently freed blocks are reused first.
    free_blocks: Vec<BlockId>,
    /// Allocation state indexed by block id.
    allocated: Vec<bool>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `num_blocks` - Total number of blocks to manage
    /// * `block_size` - Number of tokens per block
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        // Reversed so the first allocations hand out low ids.
        let free_blocks: Vec<BlockId> = (0..num_blocks).rev().collect();

        Self {
            free_blocks,
            allocated: vec![false; num_blocks],
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.allocated.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    /// Get the number of allocated blocks.
    pub fn num_used_blocks(&self) -> usize {
        self.num_blocks() - self.num_free_blocks()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_blocks.len() >= num_blocks
    }

    /// Whether `block_id` is currently handed out.
    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        self.allocated.get(block_id).copied().unwrap_or(false)
    }

    /// Allocate `num_blocks` distinct free blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] if fewer than `num_blocks` are free.
    /// Nothing is allocated in that case.
    ///
    /// # Example
    ///
    /// ```
    /// use paged_llm::core::block_manager::BlockManager;
    ///
    /// let mut manager = BlockManager::new(2, 16);
    /// assert!(manager.allocate(3).is_err());
    /// assert_eq!(manager.num_free_blocks(), 2);
    /// ```
    pub fn allocate(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::CacheExhausted {
                requested: num_blocks,
                available: self.free_blocks.len(),
            });
        }

        let split = self.free_blocks.len() - num_blocks;
        let mut block_ids = self.free_blocks.split_off(split);
        block_ids.reverse();
        for &block_id in &block_ids {
            self.allocated[block_id] = true;
        }

        Ok(block_ids)
    }

    /// Return blocks to the free pool.
    ///
    /// Freeing a block that is not allocated (including a double free) is a
    /// caller bug: it panics in debug builds. In release builds the whole call
    /// is rejected with [`Error::InvalidBlockFree`] and the pool is unchanged.
    pub fn free(&mut self, block_ids: &[BlockId]) -> Result<()> {
        // Clear as we go; a repeated id finds its flag already cleared.
        for (i, &block_id) in block_ids.iter().enumerate() {
            if !self.is_allocated(block_id) {
                for &freed in &block_ids[..i] {
                    self.allocated[freed] = true;
                }
                debug_assert!(false, "freeing block {block_id} which is not allocated");
                return Err(Error::InvalidBlockFree { block_id });
            }
            self.allocated[block_id] = false;
        }

        self.free_blocks.extend_from_slice(block_ids);
        Ok(())
    }

    /// Free ids currently in the pool, in no particular order.
    pub fn free_block_ids(&self) -> &[BlockId] {
        &self.free_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_manager_creation() {
        let manager = BlockManager::new(100, 16);
        assert_eq!(manager.num_blocks(), 100);
        assert_eq!(manager.block_size(), 16);
        assert_eq!(manager.num_free_blocks(), 100);
        assert_eq!(manager.num_used_blocks(), 0);
    }

    #[test]
    fn test_allocate_and_free() {
        let mut manager = BlockManager::new(10, 16);

        let blocks = manager.allocate(3).unwrap();
        assert_eq!(blocks, vec![0, 1, 2]);
        assert_eq!(manager.num_free_blocks(), 7);
        assert!(blocks.iter().all(|&b| manager.is_allocated(b)));

        manager.free(&blocks).unwrap();
        assert_eq!(manager.num_free_blocks(), 10);
        assert!(!manager.is_allocated(0));
    }

    #[test]
    fn test_allocate_is_all_or_nothing() {
        let mut manager = BlockManager::new(5, 16);
        manager.allocate(3).unwrap();

        let err = manager.allocate(3).unwrap_err();
        assert!(matches!(
            err,
            Error::CacheExhausted {
                requested: 3,
                available: 2
            }
        ));
        assert_eq!(manager.num_free_blocks(), 2);
    }

    #[test]
    fn test_allocate_zero() {
        let mut manager = BlockManager::new(0, 16);
        assert!(manager.allocate(0).unwrap().is_empty());
        assert!(manager.allocate(1).is_err());
    }

    #[test]
    fn test_freed_blocks_are_reused_first() {
        let mut manager = BlockManager::new(10, 16);
        let a = manager.allocate(2).unwrap();
        manager.allocate(2).unwrap();
        manager.free(&a[1..]).unwrap();
        assert_eq!(manager.allocate(1).unwrap(), vec![a[1]]);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_free_rejected() {
        let mut manager = BlockManager::new(4, 16);
        let blocks = manager.allocate(1).unwrap();
        manager.free(&blocks).unwrap();
        assert!(matches!(
            manager.free(&blocks),
            Err(Error::InvalidBlockFree { .. })
        ));
        assert_eq!(manager.num_free_blocks(), 4);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_repeated_id_in_one_call_rejected() {
        let mut manager = BlockManager::new(4, 16);
        let blocks = manager.allocate(2).unwrap();
        assert!(matches!(
            manager.free(&[blocks[0], blocks[1], blocks[0]]),
            Err(Error::InvalidBlockFree { .. })
        ));
        // Earlier ids of the rejected call stay allocated.
        assert!(blocks.iter().all(|&b| manager.is_allocated(b)));
        assert_eq!(manager.num_free_blocks(), 2);
    }

    #[test]
    fn test_free_large_table() {
        let n = 200_000;
        let mut manager = BlockManager::new(n, 16);
        let blocks = manager.allocate(n).unwrap();

        let start = std::time::Instant::now();
        manager.free(&blocks).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(manager.num_free_blocks(), n);
        assert!(!manager.is_allocated(n - 1));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not allocated")]
    fn test_double_free_panics_in_debug() {
        let mut manager = BlockManager::new(4, 16);
        let blocks = manager.allocate(1).unwrap();
        manager.free(&blocks).unwrap();
        let _ = manager.free(&blocks);
    }
}
