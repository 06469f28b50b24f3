//! Integration tests for BlockManager.

use paged_llm::core::block::compute_num_blocks;
use paged_llm::core::block_manager::BlockManager;
use paged_llm::{BlockTable, Error};

#[test]
fn test_block_manager_creation() {
    let manager = BlockManager::new(100, 16);
    assert_eq!(manager.num_blocks(), 100);
    assert_eq!(manager.block_size(), 16);
    assert_eq!(manager.num_free_blocks(), 100);
    assert_eq!(manager.num_used_blocks(), 0);
}

#[test]
fn test_allocate_many() {
    let mut manager = BlockManager::new(10, 16);

    let blocks = manager.allocate(5).unwrap();
    assert_eq!(blocks.len(), 5);
    assert_eq!(manager.num_free_blocks(), 5);
    assert_eq!(manager.num_used_blocks(), 5);

    // Allocating more than available should fail and change nothing
    match manager.allocate(6) {
        Err(Error::CacheExhausted {
            requested,
            available,
        }) => {
            assert_eq!(requested, 6);
            assert_eq!(available, 5);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(manager.num_free_blocks(), 5);
}

#[test]
fn test_allocated_ids_are_distinct() {
    let mut manager = BlockManager::new(32, 4);
    let mut ids = manager.allocate(20).unwrap();
    ids.extend(manager.allocate(12).unwrap());
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids, (0..32).collect::<Vec<_>>());
    assert_eq!(manager.num_free_blocks(), 0);
}

#[test]
fn test_allocate_then_free_restores_pool() {
    let mut manager = BlockManager::new(16, 4);
    manager.allocate(3).unwrap();

    let mut before: Vec<_> = manager.free_block_ids().to_vec();
    before.sort_unstable();

    let ids = manager.allocate(7).unwrap();
    manager.free(&ids).unwrap();

    let mut after: Vec<_> = manager.free_block_ids().to_vec();
    after.sort_unstable();
    assert_eq!(before, after);
    assert_eq!(manager.num_free_blocks(), 13);
}

#[test]
fn test_cache_scenario() {
    let block_size = 4;
    let mut manager = BlockManager::new(6, block_size);
    let mut tables: Vec<BlockTable> = Vec::new();

    for context_len in [3, 9, 5] {
        let mut table = BlockTable::new(block_size);
        let ids = manager
            .allocate(compute_num_blocks(context_len, block_size))
            .unwrap();
        table.extend_blocks(ids);
        tables.push(table);
    }
    assert_eq!(tables[0].num_blocks(), 1);
    assert_eq!(tables[1].num_blocks(), 3);
    assert_eq!(tables[2].num_blocks(), 2);
    assert_eq!(manager.num_free_blocks(), 0);

    // D needs one block
    let err = manager.allocate(1).unwrap_err();
    assert!(err.is_cache_exhausted());

    manager.free(&tables[0].take_blocks()).unwrap();
    assert_eq!(manager.num_free_blocks(), 1);

    let d = manager.allocate(1).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(manager.num_free_blocks(), 0);
}

#[test]
fn test_free_after_partial_allocation_failure() {
    let mut manager = BlockManager::new(4, 4);
    let held = manager.allocate(3).unwrap();
    assert!(manager.allocate(2).is_err());
    assert!(manager.can_allocate(1));
    assert!(!manager.can_allocate(2));
    manager.free(&held).unwrap();
    assert!(manager.can_allocate(4));
}

// Release builds report the error without touching the pool; debug builds assert.
#[cfg(not(debug_assertions))]
#[test]
fn test_double_free_is_reported() {
    let mut manager = BlockManager::new(4, 4);
    let ids = manager.allocate(2).unwrap();
    manager.free(&ids).unwrap();

    assert!(matches!(
        manager.free(&ids),
        Err(Error::InvalidBlockFree { .. })
    ));
    assert_eq!(manager.num_free_blocks(), 4);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "not allocated")]
fn test_double_free_asserts() {
    let mut manager = BlockManager::new(4, 4);
    let ids = manager.allocate(2).unwrap();
    manager.free(&ids).unwrap();
    let _ = manager.free(&ids);
}
