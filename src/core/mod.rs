//! Core infrastructure for paged-llm.
//!
//! This module contains the fundamental building blocks:
//! - BlockTable for mapping token positions to cache slots
//! - BlockManager for block allocation
//! - Sequence for request tracking
//! - KVCache for key-value storage
//! - DeviceMemory for sizing the cache

pub mod block;
pub mod block_manager;
pub mod kv_cache;
pub mod memory;
pub mod sequence;
