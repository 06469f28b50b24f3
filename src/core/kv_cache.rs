//! KV Cache for storing key-value states.
//!
//! The KVCache stores computed key and value tensors for one transformer
//! layer, organized into fixed-size blocks for the paged cache.
//!
//! ## Memory Layout
//!
//! Key and value caches both have shape
//! `[num_blocks, block_size, num_kv_heads, head_dim]`.
//!
//! Flattening the first two dimensions gives one row per cache slot, so a
//! token with slot id `s` lives at row `s`:
//!
//! ```text
//! slot = block_id * block_size + offset
//! ```

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Bytes needed by one cache block across all layers, keys and values.
///
/// # Example
///
/// ```
/// use candle_core::DType;
/// use paged_llm::core::kv_cache::cache_block_size_bytes;
///
/// // 2 * 16 tokens * 8 heads * 64 dims * 2 layers * 2 bytes
/// assert_eq!(cache_block_size_bytes(16, 8, 64, 2, DType::F16), 65536);
/// ```
pub fn cache_block_size_bytes(
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
    num_layers: usize,
    dtype: DType,
) -> usize {
    2 * block_size * num_kv_heads * head_dim * num_layers * dtype.size_in_bytes()
}

/// KV cache for a single transformer layer.
#[derive(Debug)]
pub struct KVCache {
    /// Key cache: [num_blocks, block_size, num_kv_heads, head_dim]
    key_cache: Tensor,
    /// Value cache: [num_blocks, block_size, num_kv_heads, head_dim]
    value_cache: Tensor,
}

impl KVCache {
    /// Allocate zeroed key and value storage with the given shapes.
    pub fn new(
        key_shape: &[usize],
        value_shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if key_shape.len() != 4 || value_shape.len() != 4 {
            return Err(Error::Config(format!(
                "kv cache shapes must be [num_blocks, block_size, heads, head_dim], got {key_shape:?} and {value_shape:?}"
            )));
        }
        if key_shape[..2] != value_shape[..2] {
            return Err(Error::Config(format!(
                "key and value caches disagree on block geometry: {key_shape:?} vs {value_shape:?}"
            )));
        }

        let key_cache = Tensor::zeros(key_shape, dtype, device)?;
        let value_cache = Tensor::zeros(value_shape, dtype, device)?;
        Ok(Self {
            key_cache,
            value_cache,
        })
    }

    /// Get the key cache tensor.
    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    /// Get the value cache tensor.
    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }

    /// Number of blocks in this layer's cache.
    pub fn num_blocks(&self) -> usize {
        self.key_cache.dims()[0]
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.key_cache.dims()[1]
    }

    /// Total number of slots (`num_blocks * block_size`).
    pub fn num_slots(&self) -> usize {
        self.num_blocks() * self.block_size()
    }

    /// Memory held by this layer's keys and values.
    pub fn size_in_bytes(&self) -> usize {
        (self.key_cache.elem_count() + self.value_cache.elem_count())
            * self.key_cache.dtype().size_in_bytes()
    }

    /// Write per-token keys and values into their slots.
    ///
    /// # Arguments
    ///
    /// * `slot_ids` - One slot per token
    /// * `keys` - `[num_tokens, num_kv_heads, head_dim]`
    /// * `values` - `[num_tokens, num_kv_heads, head_dim]`
    pub fn set_kv_cache(&mut self, slot_ids: &[usize], keys: &Tensor, values: &Tensor) -> Result<()> {
        self.validate_slots(slot_ids)?;
        if keys.dim(0)? != slot_ids.len() || values.dim(0)? != slot_ids.len() {
            return Err(Error::Config(format!(
                "expected {} tokens, got keys {:?} and values {:?}",
                slot_ids.len(),
                keys.dims(),
                values.dims()
            )));
        }

        self.key_cache = write_slots(&self.key_cache, slot_ids, keys)?;
        self.value_cache = write_slots(&self.value_cache, slot_ids, values)?;
        Ok(())
    }

    /// Read keys and values for the given slots.
    ///
    /// # Returns
    ///
    /// Keys and values, each `[slot_ids.len(), num_kv_heads, head_dim]`.
    pub fn get_kv_cache(&self, slot_ids: &[usize]) -> Result<(Tensor, Tensor)> {
        self.validate_slots(slot_ids)?;

        let indices: Vec<u32> = slot_ids.iter().map(|&id| id as u32).collect();
        let index_tensor = Tensor::new(indices, self.key_cache.device())?;
        let keys = flatten_slots(&self.key_cache)?.index_select(&index_tensor, 0)?;
        let values = flatten_slots(&self.value_cache)?.index_select(&index_tensor, 0)?;
        Ok((keys, values))
    }

    fn validate_slots(&self, slot_ids: &[usize]) -> Result<()> {
        let num_slots = self.num_slots();
        if let Some(&slot) = slot_ids.iter().find(|&&slot| slot >= num_slots) {
            return Err(Error::Config(format!(
                "slot {slot} out of bounds (cache has {num_slots} slots)"
            )));
        }
        Ok(())
    }
}

/// View `[num_blocks, block_size, heads, dim]` as `[num_slots, heads, dim]`.
fn flatten_slots(cache: &Tensor) -> candle_core::Result<Tensor> {
    cache.flatten(0, 1)
}

/// Scatter `src` rows into `cache` at `slot_ids`.
///
/// Consecutive slots are written as one slice, so a sequence filling part of
/// a block costs a single copy.
fn write_slots(cache: &Tensor, slot_ids: &[usize], src: &Tensor) -> candle_core::Result<Tensor> {
    let dims = cache.dims().to_vec();
    let mut flat = flatten_slots(cache)?;

    let mut start = 0;
    while start < slot_ids.len() {
        let mut end = start + 1;
        while end < slot_ids.len() && slot_ids[end] == slot_ids[end - 1] + 1 {
            end += 1;
        }
        let rows = src.narrow(0, start, end - start)?.to_dtype(flat.dtype())?;
        flat = flat.slice_scatter0(&rows, slot_ids[start])?;
        start = end;
    }

    flat.reshape(dims)
}
