//! `tiny`: a minimal causal LM over the paged KV cache.
//!
//! ```text
//! token ids
//!     │
//!     ▼ ParallelEmbedding                      (all-gather)
//! hidden [T, hidden]
//!     │
//!     ▼ × n_layers
//!   k = k_proj(h), v = v_proj(h)               (column parallel, local heads)
//!   write k, v to the cache at slot_ids
//!   a = mean of v over positions 0..=p          (prefill: fresh values, decode: cache)
//!   h = h + o_proj(a)                           (row parallel, all-reduce)
//!     │
//!     ▼ select last_token_indices
//!     ▼ lm_head                                 (column parallel, all-gather)
//! logits [num_seqs, vocab]
//! ```
//!
//! Attention weights are uniform, so keys are stored but never read. The model
//! exists to drive the cache, the batch layout and every collective with real
//! tensors; it is not meant to produce useful text.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::core::kv_cache::KVCache;
use crate::error::{Error, Result};
use crate::model::layers::{ColumnParallelLinear, ParallelEmbedding, RowParallelLinear};
use crate::model::registry::ModelRegistry;
use crate::model::{CausalLM, InputParameters, ModelArgs, QuantizationArgs, StateDict};
use crate::parallel::ParallelArgs;

/// Registry key of this family.
pub const MODEL_TYPE: &str = "tiny";

/// Register the `tiny` family.
pub fn register(registry: &mut ModelRegistry) {
    registry.register_causal_lm(
        MODEL_TYPE,
        Arc::new(
            |args: &ModelArgs,
             quant_args: &QuantizationArgs,
             parallel_args: &ParallelArgs,
             dtype: DType,
             device: &Device|
             -> Result<Box<dyn CausalLM>> {
                Ok(Box::new(TinyForCausalLM::new(
                    args,
                    quant_args,
                    parallel_args,
                    dtype,
                    device,
                )?))
            },
        ),
    );
}

#[derive(Debug)]
struct TinyLayer {
    k_proj: ColumnParallelLinear,
    v_proj: ColumnParallelLinear,
    o_proj: RowParallelLinear,
}

/// The `tiny` model.
#[derive(Debug)]
pub struct TinyForCausalLM {
    embed_tokens: ParallelEmbedding,
    layers: Vec<TinyLayer>,
    lm_head: ColumnParallelLinear,
    n_local_kv_heads: usize,
    head_dim: usize,
    device: Device,
}

impl TinyForCausalLM {
    pub fn new(
        args: &ModelArgs,
        quant_args: &QuantizationArgs,
        parallel_args: &ParallelArgs,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if quant_args.is_quantized() {
            return Err(Error::ModelInit(format!(
                "{MODEL_TYPE} does not support quantization ({})",
                quant_args.quant_method
            )));
        }
        args.check_parallel(parallel_args.world_size)
            .map_err(|e| Error::ModelInit(e.to_string()))?;

        let hidden = args.hidden_size;
        let head_dim = args.head_dim();
        let kv_dim = args.num_kv_heads() * head_dim;

        let embed_tokens =
            ParallelEmbedding::new(args.vocab_size, hidden, parallel_args, dtype, device)?;
        let layers = (0..args.n_layers)
            .map(|_| {
                Ok(TinyLayer {
                    k_proj: ColumnParallelLinear::new(
                        hidden,
                        kv_dim,
                        false,
                        false,
                        parallel_args,
                        dtype,
                        device,
                    )?,
                    v_proj: ColumnParallelLinear::new(
                        hidden,
                        kv_dim,
                        false,
                        false,
                        parallel_args,
                        dtype,
                        device,
                    )?,
                    o_proj: RowParallelLinear::new(
                        kv_dim,
                        hidden,
                        false,
                        parallel_args,
                        dtype,
                        device,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let lm_head = ColumnParallelLinear::new(
            hidden,
            args.vocab_size,
            false,
            true,
            parallel_args,
            dtype,
            device,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            lm_head,
            n_local_kv_heads: args.num_local_kv_heads(parallel_args.world_size),
            head_dim,
            device: device.clone(),
        })
    }

    fn layer_forward(
        &self,
        layer: &TinyLayer,
        hidden: &Tensor,
        kv_cache: &mut KVCache,
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        let num_tokens = hidden.dim(0)?;
        let shape = (num_tokens, self.n_local_kv_heads, self.head_dim);
        let k = layer.k_proj.forward(hidden)?.reshape(shape)?;
        let v = layer.v_proj.forward(hidden)?.reshape(shape)?;

        kv_cache.set_kv_cache(&input_params.slot_ids, &k, &v)?;
        let attn = uniform_attention(&v, kv_cache, input_params)?
            .reshape((num_tokens, self.n_local_kv_heads * self.head_dim))?;

        let out = layer.o_proj.forward(&attn)?;
        Ok((hidden + out)?)
    }
}

/// Each token's output is the mean of the values at positions `0..=p` of its sequence.
///
/// Prefill tokens read the fresh values; decode tokens read every cached
/// value through their block table.
fn uniform_attention(
    v: &Tensor,
    kv_cache: &KVCache,
    input_params: &InputParameters,
) -> Result<Tensor> {
    let mut outputs = Vec::with_capacity(input_params.num_seqs());

    for window in input_params.cu_seq_lens.windows(2) {
        let (start, len) = (window[0], window[1] - window[0]);
        let values = v.narrow(0, start, len)?;
        let counts: Vec<f32> = (1..=len).map(|n| n as f32).collect();
        let counts = Tensor::from_vec(counts, (len, 1, 1), v.device())?.to_dtype(v.dtype())?;
        outputs.push(values.cumsum(0)?.broadcast_div(&counts)?);
    }

    let block_size = kv_cache.block_size();
    for (block_table, &context_len) in input_params
        .block_tables
        .iter()
        .zip(&input_params.context_lens)
    {
        let slots: Vec<usize> = (0..context_len)
            .map(|pos| block_table[pos / block_size] * block_size + pos % block_size)
            .collect();
        let (_, values) = kv_cache.get_kv_cache(&slots)?;
        outputs.push(values.mean_keepdim(0)?);
    }

    Ok(Tensor::cat(&outputs, 0)?)
}

impl CausalLM for TinyForCausalLM {
    fn forward(
        &self,
        token_ids: &Tensor,
        positions: &Tensor,
        kv_caches: &mut [KVCache],
        input_params: &InputParameters,
    ) -> Result<Tensor> {
        if positions.dims() != token_ids.dims() {
            return Err(Error::Config(format!(
                "positions {:?} do not match token ids {:?}",
                positions.dims(),
                token_ids.dims()
            )));
        }
        if kv_caches.len() != self.layers.len() {
            return Err(Error::Config(format!(
                "expected {} kv caches, got {}",
                self.layers.len(),
                kv_caches.len()
            )));
        }

        let mut hidden = self.embed_tokens.forward(token_ids)?;
        for (layer, kv_cache) in self.layers.iter().zip(kv_caches.iter_mut()) {
            hidden = self.layer_forward(layer, &hidden, kv_cache, input_params)?;
        }

        let last = input_params.last_token_indices_tensor(&self.device)?;
        let hidden = hidden.index_select(&last, 0)?;
        self.lm_head.forward(&hidden)
    }

    fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        self.embed_tokens
            .load_state_dict(&state_dict.select("embed_tokens."))?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let prefix = state_dict.select(&format!("layers.{i}."));
            layer.k_proj.load_state_dict(&prefix.select("k_proj."))?;
            layer.v_proj.load_state_dict(&prefix.select("v_proj."))?;
            layer.o_proj.load_state_dict(&prefix.select("o_proj."))?;
        }
        self.lm_head.load_state_dict(&state_dict.select("lm_head."))
    }

    fn verify_loaded_weights(&self) -> Result<()> {
        let mut missing = Vec::new();
        if !self.embed_tokens.is_loaded() {
            missing.push("embed_tokens.weight".to_string());
        }
        for (i, layer) in self.layers.iter().enumerate() {
            for (name, loaded) in [
                ("k_proj", layer.k_proj.is_loaded()),
                ("v_proj", layer.v_proj.is_loaded()),
                ("o_proj", layer.o_proj.is_loaded()),
            ] {
                if !loaded {
                    missing.push(format!("layers.{i}.{name}.weight"));
                }
            }
        }
        if !self.lm_head.is_loaded() {
            missing.push("lm_head.weight".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingWeights(missing))
        }
    }
}
