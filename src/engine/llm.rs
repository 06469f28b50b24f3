//! Multi-device execution engine.
//!
//! The Engine owns one [`Worker`] per device, the process groups connecting
//! them and the [`BlockManager`] of the paged KV cache. It drives model
//! initialization and per-step execution with fork/join over the workers.
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!           init()           │        execute_model()
//!                ▼           │               ▼
//!   ┌──────────────────────┐ │    ┌──────────────────────┐
//!   │ config + tokenizer   │ │    │    BatchPreparer     │
//!   └──────────────────────┘ │    │  (allocates blocks)  │
//!                ▼           │    └──────────────────────┘
//!   ┌──────────────────────┐ │               ▼
//!   │ init_model on all    │ │    ┌──────────────────────┐
//!   └──────────────────────┘ │    │ execute_model on all │
//!                ▼           │    │   workers, joined    │
//!   ┌──────────────────────┐ │    └──────────────────────┘
//!   │ each shard → all     │ │               ▼
//!   └──────────────────────┘ │    ┌──────────────────────┐
//!                ▼           │    │ rank 0 output, back  │
//!   ┌──────────────────────┐ │    │ in caller order      │
//!   │ verify, size cache,  │ │    └──────────────────────┘
//!   │ init_kv_cache on all │ │
//!   └──────────────────────┘ │
//! ```
//!
//! Every fan-out waits for every worker before reporting, and a failure on
//! any worker fails the whole call.

use std::sync::Arc;

use candle_core::{DType, Device};
use tracing::{debug, error, info, warn};

use super::batch::{BatchPreparer, PreparedBatch};
use super::executor::TaskHandle;
use super::sampler::OutputParameters;
use super::worker::Worker;
use crate::config::EngineConfig;
use crate::core::block_manager::BlockManager;
use crate::core::kv_cache::cache_block_size_bytes;
use crate::core::memory::DeviceMemory;
use crate::core::sequence::Sequence;
use crate::error::{Error, Result};
use crate::model::{parse_dtype, ModelArgs, ModelRegistry, Tokenizer, WeightSource};
use crate::parallel::{create_process_groups, ParallelArgs};

/// Join every handle, then report the first failure.
///
/// Ranks released by an aborted collective only report the abort, so a rank
/// with a different error is reported ahead of them.
fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_error = None;

    for handle in handles {
        let rank = handle.rank();
        match handle.join() {
            Ok(value) => results.push(value),
            Err(e) => {
                error!(rank, "worker task failed: {e}");
                let e = e.on_worker(rank);
                match &first_error {
                    None => first_error = Some(e),
                    Some(first) if first.is_collective_aborted() && !e.is_collective_aborted() => {
                        first_error = Some(e)
                    }
                    Some(_) => {}
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// State that only exists after a successful [`Engine::init`].
struct Initialized {
    model_args: ModelArgs,
    tokenizer: Arc<dyn Tokenizer>,
    dtype: DType,
    block_manager: BlockManager,
}

/// Top-level orchestrator over the device workers.
pub struct Engine {
    devices: Vec<Device>,
    workers: Vec<Worker>,
    registry: Arc<ModelRegistry>,
    config: EngineConfig,
    batch_preparer: BatchPreparer,
    state: Option<Initialized>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.devices)
            .field("config", &self.config)
            .field("initialized", &self.state.is_some())
            .finish()
    }
}

impl Engine {
    /// Create an engine over `devices`, one worker per device.
    ///
    /// With more than one device the model is split across all of them and
    /// the workers are connected by in-process collectives.
    pub fn new(
        devices: Vec<Device>,
        registry: Arc<ModelRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(Error::Config("at least one device is required".into()));
        }
        if let Some(device) = devices.iter().find(|d| d.is_metal()) {
            return Err(Error::UnsupportedDevice(format!("{device:?}")));
        }

        let world_size = devices.len();
        let groups: Vec<Option<_>> = if world_size > 1 {
            create_process_groups(&devices).into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let workers = devices
            .iter()
            .zip(groups)
            .enumerate()
            .map(|(rank, (device, group))| {
                let parallel_args = ParallelArgs::new(rank, world_size, group);
                Worker::new(
                    device.clone(),
                    parallel_args,
                    Arc::clone(&registry),
                    config.seed,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "created engine with {world_size} worker(s) on {:?}",
            devices
        );

        Ok(Self {
            batch_preparer: BatchPreparer::new(config.block_size),
            devices,
            workers,
            registry,
            config,
            state: None,
        })
    }

    /// Load a model from `source` onto every worker and size the KV cache.
    ///
    /// On failure the engine is left uninitialized.
    pub fn init<W: WeightSource>(&mut self, source: W) -> Result<()> {
        self.state = None;
        self.reset_collectives();

        // Model and quantization args
        let config = source.config()?;
        let model_type = config
            .get("model_type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::Config("config.json has no model_type".into()))?
            .to_string();
        let mut model_args = self.registry.load_model_args(&model_type, &config)?;
        model_args.model_type = model_type.clone();
        let quant_args = self.registry.load_quant_args(&model_type, &config)?;
        info!("{model_args}");
        if quant_args.is_quantized() {
            info!("{quant_args}");
        }

        let tokenizer = source.tokenizer()?;
        if tokenizer.vocab_size() != model_args.vocab_size {
            warn!(
                "tokenizer vocab size {} does not match model vocab size {}",
                tokenizer.vocab_size(),
                model_args.vocab_size
            );
        }

        let dtype_name = self
            .config
            .dtype
            .clone()
            .unwrap_or_else(|| model_args.dtype.clone());
        let dtype = parse_dtype(&dtype_name, &self.devices[0])?;

        // Model replicas
        info!("initializing {model_type} on {} worker(s) ({dtype:?})", self.workers.len());
        if let [worker] = self.workers.as_slice() {
            worker
                .init_model(dtype, model_args.clone(), quant_args)
                .map_err(|e| e.on_worker(0))?;
        } else {
            join_all(
                self.workers
                    .iter()
                    .map(|w| w.init_model_async(dtype, model_args.clone(), quant_args.clone()))
                    .collect(),
            )?;
        }

        // Weights, one shard at a time
        for (i, shard) in source.into_state_dicts().enumerate() {
            let shard = shard?;
            debug!("applying weight shard {i} ({} tensors)", shard.len());
            join_all(
                self.workers
                    .iter()
                    .map(|w| w.load_state_dict_async(shard.clone()))
                    .collect(),
            )?;
        }
        join_all(
            self.workers
                .iter()
                .map(Worker::verify_loaded_weights_async)
                .collect(),
        )?;
        info!("all weights loaded");

        // KV cache
        let world_size = self.workers.len();
        let block_size = self.config.block_size;
        let n_local_kv_heads = model_args.num_local_kv_heads(world_size);
        let head_dim = model_args.head_dim();
        let block_bytes = cache_block_size_bytes(
            block_size,
            n_local_kv_heads,
            head_dim,
            model_args.n_layers,
            dtype,
        );

        let device = &self.devices[0];
        let memory = DeviceMemory::measure(device)?;
        let budget = memory.cache_budget(
            device,
            self.config.max_cache_size,
            self.config.max_memory_utilization,
        );
        let num_blocks = budget.checked_div(block_bytes).unwrap_or(0);
        if num_blocks == 0 {
            return Err(Error::InsufficientMemory(format!(
                "{budget} bytes available for the cache, one block needs {block_bytes}"
            )));
        }
        info!(
            "kv cache: {num_blocks} blocks of {block_size} tokens, {:.2} MiB per block, {:.2} MiB total",
            block_bytes as f64 / (1024.0 * 1024.0),
            (num_blocks * block_bytes) as f64 / (1024.0 * 1024.0)
        );

        let shape = vec![num_blocks, block_size, n_local_kv_heads, head_dim];
        join_all(
            self.workers
                .iter()
                .map(|w| w.init_kv_cache_async(shape.clone(), shape.clone()))
                .collect(),
        )?;

        self.state = Some(Initialized {
            model_args,
            tokenizer,
            dtype,
            block_manager: BlockManager::new(num_blocks, block_size),
        });
        Ok(())
    }

    /// Run one step over `sequences` and sample one token for each.
    ///
    /// Blocks are assigned to the sequences as needed. Results come back in
    /// the order of `sequences`; the caller appends the tokens.
    pub fn execute_model(&mut self, sequences: &mut [Sequence]) -> Result<OutputParameters> {
        let mut outputs = self.execute_model_all(sequences)?;
        if outputs.is_empty() {
            return Ok(OutputParameters::default());
        }
        // Rank 0 speaks for the group.
        Ok(outputs.swap_remove(0))
    }

    /// Like [`Engine::execute_model`], but returns every worker's output, indexed by rank.
    pub fn execute_model_all(
        &mut self,
        sequences: &mut [Sequence],
    ) -> Result<Vec<OutputParameters>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let preparer = self.batch_preparer;
        let state = self.initialized_mut()?;

        let PreparedBatch {
            token_ids,
            positions,
            input_params,
            sampling_params,
            seq_indices,
        } = preparer.prepare(sequences, &mut state.block_manager)?;
        debug!(
            num_seqs = seq_indices.len(),
            num_prefill = input_params.num_prefill_seqs(),
            num_tokens = token_ids.len(),
            free_blocks = state.block_manager.num_free_blocks(),
            "executing step"
        );

        self.reset_collectives();
        let outputs = if let [worker] = self.workers.as_slice() {
            vec![worker
                .execute_model(token_ids, positions, input_params, sampling_params)
                .map_err(|e| e.on_worker(0))?]
        } else {
            join_all(
                self.workers
                    .iter()
                    .map(|w| {
                        w.execute_model_async(
                            token_ids.clone(),
                            positions.clone(),
                            input_params.clone(),
                            sampling_params.clone(),
                        )
                    })
                    .collect(),
            )?
        };

        if outputs.iter().any(|o| o.next_tokens != outputs[0].next_tokens) {
            warn!("workers sampled different tokens; using rank 0");
        }
        Ok(outputs
            .iter()
            .map(|o| o.index_select(&seq_indices))
            .collect())
    }

    /// Return the blocks of `sequence` to the pool.
    pub fn release_sequence(&mut self, sequence: &mut Sequence) -> Result<()> {
        let state = self.initialized_mut()?;
        let block_ids = sequence.block_table_mut().take_blocks();
        state.block_manager.free(&block_ids)
    }

    fn initialized_mut(&mut self) -> Result<&mut Initialized> {
        self.state
            .as_mut()
            .ok_or_else(|| Error::Config("engine is not initialized".into()))
    }

    /// Re-arm the process groups after a failed call. Every worker is idle here.
    fn reset_collectives(&self) {
        for worker in &self.workers {
            if let Some(group) = &worker.parallel_args().process_group {
                group.reset();
            }
        }
    }

    /// Whether [`Engine::init`] succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// The cache block pool, once initialized.
    pub fn block_manager(&self) -> Option<&BlockManager> {
        self.state.as_ref().map(|s| &s.block_manager)
    }

    /// Total number of cache blocks; 0 before initialization.
    pub fn num_blocks(&self) -> usize {
        self.block_manager().map_or(0, BlockManager::num_blocks)
    }

    pub fn tokenizer(&self) -> Option<&Arc<dyn Tokenizer>> {
        self.state.as_ref().map(|s| &s.tokenizer)
    }

    pub fn model_args(&self) -> Option<&ModelArgs> {
        self.state.as_ref().map(|s| &s.model_args)
    }

    pub fn dtype(&self) -> Option<DType> {
        self.state.as_ref().map(|s| s.dtype)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }
}
