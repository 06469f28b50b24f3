//! Per-device worker.
//!
//! A [`Worker`] owns one model replica bound to its device and that device's
//! slice of the paged KV cache. Every operation runs on the worker's own
//! executor thread, so calls to one worker are strictly sequential. Each
//! operation comes in two flavours:
//!
//! - `*_async` queues the call and returns a [`TaskHandle`]
//! - the plain variant queues the call and joins it
//!
//! With more than one worker, every worker must receive the same calls in the
//! same order: the collectives inside the model's layers match ranks by call
//! order. A task that fails or panics aborts the worker's process group, so
//! peers blocked in a collective fail too.

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use super::executor::{Executor, TaskHandle};
use super::sampler::{OutputParameters, Sampler, SamplingParameters};
use crate::core::kv_cache::KVCache;
use crate::error::{Error, Result};
use crate::model::{CausalLM, InputParameters, ModelArgs, ModelRegistry, QuantizationArgs, StateDict};
use crate::parallel::{ParallelArgs, ProcessGroup};

/// Everything a worker's tasks touch. Only the executor thread locks it.
struct WorkerState {
    model: Option<Box<dyn CausalLM>>,
    n_layers: usize,
    dtype: DType,
    kv_caches: Vec<KVCache>,
    sampler: Sampler,
}

impl WorkerState {
    fn model(&self) -> Result<&dyn CausalLM> {
        self.model
            .as_deref()
            .ok_or_else(|| Error::ModelInit("model is not initialized".into()))
    }

    fn model_mut(&mut self) -> Result<&mut Box<dyn CausalLM>> {
        self.model
            .as_mut()
            .ok_or_else(|| Error::ModelInit("model is not initialized".into()))
    }
}

fn lock(state: &Mutex<WorkerState>) -> Result<MutexGuard<'_, WorkerState>> {
    state
        .lock()
        .map_err(|_| Error::TaskPanicked("worker state poisoned by an earlier task".into()))
}

/// Aborts the process group when dropped while armed, including during a panic.
struct AbortOnFailure {
    group: Option<Arc<dyn ProcessGroup>>,
    armed: bool,
}

impl Drop for AbortOnFailure {
    fn drop(&mut self) {
        if let (true, Some(group)) = (self.armed, &self.group) {
            group.abort();
        }
    }
}

/// One device's share of the engine.
pub struct Worker {
    device: Device,
    parallel_args: ParallelArgs,
    registry: Arc<ModelRegistry>,
    state: Arc<Mutex<WorkerState>>,
    executor: Executor,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("rank", &self.parallel_args.rank)
            .field("world_size", &self.parallel_args.world_size)
            .field("device", &self.device)
            .finish()
    }
}

impl Worker {
    /// Create the worker for `parallel_args.rank` and start its executor thread.
    ///
    /// `seed` seeds the sampler. Use the same seed on every rank so they
    /// sample the same tokens.
    pub fn new(
        device: Device,
        parallel_args: ParallelArgs,
        registry: Arc<ModelRegistry>,
        seed: u64,
    ) -> Result<Self> {
        let executor = Executor::new(parallel_args.rank)?;
        let state = WorkerState {
            model: None,
            n_layers: 0,
            dtype: DType::F32,
            kv_caches: Vec::new(),
            sampler: Sampler::with_seed(seed),
        };
        Ok(Self {
            device,
            parallel_args,
            registry,
            state: Arc::new(Mutex::new(state)),
            executor,
        })
    }

    pub fn rank(&self) -> usize {
        self.parallel_args.rank
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn parallel_args(&self) -> &ParallelArgs {
        &self.parallel_args
    }

    fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let group = self.parallel_args.process_group.clone();
        self.executor.submit(move || {
            let mut guard = AbortOnFailure { group, armed: true };
            let result = f();
            guard.armed = result.is_err();
            result
        })
    }

    /// Build the model replica through the registry.
    ///
    /// Any previous replica and cache are dropped first, so a failure leaves
    /// the worker without a model rather than with a half-built one.
    pub fn init_model_async(
        &self,
        dtype: DType,
        model_args: ModelArgs,
        quant_args: QuantizationArgs,
    ) -> TaskHandle<bool> {
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        let parallel_args = self.parallel_args.clone();
        let device = self.device.clone();

        self.submit(move || {
            let mut state = lock(&state)?;
            state.model = None;
            state.kv_caches.clear();

            let factory = registry.causal_lm_factory(&model_args.model_type)?;
            let model = factory(&model_args, &quant_args, &parallel_args, dtype, &device)?;

            state.model = Some(model);
            state.n_layers = model_args.n_layers;
            state.dtype = dtype;
            debug!(
                rank = parallel_args.rank,
                "initialized {} with {} layers ({dtype:?})",
                model_args.model_type,
                model_args.n_layers
            );
            Ok(true)
        })
    }

    pub fn init_model(
        &self,
        dtype: DType,
        model_args: ModelArgs,
        quant_args: QuantizationArgs,
    ) -> Result<bool> {
        self.init_model_async(dtype, model_args, quant_args).join()
    }

    /// Copy the parameters found in `state_dict` into the replica.
    pub fn load_state_dict_async(&self, state_dict: StateDict) -> TaskHandle<()> {
        let state = Arc::clone(&self.state);
        self.submit(move || {
            let mut state = lock(&state)?;
            state.model_mut()?.load_state_dict(&state_dict)
        })
    }

    pub fn load_state_dict(&self, state_dict: StateDict) -> Result<()> {
        self.load_state_dict_async(state_dict).join()
    }

    /// Fail if any parameter of the replica was never loaded.
    pub fn verify_loaded_weights_async(&self) -> TaskHandle<()> {
        let state = Arc::clone(&self.state);
        self.submit(move || {
            let state = lock(&state)?;
            state.model()?.verify_loaded_weights()
        })
    }

    pub fn verify_loaded_weights(&self) -> Result<()> {
        self.verify_loaded_weights_async().join()
    }

    /// Allocate one zeroed key/value cache per layer.
    pub fn init_kv_cache_async(
        &self,
        key_shape: Vec<usize>,
        value_shape: Vec<usize>,
    ) -> TaskHandle<bool> {
        let state = Arc::clone(&self.state);
        let device = self.device.clone();
        let rank = self.parallel_args.rank;

        self.submit(move || {
            let mut state = lock(&state)?;
            state.model()?;
            state.kv_caches.clear();

            let kv_caches = (0..state.n_layers)
                .map(|_| KVCache::new(&key_shape, &value_shape, state.dtype, &device))
                .collect::<Result<Vec<_>>>()?;
            let bytes: usize = kv_caches.iter().map(KVCache::size_in_bytes).sum();
            state.kv_caches = kv_caches;

            info!(
                rank,
                "allocated kv cache: {} layers x {:?}, {:.2} MiB",
                state.n_layers,
                key_shape,
                bytes as f64 / (1024.0 * 1024.0)
            );
            Ok(true)
        })
    }

    pub fn init_kv_cache(&self, key_shape: Vec<usize>, value_shape: Vec<usize>) -> Result<bool> {
        self.init_kv_cache_async(key_shape, value_shape).join()
    }

    /// Run one step: forward over the token stream, then sample one token per sequence.
    pub fn execute_model_async(
        &self,
        token_ids: Vec<u32>,
        positions: Vec<u32>,
        input_params: InputParameters,
        sampling_params: SamplingParameters,
    ) -> TaskHandle<OutputParameters> {
        let state = Arc::clone(&self.state);
        let device = self.device.clone();
        let rank = self.parallel_args.rank;

        self.submit(move || {
            let mut guard = lock(&state)?;
            let state = &mut *guard;
            let model = state
                .model
                .as_deref()
                .ok_or_else(|| Error::ModelInit("model is not initialized".into()))?;

            let num_tokens = token_ids.len();
            let token_ids = Tensor::from_vec(token_ids, num_tokens, &device)?;
            let positions = Tensor::from_vec(positions, num_tokens, &device)?;

            let logits = model.forward(&token_ids, &positions, &mut state.kv_caches, &input_params)?;
            let output = state.sampler.sample(&logits, &sampling_params, &input_params)?;
            debug!(
                rank,
                num_tokens,
                num_seqs = output.len(),
                "executed step"
            );
            Ok(output)
        })
    }

    pub fn execute_model(
        &self,
        token_ids: Vec<u32>,
        positions: Vec<u32>,
        input_params: InputParameters,
        sampling_params: SamplingParameters,
    ) -> Result<OutputParameters> {
        self.execute_model_async(token_ids, positions, input_params, sampling_params)
            .join()
    }
}
