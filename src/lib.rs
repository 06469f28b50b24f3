//! paged-llm: the multi-device execution core of an LLM serving engine.
//!
//! This crate implements:
//! - A paged KV cache: fixed-size blocks, per-sequence block tables, a block pool
//! - Tensor-parallel workers, one per device, joined by in-process collectives
//! - Batch preparation mixing prefill and decode sequences in one step
//! - A model registry, weight loading and a seeded sampler

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod model;
pub mod parallel;

pub use config::{EngineConfig, SamplingConfig};
pub use core::block::{BlockId, BlockTable};
pub use core::block_manager::BlockManager;
pub use core::sequence::{Sequence, SequenceId};
pub use engine::{BatchPreparer, Engine, OutputParameters, PreparedBatch, Sampler, Worker};
pub use error::{Error, Result};
pub use model::{
    download_model, InputParameters, ModelArgs, ModelFiles, ModelLoader, ModelRegistry,
    QuantizationArgs, StateDict,
};
pub use parallel::{ParallelArgs, ProcessGroup};
