//! Execution engine.
//!
//! This module contains:
//! - Engine for orchestrating the device workers
//! - Worker, one per device, running on its own Executor thread
//! - BatchPreparer for building the per-step model inputs
//! - Sampler for token sampling

pub mod batch;
pub mod executor;
pub mod llm;
pub mod sampler;
pub mod worker;

pub use batch::{BatchPreparer, PreparedBatch};
pub use executor::{Executor, TaskHandle};
pub use llm::Engine;
pub use sampler::{OutputParameters, Sampler, SamplingParameters};
pub use worker::Worker;
