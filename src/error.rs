//! Error types for paged-llm.

use thiserror::Error;

/// Result type alias for paged-llm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paged-llm.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free KV cache blocks to satisfy an allocation.
    ///
    /// Reported synchronously; the caller decides whether to wait, reject or evict.
    #[error("kv cache exhausted: requested {requested} blocks, {available} free")]
    CacheExhausted { requested: usize, available: usize },

    /// A block id was freed that is not currently allocated.
    #[error("block {block_id} is not allocated")]
    InvalidBlockFree { block_id: usize },

    /// A token position maps past the end of a block table.
    #[error("logical block {logical_idx} out of bounds ({num_blocks} blocks allocated)")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// Device type the engine cannot run on.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Device memory cannot hold even a single cache block.
    #[error("not enough memory for the kv cache: {0}")]
    InsufficientMemory(String),

    /// Model construction failed on a worker.
    #[error("failed to initialize model: {0}")]
    ModelInit(String),

    /// No model family registered under this name.
    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    /// A loaded tensor does not match its target parameter.
    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Parameters left unset after all weight shards were applied.
    #[error("weights not loaded: {}", .0.join(", "))]
    MissingWeights(Vec<String>),

    /// An operation on one worker failed.
    #[error("worker {rank} failed: {source}")]
    WorkerFailed {
        rank: usize,
        #[source]
        source: Box<Error>,
    },

    /// The worker thread went away before returning a result.
    #[error("worker {0} disconnected")]
    WorkerDisconnected(usize),

    /// A task panicked on a worker thread.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// Ranks disagreed on the shape of a collective operation.
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),

    /// A collective was abandoned because another rank failed.
    #[error("collective aborted: another rank failed")]
    CollectiveAborted,

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap this error with the rank of the worker that produced it.
    pub fn on_worker(self, rank: usize) -> Self {
        match self {
            Error::WorkerFailed { .. } | Error::WorkerDisconnected(_) => self,
            other => Error::WorkerFailed {
                rank,
                source: Box::new(other),
            },
        }
    }

    /// Whether this is (or wraps) a [`Error::CollectiveAborted`].
    pub fn is_collective_aborted(&self) -> bool {
        match self {
            Error::CollectiveAborted => true,
            Error::WorkerFailed { source, .. } => source.is_collective_aborted(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) a [`Error::CacheExhausted`].
    pub fn is_cache_exhausted(&self) -> bool {
        match self {
            Error::CacheExhausted { .. } => true,
            Error::WorkerFailed { source, .. } => source.is_cache_exhausted(),
            _ => false,
        }
    }
}
