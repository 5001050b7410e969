//! Crate-level error taxonomy.
//!
//! The engine is a fail-fast batch compute core: every variant here is
//! terminal for the distributed job. Nothing is retried and no partial
//! results are recovered; callers are expected to abort on error.

use thiserror::Error;

use crate::distributed::DistributedError;
use crate::kv_cache::CacheError;

/// Errors surfaced by the decode engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Layer count must be evenly divisible across pipeline stages.
    #[error("layer count {layers} is not divisible by pipeline stage count {pp_size}")]
    UnevenLayerSplit { layers: usize, pp_size: usize },

    /// Attention/KV head counts must split evenly across the TP group.
    #[error("{heads} {kind} heads cannot be split across {tp_size} tensor-parallel ranks")]
    UnevenHeadSplit {
        kind: &'static str,
        heads: usize,
        tp_size: usize,
    },

    /// An existing execution context cannot be re-derived with different
    /// model shapes mid-run.
    #[error("incompatible context re-derivation: {field} changed")]
    IncompatibleContext { field: &'static str },

    /// A numeric path (embedding, normalization, activation) has no
    /// specialization for the requested representation.
    #[error("unimplemented numeric path: {0}")]
    Unimplemented(&'static str),

    /// The quantization descriptor triple is not a supported combination.
    #[error("unsupported quantization descriptor: {0}")]
    UnsupportedQuantization(String),

    /// Requested positions exceed the configured cache budget.
    #[error("position budget exceeded: need {needed}, budget {budget}")]
    PositionBudgetExceeded { needed: usize, budget: usize },

    /// Token buffer length does not match the declared shape.
    #[error("input length mismatch: expected {expected} token ids, got {got}")]
    InputLength { expected: usize, got: usize },

    /// The continuous-batch path was invoked with no sequence groups.
    #[error("forward called with an empty sequence group batch")]
    EmptyBatch,

    /// The bounded ready queue is at capacity; the push was rejected.
    #[error("ready queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Shutdown was requested while waiting for work.
    #[error("cancelled while waiting for ready sequence groups")]
    Cancelled,

    /// A sequence identifier was not found in the live registry.
    #[error("unknown sequence group {0}")]
    UnknownSequence(u64),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Distributed(#[from] DistributedError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
