//! Execution core for tensor- and pipeline-parallel transformer decoding.
//!
//! The crate is organized around one [`engine::DecoderEngine`] per rank:
//! [`distributed`] supplies the rank topology and communication fabric,
//! [`kv_cache`] the per-stage cache lifecycle, [`scheduler`] bounded
//! admission for pipeline stages, and [`model`] the layer kernels the step
//! loop drives.

pub mod config;
pub mod context;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod model;
pub mod scheduler;
pub mod sequence;

pub use config::ModelConfig;
pub use context::ExecutionContext;
pub use engine::{DecoderEngine, EngineOptions, ForwardDims, ForwardOutput, ModelWeights};
pub use error::{EngineError, Result};
pub use scheduler::{CancelToken, SequenceScheduler};
pub use sequence::{SequenceGroupMeta, SequenceId, SequenceStatus};
