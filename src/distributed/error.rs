//! Error types for the communication fabric.

use thiserror::Error;

/// Errors that can occur during collective or point-to-point operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Participants disagreed on element counts for a collective call.
    #[error("collective element count mismatch: expected {expected}, got {actual}")]
    ElementCountMismatch { expected: usize, actual: usize },

    /// A received payload did not match the shape the receiver posted.
    #[error("payload shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Point-to-point operation addressed a stage with no endpoint.
    #[error("no peer endpoint for pipeline stage {stage}")]
    NoPeer { stage: usize },

    /// The wire protocol was violated (payload without a control message).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A peer hung up mid-transfer.
    #[error("peer disconnected during transfer")]
    Disconnected,

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
