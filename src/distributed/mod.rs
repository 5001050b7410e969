//! Tensor- and pipeline-parallel plumbing: rank topology, the communication
//! fabric, and the vocabulary-sharded output projection.

pub mod dist_linear;
pub mod error;
pub mod fabric;
pub mod process_group;

pub use dist_linear::DistLinear;
pub use error::{DistributedError, Result};
pub use fabric::{CommFabric, LocalFabric, ThreadFabric};
pub use process_group::{ParallelConfig, RankCoords};
