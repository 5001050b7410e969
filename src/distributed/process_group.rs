//! Topology description for distributed decoding.
//!
//! A rank's position in the cluster is a pair: its tensor-parallel rank
//! within a pipeline stage, and the stage ("color") it belongs to. World
//! ranks are laid out row-major: `world = color * tp_size + tp_rank`.

/// Static parallelism configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Number of ranks sharding each layer's computation.
    pub tensor_parallel_size: usize,
    /// Number of pipeline stages sharding the layer stack.
    pub pipeline_parallel_size: usize,
}

impl ParallelConfig {
    /// Create a new parallel configuration.
    ///
    /// # Panics
    /// Panics if any size is 0.
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Self {
        assert!(tensor_parallel_size > 0, "tensor_parallel_size must be > 0");
        assert!(
            pipeline_parallel_size > 0,
            "pipeline_parallel_size must be > 0"
        );
        Self {
            tensor_parallel_size,
            pipeline_parallel_size,
        }
    }

    /// No parallelism (single rank).
    pub fn no_parallelism() -> Self {
        Self::new(1, 1)
    }

    /// Tensor parallelism only.
    pub fn tensor_parallel(size: usize) -> Self {
        Self::new(size, 1)
    }

    /// Pipeline parallelism only.
    pub fn pipeline_parallel(size: usize) -> Self {
        Self::new(1, size)
    }

    /// Total number of ranks.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    /// Whether this is effectively single-rank execution.
    pub fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self::no_parallelism()
    }
}

/// One rank's coordinates inside a [`ParallelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankCoords {
    pub tp_rank: usize,
    pub pp_rank: usize,
}

impl RankCoords {
    /// Decompose a world rank into (stage, tp) coordinates.
    pub fn from_world(world_rank: usize, config: ParallelConfig) -> Self {
        Self {
            tp_rank: world_rank % config.tensor_parallel_size,
            pp_rank: world_rank / config.tensor_parallel_size,
        }
    }

    /// Recompose the world rank.
    pub fn world_rank(&self, config: ParallelConfig) -> usize {
        self.pp_rank * config.tensor_parallel_size + self.tp_rank
    }

    /// World rank of the same TP position in an adjacent stage.
    pub fn peer_in_stage(&self, stage: usize, config: ParallelConfig) -> usize {
        stage * config.tensor_parallel_size + self.tp_rank
    }
}
