//! Per-rank execution context: model shapes, the rank's coordinates, and the
//! grow-only scratch arena shared by a forward pass.
//!
//! One context is constructed per rank at startup and threaded through every
//! kernel call. Batch and sequence dimensions are rewritten by `resize` at
//! the top of each step; everything else is fixed after construction.

use std::cell::RefCell;
use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::ModelConfig;
use crate::distributed::{ParallelConfig, RankCoords};
use crate::error::{EngineError, Result};

pub struct ExecutionContext {
    // Per-step shapes, rewritten by `resize`.
    pub batch_size: usize,
    pub input_seq_len: usize,
    pub past_seq_len: usize,

    // Model shapes, fixed after construction.
    pub hidden_size: usize,
    pub att_head_num: usize,
    pub kv_head_num: usize,
    pub att_head_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_positions: usize,
    pub epsilon: f64,

    pub dtype: DType,
    pub device: Device,

    pub coords: RankCoords,
    pub parallel: ParallelConfig,

    // Named scratch tensors, grown but never shrunk across steps.
    scratch: RefCell<HashMap<String, Tensor>>,
}

impl ExecutionContext {
    pub fn new(
        config: &ModelConfig,
        coords: RankCoords,
        parallel: ParallelConfig,
        dtype: DType,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let tp = parallel.tensor_parallel_size;
        if config.num_attention_heads % tp != 0 {
            return Err(EngineError::UnevenHeadSplit {
                kind: "attention",
                heads: config.num_attention_heads,
                tp_size: tp,
            });
        }
        if config.kv_head_num() % tp != 0 {
            return Err(EngineError::UnevenHeadSplit {
                kind: "key/value",
                heads: config.kv_head_num(),
                tp_size: tp,
            });
        }
        Ok(Self {
            batch_size: 0,
            input_seq_len: 0,
            past_seq_len: 0,
            hidden_size: config.hidden_size,
            att_head_num: config.num_attention_heads,
            kv_head_num: config.kv_head_num(),
            att_head_size: config.att_head_size(),
            intermediate_size: config.intermediate_size,
            vocab_size: config.vocab_size,
            max_positions: config.max_positions(),
            epsilon: config.rms_norm_eps,
            dtype,
            device,
            coords,
            parallel,
            scratch: RefCell::new(HashMap::new()),
        })
    }

    pub fn tp_rank(&self) -> usize {
        self.coords.tp_rank
    }

    pub fn tp_size(&self) -> usize {
        self.parallel.tensor_parallel_size
    }

    pub fn pp_rank(&self) -> usize {
        self.coords.pp_rank
    }

    pub fn pp_size(&self) -> usize {
        self.parallel.pipeline_parallel_size
    }

    pub fn has_prev_stage(&self) -> bool {
        self.coords.pp_rank > 0
    }

    pub fn has_next_stage(&self) -> bool {
        self.coords.pp_rank + 1 < self.parallel.pipeline_parallel_size
    }

    /// Attention heads owned by this TP rank.
    pub fn heads_per_rank(&self) -> usize {
        self.att_head_num / self.tp_size()
    }

    /// KV heads owned by this TP rank.
    pub fn kv_heads_per_rank(&self) -> usize {
        self.kv_head_num / self.tp_size()
    }

    /// Token rows flowing through this step (`batch * input_seq_len`).
    pub fn total_tokens(&self) -> usize {
        self.batch_size * self.input_seq_len
    }

    /// Rewrite the per-step shapes, enforcing the position budget.
    pub fn resize(
        &mut self,
        batch_size: usize,
        input_seq_len: usize,
        past_seq_len: usize,
    ) -> Result<()> {
        let needed = past_seq_len + input_seq_len;
        if needed > self.max_positions {
            return Err(EngineError::PositionBudgetExceeded {
                needed,
                budget: self.max_positions,
            });
        }
        self.batch_size = batch_size;
        self.input_seq_len = input_seq_len;
        self.past_seq_len = past_seq_len;
        Ok(())
    }

    /// Check that `config` describes the same model this context was derived
    /// from. Shapes are load-bearing for every live cache and scratch buffer,
    /// so a mismatch is fatal rather than a trigger for reconfiguration.
    pub fn rederive(&self, config: &ModelConfig) -> Result<()> {
        if config.hidden_size != self.hidden_size {
            return Err(EngineError::IncompatibleContext {
                field: "hidden_size",
            });
        }
        if config.num_attention_heads != self.att_head_num {
            return Err(EngineError::IncompatibleContext {
                field: "num_attention_heads",
            });
        }
        if config.kv_head_num() != self.kv_head_num {
            return Err(EngineError::IncompatibleContext {
                field: "num_key_value_heads",
            });
        }
        if config.att_head_size() != self.att_head_size {
            return Err(EngineError::IncompatibleContext { field: "head_dim" });
        }
        if config.intermediate_size != self.intermediate_size {
            return Err(EngineError::IncompatibleContext {
                field: "intermediate_size",
            });
        }
        if config.vocab_size != self.vocab_size {
            return Err(EngineError::IncompatibleContext { field: "vocab_size" });
        }
        Ok(())
    }

    /// Fetch a named 1-D scratch tensor of at least `elems` elements.
    ///
    /// Buffers only ever grow; a request smaller than the resident buffer
    /// returns a prefix view. Contents are unspecified.
    pub fn get_buffer(&self, name: &str, elems: usize) -> Result<Tensor> {
        let mut scratch = self.scratch.borrow_mut();
        let grow = match scratch.get(name) {
            Some(buf) => buf.dim(0)? < elems,
            None => true,
        };
        if grow {
            debug!(name, elems, "growing scratch buffer");
            let buf = Tensor::zeros(elems, self.dtype, &self.device)?;
            scratch.insert(name.to_string(), buf);
        }
        let buf = scratch
            .get(name)
            .ok_or(EngineError::Unimplemented("scratch buffer lookup"))?;
        Ok(buf.narrow(0, 0, elems)?)
    }
}
