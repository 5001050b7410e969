//! The per-rank decode engine: one object per (tp_rank, pp_rank) that owns
//! the stage's layer shard, its KV cache, and the step loop.
//!
//! A step runs the same sequence on every rank of the world: embed (or
//! receive the previous stage's activation), walk the stage's layers with
//! attention and FFN partials reduced across the TP group, then either hand
//! the hidden states to the next stage or project logits. Residual adds live
//! here rather than in the layers so that each add happens exactly once on
//! fully reduced tensors.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::distributed::{CommFabric, DistLinear, ParallelConfig, RankCoords};
use crate::error::{EngineError, Result};
use crate::kv_cache::{CacheView, KvCacheManager};
use crate::model::{
    DecoderLayer, LayerWeights, ModelOps, StagePartition, StdDecoderLayer, StdModel,
};
use crate::scheduler::{CancelToken, SequenceScheduler};
use crate::sequence::{SequenceGroupMeta, SequenceId};

/// Sequence id used for the shared-prefix pass through the pipeline.
const PREFIX_SEQUENCE_ID: SequenceId = u64::MAX;

/// Batch geometry for one step, as submitted by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ForwardDims {
    /// Prompts as the user submitted them, before beam replication.
    pub user_side_bs: usize,
    /// Beams per prompt; 1 for sampling.
    pub beam_size: usize,
    /// Tokens per sequence this step (prompt length at step 0, usually 1
    /// after).
    pub seq_len: usize,
}

/// What a step produced on this rank.
pub enum ForwardOutput {
    /// Last stage: this rank's logits shard plus its vocabulary window.
    Logits {
        logits: Tensor,
        shard_offset: usize,
        shard_size: usize,
    },
    /// Non-last stage: hidden states were handed to the next stage.
    Forwarded,
}

/// Full model weights, unsharded; each rank slices what it owns.
pub struct ModelWeights {
    /// `[vocab, hidden]` embedding table.
    pub embed_tokens: Tensor,
    /// `[hidden]` final norm weight.
    pub final_norm: Tensor,
    /// `[vocab, hidden]` output projection.
    pub lm_head: Tensor,
    /// All layers, outermost first; a stage keeps only its partition.
    pub layers: Vec<LayerWeights>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Fuse the attention and FFN reductions into one collective per layer.
    pub attn_mlp_parallel: bool,
    /// Emit logits for every input position instead of only the last.
    pub logits_all: bool,
    /// Ready-queue bound for pipeline admission.
    pub ready_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            attn_mlp_parallel: false,
            logits_all: false,
            ready_capacity: 256,
        }
    }
}

pub struct DecoderEngine {
    fabric: Arc<dyn CommFabric>,
    ctx: ExecutionContext,
    model: Box<dyn ModelOps>,
    layers: Vec<Box<dyn DecoderLayer>>,
    partition: StagePartition,
    predictor: DistLinear,
    kv: KvCacheManager,
    scheduler: Option<Arc<SequenceScheduler>>,
    cancel: CancelToken,
    options: EngineOptions,

    init_seq_len: usize,
    acc_seq_len: usize,
    prefix_seq_len: usize,
    prefix_sharing: bool,
}

impl DecoderEngine {
    pub fn new(
        config: &ModelConfig,
        weights: &ModelWeights,
        fabric: Arc<dyn CommFabric>,
        options: EngineOptions,
    ) -> Result<Self> {
        let parallel = ParallelConfig::new(fabric.size(), fabric.stages());
        let coords = RankCoords {
            tp_rank: fabric.rank(),
            pp_rank: fabric.color(),
        };
        let ctx = ExecutionContext::new(
            config,
            coords,
            parallel,
            weights.embed_tokens.dtype(),
            weights.embed_tokens.device().clone(),
        )?;

        if weights.layers.len() != config.num_hidden_layers {
            return Err(EngineError::IncompatibleContext {
                field: "num_hidden_layers",
            });
        }
        let partition =
            StagePartition::new(config.num_hidden_layers, coords.pp_rank, parallel.pipeline_parallel_size)?;
        let mut layers: Vec<Box<dyn DecoderLayer>> = Vec::with_capacity(partition.num_layers());
        for global in partition.layer_range() {
            let layer = StdDecoderLayer::new(
                &weights.layers[global],
                config.num_attention_heads,
                config.kv_head_num(),
                config.att_head_size(),
                config.intermediate_size,
                config.max_positions(),
                config.rope_theta,
                &config.hidden_act,
                config.rms_norm_eps,
                coords.tp_rank,
                parallel.tensor_parallel_size,
            )?;
            layers.push(Box::new(layer));
        }

        let model = StdModel::new(
            weights.embed_tokens.clone(),
            weights.final_norm.clone(),
            config.rms_norm_eps,
        )?;
        let predictor = DistLinear::new(&weights.lm_head, coords.tp_rank, parallel.tensor_parallel_size)?;

        let kv = KvCacheManager::configure(
            partition.num_layers(),
            ctx.kv_heads_per_rank(),
            ctx.att_head_size,
            ctx.dtype,
            ctx.device.clone(),
        );

        let scheduler = if parallel.pipeline_parallel_size > 1 {
            Some(Arc::new(SequenceScheduler::new(options.ready_capacity)))
        } else {
            None
        };

        info!(
            tp_rank = coords.tp_rank,
            tp_size = parallel.tensor_parallel_size,
            pp_rank = coords.pp_rank,
            pp_size = parallel.pipeline_parallel_size,
            layers = partition.num_layers(),
            "decode engine ready"
        );

        Ok(Self {
            fabric,
            ctx,
            model: Box::new(model),
            layers,
            partition,
            predictor,
            kv,
            scheduler,
            cancel: CancelToken::new(),
            options,
            init_seq_len: 0,
            acc_seq_len: 0,
            prefix_seq_len: 0,
            prefix_sharing: false,
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn partition(&self) -> StagePartition {
        self.partition
    }

    /// Positions accumulated in the cache for the live sequences.
    pub fn acc_seq_len(&self) -> usize {
        self.acc_seq_len
    }

    /// Prompt length recorded at step 0.
    pub fn init_seq_len(&self) -> usize {
        self.init_seq_len
    }

    /// Record a prompt of `init_seq_len` tokens as already processed, so the
    /// next `forward` call runs as a decode step. The KV entries for those
    /// positions must already be resident.
    pub fn skip_first_step(&mut self, init_seq_len: usize) {
        self.init_seq_len = init_seq_len;
        self.acc_seq_len = init_seq_len;
    }

    /// Revalidate this engine against a reloaded `config`. Live caches and
    /// sharded weights carry the construction-time shapes, so any structural
    /// drift is fatal rather than a trigger for reconfiguration.
    pub fn rederive(&self, config: &ModelConfig) -> Result<()> {
        config.validate()?;
        self.ctx.rederive(config)?;
        let total_layers = self.partition.num_layers() * self.ctx.pp_size();
        if config.num_hidden_layers != total_layers {
            return Err(EngineError::IncompatibleContext {
                field: "num_hidden_layers",
            });
        }
        Ok(())
    }

    /// One decode step for a uniform batch.
    ///
    /// At step 0 the batch is `user_side_bs` prompts of `seq_len` tokens;
    /// afterwards it is `user_side_bs * beam_size` sequences of one token.
    /// `token_ids` is row-major `[batch, input_seq_len]` and is only read on
    /// the first stage.
    pub fn forward(
        &mut self,
        sequence_id: SequenceId,
        token_ids: &[u32],
        dims: ForwardDims,
        step: usize,
    ) -> Result<ForwardOutput> {
        let user_bs = dims.user_side_bs;
        let beam = dims.beam_size;
        let batch = if step == 0 { user_bs } else { user_bs * beam };

        let (input_seq_len, past) = if step == 0 {
            // A shared prefix consumes the front of the prompt; only the
            // remainder flows through this step.
            let prefix = if self.prefix_sharing { self.prefix_seq_len } else { 0 };
            self.init_seq_len = dims.seq_len;
            self.acc_seq_len = prefix;
            (dims.seq_len - prefix, prefix)
        } else {
            (dims.seq_len, self.acc_seq_len)
        };

        self.ctx.resize(batch, input_seq_len, past)?;
        self.kv.resize(user_bs * beam, self.ctx.max_positions)?;

        debug!(
            sequence_id,
            step,
            batch,
            input_seq_len,
            past,
            "forward step"
        );

        // With a resident prefix, prompts still arrive whole; drop each
        // row's prefix tokens before embedding.
        let sliced_ids: Vec<u32>;
        let step_ids = if step == 0 && self.prefix_sharing && !self.ctx.has_prev_stage() {
            if token_ids.len() != batch * dims.seq_len {
                return Err(EngineError::InputLength {
                    expected: batch * dims.seq_len,
                    got: token_ids.len(),
                });
            }
            sliced_ids = (0..batch)
                .flat_map(|b| {
                    token_ids[b * dims.seq_len + past..(b + 1) * dims.seq_len]
                        .iter()
                        .copied()
                })
                .collect();
            &sliced_ids[..]
        } else {
            token_ids
        };

        let mut hidden = self.acquire_hidden(sequence_id, step_ids, batch, input_seq_len, past)?;
        self.acc_seq_len += input_seq_len;

        // Stage the activations through the context pool so repeated steps
        // reuse one resident buffer per rank.
        let rows = batch * input_seq_len;
        let staged = self
            .ctx
            .get_buffer("hidden_states", rows * self.ctx.hidden_size)?
            .reshape((rows, self.ctx.hidden_size))?;
        staged.slice_set(&hidden, 0, 0)?;
        hidden = staged;

        let mask = self.model.prepare_attn_mask(input_seq_len, past)?;
        let expand_beams = step == 0 && beam > 1;

        for (idx, layer) in self.layers.iter().enumerate() {
            if step == 0 && self.prefix_sharing {
                // Seed each prompt's slot with the shared prefix before this
                // layer's first per-sequence append.
                self.kv
                    .expand_prefix_cache(idx, user_bs, self.prefix_seq_len)?;
            }
            let key_view = CacheView::new(self.kv.key(idx)?, 0, batch);
            let value_view = CacheView::new(self.kv.value(idx)?, 0, batch);

            let attn_partial = layer.forward_attention(
                &hidden,
                batch,
                input_seq_len,
                past,
                mask.as_ref(),
                &key_view,
                &value_view,
            )?;

            if expand_beams {
                // This layer's prompt entries are complete; fan them out
                // across the beam span before any later step touches them.
                self.kv
                    .expand_cache(idx, user_bs, beam, past + input_seq_len)?;
            }

            hidden = if self.options.attn_mlp_parallel {
                // Both blocks read the layer input; one collective carries
                // the sum of their partials.
                let ffn_partial = layer.forward_ffn(&hidden)?;
                let combined = (&attn_partial + &ffn_partial)?;
                let reduced = self.fabric.reduce_add(&combined)?;
                (&hidden + &reduced)?
            } else {
                let attn = self.fabric.reduce_add(&attn_partial)?;
                let hidden1 = (&hidden + &attn)?;
                let ffn_partial = layer.forward_ffn(&hidden1)?;
                let ffn = self.fabric.reduce_add(&ffn_partial)?;
                (&hidden1 + &ffn)?
            };
        }

        if self.ctx.has_next_stage() {
            self.fabric
                .send_activation(self.ctx.pp_rank() + 1, sequence_id, &hidden)?;
            return Ok(ForwardOutput::Forwarded);
        }

        self.project_logits(&hidden, batch, input_seq_len, user_bs, beam, step)
    }

    /// Produce the hidden states feeding this stage's layers: embedding on
    /// the first stage, the previous stage's activation elsewhere. Pipeline
    /// admission runs here so every stage pulls work through its bounded
    /// ready queue.
    fn acquire_hidden(
        &mut self,
        sequence_id: SequenceId,
        token_ids: &[u32],
        batch: usize,
        input_seq_len: usize,
        past: usize,
    ) -> Result<Tensor> {
        let rows = batch * input_seq_len;

        if self.ctx.has_prev_stage() {
            let scheduler = self
                .scheduler
                .as_ref()
                .ok_or(EngineError::Unimplemented("pipeline without scheduler"))?
                .clone();
            let (recv_id, activation) = self
                .fabric
                .recv_activation(self.ctx.pp_rank() - 1, &[rows, self.ctx.hidden_size])?;
            scheduler.admit_remote(recv_id, input_seq_len, past, 0, activation)?;

            let meta = scheduler.next_running(&self.cancel)?;
            let hidden = meta
                .activation
                .clone()
                .ok_or(EngineError::UnknownSequence(meta.sequence_id))?;
            scheduler.complete(meta.sequence_id)?;
            return Ok(hidden);
        }

        if token_ids.len() != rows {
            return Err(EngineError::InputLength {
                expected: rows,
                got: token_ids.len(),
            });
        }

        if let Some(scheduler) = self.scheduler.clone() {
            scheduler.submit(SequenceGroupMeta::new(sequence_id, token_ids.to_vec(), 0));
            scheduler.admit_local()?;
            let meta = scheduler.next_running(&self.cancel)?;
            let hidden = self.model.embed(&meta.token_ids)?;
            scheduler.complete(meta.sequence_id)?;
            return Ok(hidden);
        }

        self.model.embed(token_ids)
    }

    /// Last-stage tail: pick the logit rows, normalize, project this rank's
    /// vocabulary shard, and replicate per-prompt rows across beams at
    /// step 0.
    fn project_logits(
        &self,
        hidden: &Tensor,
        batch: usize,
        input_seq_len: usize,
        user_bs: usize,
        beam: usize,
        step: usize,
    ) -> Result<ForwardOutput> {
        let ln_in = if self.options.logits_all || input_seq_len == 1 {
            hidden.clone()
        } else {
            // Only each sequence's final position feeds the predictor.
            let rows: Vec<u32> = (0..batch)
                .map(|b| ((b + 1) * input_seq_len - 1) as u32)
                .collect();
            let idx = Tensor::from_vec(rows, (batch,), &self.ctx.device)?;
            hidden.index_select(&idx, 0)?
        };

        let normed = self.model.final_norm(&ln_in)?;
        let mut logits = self.predictor.forward(&normed)?;

        if step == 0 && beam > 1 {
            // Every beam of a prompt starts from the same distribution; with
            // `logits_all` the whole prompt grid is fanned out per beam.
            let shard = self.predictor.split_size();
            let per_seq = if self.options.logits_all {
                input_seq_len
            } else {
                1
            };
            logits = logits
                .reshape((user_bs, 1, per_seq * shard))?
                .expand((user_bs, beam, per_seq * shard))?
                .reshape((user_bs * beam * per_seq, shard))?
                .contiguous()?;
        }

        Ok(ForwardOutput::Logits {
            logits,
            shard_offset: self.predictor.split_offset(),
            shard_size: self.predictor.split_size(),
        })
    }

    /// One decode step for sequence groups with differing lengths and
    /// offsets, packed row-wise into a single pass. Beam replication does
    /// not apply here; each group advances independently.
    pub fn forward_batch(&mut self, groups: &[SequenceGroupMeta]) -> Result<ForwardOutput> {
        if groups.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let total_tokens: usize = groups.iter().map(|g| g.input_seq_len).sum();
        let max_needed = groups
            .iter()
            .map(|g| g.past_seq_len + g.input_seq_len)
            .max()
            .unwrap_or(0);
        if max_needed > self.ctx.max_positions {
            return Err(EngineError::PositionBudgetExceeded {
                needed: max_needed,
                budget: self.ctx.max_positions,
            });
        }
        let max_slot = groups.iter().map(|g| g.slot).max().unwrap_or(0);
        self.kv.resize(max_slot + 1, self.ctx.max_positions)?;

        let mut hidden = if self.ctx.has_prev_stage() {
            let (_, activation) = self.fabric.recv_activation(
                self.ctx.pp_rank() - 1,
                &[total_tokens, self.ctx.hidden_size],
            )?;
            activation
        } else {
            let ids: Vec<u32> = groups.iter().flat_map(|g| g.token_ids.clone()).collect();
            if ids.len() != total_tokens {
                return Err(EngineError::InputLength {
                    expected: total_tokens,
                    got: ids.len(),
                });
            }
            self.model.embed(&ids)?
        };

        let staged = self
            .ctx
            .get_buffer("hidden_states", total_tokens * self.ctx.hidden_size)?
            .reshape((total_tokens, self.ctx.hidden_size))?;
        staged.slice_set(&hidden, 0, 0)?;
        hidden = staged;

        // Row span of each group within the packed hidden states.
        let mut offsets = Vec::with_capacity(groups.len());
        let mut cursor = 0;
        for g in groups.iter() {
            offsets.push(cursor);
            cursor += g.input_seq_len;
        }

        for (idx, layer) in self.layers.iter().enumerate() {
            let mut attn_parts = Vec::with_capacity(groups.len());
            for (g, &offset) in groups.iter().zip(&offsets) {
                let rows = hidden.narrow(0, offset, g.input_seq_len)?.contiguous()?;
                let mask = self
                    .model
                    .prepare_attn_mask(g.input_seq_len, g.past_seq_len)?;
                let key_view = CacheView::new(self.kv.key(idx)?, g.slot, 1);
                let value_view = CacheView::new(self.kv.value(idx)?, g.slot, 1);
                attn_parts.push(layer.forward_attention(
                    &rows,
                    1,
                    g.input_seq_len,
                    g.past_seq_len,
                    mask.as_ref(),
                    &key_view,
                    &value_view,
                )?);
            }
            // One collective for the whole packed batch keeps ranks in
            // lockstep regardless of group count.
            let attn_partial = Tensor::cat(&attn_parts, 0)?;

            hidden = if self.options.attn_mlp_parallel {
                let ffn_partial = layer.forward_ffn(&hidden)?;
                let combined = (&attn_partial + &ffn_partial)?;
                let reduced = self.fabric.reduce_add(&combined)?;
                (&hidden + &reduced)?
            } else {
                let attn = self.fabric.reduce_add(&attn_partial)?;
                let hidden1 = (&hidden + &attn)?;
                let ffn_partial = layer.forward_ffn(&hidden1)?;
                let ffn = self.fabric.reduce_add(&ffn_partial)?;
                (&hidden1 + &ffn)?
            };
        }

        if self.ctx.has_next_stage() {
            self.fabric.send_activation(
                self.ctx.pp_rank() + 1,
                groups[0].sequence_id,
                &hidden,
            )?;
            return Ok(ForwardOutput::Forwarded);
        }

        let ln_in = if self.options.logits_all {
            hidden.clone()
        } else {
            let rows: Vec<u32> = groups
                .iter()
                .zip(&offsets)
                .map(|(g, &offset)| (offset + g.input_seq_len - 1) as u32)
                .collect();
            let idx = Tensor::from_vec(rows, (groups.len(),), &self.ctx.device)?;
            hidden.index_select(&idx, 0)?
        };
        let normed = self.model.final_norm(&ln_in)?;
        let logits = self.predictor.forward(&normed)?;
        Ok(ForwardOutput::Logits {
            logits,
            shard_offset: self.predictor.split_offset(),
            shard_size: self.predictor.split_size(),
        })
    }

    /// Run the shared prefix through this stage once, populating the
    /// per-layer prefix caches. Subsequent step-0 calls seed every prompt's
    /// slot from them instead of recomputing the prefix.
    pub fn set_prefix(&mut self, token_ids: &[u32]) -> Result<()> {
        let prefix_len = token_ids.len();
        self.ctx.resize(1, prefix_len, 0)?;
        self.kv.resize_prefix(prefix_len)?;

        let rows = prefix_len;
        let mut hidden = if self.ctx.has_prev_stage() {
            let (_, activation) = self
                .fabric
                .recv_activation(self.ctx.pp_rank() - 1, &[rows, self.ctx.hidden_size])?;
            activation
        } else {
            self.model.embed(token_ids)?
        };

        let mask = self.model.prepare_attn_mask(prefix_len, 0)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            let key_view = CacheView::new(self.kv.prefix_key(idx)?, 0, 1);
            let value_view = CacheView::new(self.kv.prefix_value(idx)?, 0, 1);
            let attn_partial = layer.forward_attention(
                &hidden,
                1,
                prefix_len,
                0,
                mask.as_ref(),
                &key_view,
                &value_view,
            )?;
            hidden = if self.options.attn_mlp_parallel {
                let ffn_partial = layer.forward_ffn(&hidden)?;
                let combined = (&attn_partial + &ffn_partial)?;
                let reduced = self.fabric.reduce_add(&combined)?;
                (&hidden + &reduced)?
            } else {
                let attn = self.fabric.reduce_add(&attn_partial)?;
                let hidden1 = (&hidden + &attn)?;
                let ffn_partial = layer.forward_ffn(&hidden1)?;
                let ffn = self.fabric.reduce_add(&ffn_partial)?;
                (&hidden1 + &ffn)?
            };
        }

        if self.ctx.has_next_stage() {
            self.fabric
                .send_activation(self.ctx.pp_rank() + 1, PREFIX_SEQUENCE_ID, &hidden)?;
        }

        self.prefix_seq_len = prefix_len;
        self.prefix_sharing = true;
        info!(prefix_len, "shared prefix resident");
        Ok(())
    }

    /// Drop the resident shared prefix; the next step 0 runs full prompts.
    pub fn unset_prefix(&mut self) {
        self.kv.clear_prefix();
        self.prefix_sharing = false;
        self.prefix_seq_len = 0;
    }

    /// Reorder the first `size` cache slots for beam survival: new slot `i`
    /// takes old slot `indices[i]`. Only positions up to the accumulated
    /// length are moved.
    pub fn reorder_cache(&mut self, indices: &[usize], size: usize) -> Result<()> {
        self.kv.reorder_cache(indices, size, self.acc_seq_len)?;
        Ok(())
    }
}
