//! Decoder layer kernels and the seams the forward orchestrator drives them
//! through.
//!
//! Layer outputs are tensor-parallel partials: each rank computes its head
//! and intermediate shard, and the orchestrator owns the reduction and the
//! residual adds. That keeps the reduction arrangement (serial vs fused
//! attention+FFN) a property of the step loop, not of the kernels.

pub mod attention;
pub mod layer;
pub mod mlp;

pub use attention::{AttentionWeights, StdAttention};
pub use layer::{LayerWeights, StdDecoderLayer};
pub use mlp::{MlpWeights, StdMlp};

use candle_core::{DType, Device, Tensor};
use candle_nn::RmsNorm;

use crate::error::{EngineError, Result};
use crate::kv_cache::CacheView;

/// One transformer layer's compute, split at the reduction boundary.
pub trait DecoderLayer: Send + Sync {
    /// Pre-attention norm plus self-attention over the cache view.
    ///
    /// `input` is `[batch * input_seq_len, hidden]`; the result is this
    /// rank's partial of the same shape, before residual and reduction.
    #[allow(clippy::too_many_arguments)]
    fn forward_attention(
        &self,
        input: &Tensor,
        batch_size: usize,
        input_seq_len: usize,
        past_seq_len: usize,
        mask: Option<&Tensor>,
        key_cache: &CacheView,
        value_cache: &CacheView,
    ) -> Result<Tensor>;

    /// Pre-FFN norm plus the feed-forward block; returns this rank's
    /// partial, before residual and reduction.
    fn forward_ffn(&self, input: &Tensor) -> Result<Tensor>;
}

/// Model-level operations outside the per-layer loop.
pub trait ModelOps: Send + Sync {
    /// Token ids to hidden states, `[ids.len(), hidden]`.
    fn embed(&self, token_ids: &[u32]) -> Result<Tensor>;

    /// Additive causal mask `[input_seq_len, past + input_seq_len]`, or
    /// `None` for single-token steps where nothing is masked.
    fn prepare_attn_mask(
        &self,
        input_seq_len: usize,
        past_seq_len: usize,
    ) -> Result<Option<Tensor>>;

    /// Final normalization ahead of the output projection.
    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor>;
}

/// Contiguous block of layers owned by one pipeline stage.
///
/// The layer count must divide evenly: stages run in lockstep and an uneven
/// split would leave the deepest stage permanently behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePartition {
    first_layer: usize,
    num_layers: usize,
}

impl StagePartition {
    pub fn new(total_layers: usize, pp_rank: usize, pp_size: usize) -> Result<Self> {
        if total_layers % pp_size != 0 {
            return Err(EngineError::UnevenLayerSplit {
                layers: total_layers,
                pp_size,
            });
        }
        let num_layers = total_layers / pp_size;
        Ok(Self {
            first_layer: pp_rank * num_layers,
            num_layers,
        })
    }

    pub fn first_layer(&self) -> usize {
        self.first_layer
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Global layer indices held by this stage.
    pub fn layer_range(&self) -> std::ops::Range<usize> {
        self.first_layer..self.first_layer + self.num_layers
    }
}

/// Embedding table, final norm, and mask construction for a standard decoder.
pub struct StdModel {
    embed_tokens: Tensor,
    norm: RmsNorm,
    dtype: DType,
    device: Device,
}

impl StdModel {
    /// `embed_tokens` is the full `[vocab, hidden]` table; `norm_weight` is
    /// `[hidden]`.
    pub fn new(embed_tokens: Tensor, norm_weight: Tensor, eps: f64) -> Result<Self> {
        let dtype = embed_tokens.dtype();
        if dtype != DType::F32 {
            return Err(EngineError::Unimplemented("non-f32 embedding table"));
        }
        let device = embed_tokens.device().clone();
        Ok(Self {
            embed_tokens,
            norm: RmsNorm::new(norm_weight, eps),
            dtype,
            device,
        })
    }
}

impl ModelOps for StdModel {
    fn embed(&self, token_ids: &[u32]) -> Result<Tensor> {
        let ids = Tensor::from_vec(token_ids.to_vec(), (token_ids.len(),), &self.device)?;
        Ok(self.embed_tokens.index_select(&ids, 0)?)
    }

    fn prepare_attn_mask(
        &self,
        input_seq_len: usize,
        past_seq_len: usize,
    ) -> Result<Option<Tensor>> {
        if input_seq_len <= 1 {
            return Ok(None);
        }
        let total = past_seq_len + input_seq_len;
        let mut data = vec![0f32; input_seq_len * total];
        for i in 0..input_seq_len {
            for j in (past_seq_len + i + 1)..total {
                data[i * total + j] = f32::NEG_INFINITY;
            }
        }
        let mask = Tensor::from_vec(data, (input_seq_len, total), &self.device)?
            .to_dtype(self.dtype)?;
        Ok(Some(mask))
    }

    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        use candle_core::Module;
        Ok(self.norm.forward(hidden)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_layers_evenly() {
        let p = StagePartition::new(8, 1, 2).unwrap();
        assert_eq!(p.first_layer(), 4);
        assert_eq!(p.num_layers(), 4);
        assert_eq!(p.layer_range(), 4..8);
    }

    #[test]
    fn uneven_partition_is_rejected() {
        assert!(matches!(
            StagePartition::new(10, 0, 3),
            Err(EngineError::UnevenLayerSplit {
                layers: 10,
                pp_size: 3
            })
        ));
    }

    #[test]
    fn causal_mask_hides_future_positions() {
        let dev = Device::Cpu;
        let embed = Tensor::zeros((4, 2), DType::F32, &dev).unwrap();
        let norm_w = Tensor::ones(2, DType::F32, &dev).unwrap();
        let model = StdModel::new(embed, norm_w, 1e-6).unwrap();

        // 2 new tokens after 1 past position.
        let mask = model.prepare_attn_mask(2, 1).unwrap().unwrap();
        assert_eq!(mask.dims(), &[2, 3]);
        let flat = mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Row 0 sees positions 0..=1, row 1 sees everything.
        assert_eq!(flat[0], 0.0);
        assert_eq!(flat[1], 0.0);
        assert!(flat[2].is_infinite());
        assert!(flat[3..].iter().all(|&x| x == 0.0));

        // Single-token decode steps need no mask.
        assert!(model.prepare_attn_mask(1, 5).unwrap().is_none());
    }

    #[test]
    fn embed_selects_rows() {
        let dev = Device::Cpu;
        let table: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let embed = Tensor::from_vec(table, (4, 2), &dev).unwrap();
        let norm_w = Tensor::ones(2, DType::F32, &dev).unwrap();
        let model = StdModel::new(embed, norm_w, 1e-6).unwrap();

        let out = model.embed(&[2, 0]).unwrap();
        assert_eq!(out.dims(), &[2, 2]);
        assert_eq!(
            out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![4.0, 5.0, 0.0, 1.0]
        );
    }
}
