use candle_core::{Module, Tensor};
use candle_nn::RmsNorm;

use super::attention::{AttentionWeights, StdAttention};
use super::mlp::{MlpWeights, StdMlp};
use super::DecoderLayer;
use crate::error::Result;
use crate::kv_cache::CacheView;

/// Full weights for one decoder layer, pre-sharding.
pub struct LayerWeights {
    pub attention: AttentionWeights,
    pub mlp: MlpWeights,
    /// `[hidden]` pre-attention norm weight.
    pub input_norm: Tensor,
    /// `[hidden]` pre-FFN norm weight.
    pub post_attn_norm: Tensor,
}

/// Pre-norm decoder layer: RMSNorm feeds each sub-block, residuals live in
/// the step loop.
pub struct StdDecoderLayer {
    input_norm: RmsNorm,
    post_attn_norm: RmsNorm,
    attention: StdAttention,
    mlp: StdMlp,
}

impl StdDecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        weights: &LayerWeights,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        intermediate_size: usize,
        max_positions: usize,
        rope_theta: f64,
        hidden_act: &str,
        eps: f64,
        tp_rank: usize,
        tp_size: usize,
    ) -> Result<Self> {
        let attention = StdAttention::new(
            &weights.attention,
            num_heads,
            num_kv_heads,
            head_dim,
            max_positions,
            rope_theta,
            tp_rank,
            tp_size,
        )?;
        let mlp = StdMlp::new(
            &weights.mlp,
            intermediate_size,
            hidden_act,
            tp_rank,
            tp_size,
        )?;
        Ok(Self {
            input_norm: RmsNorm::new(weights.input_norm.clone(), eps),
            post_attn_norm: RmsNorm::new(weights.post_attn_norm.clone(), eps),
            attention,
            mlp,
        })
    }
}

impl DecoderLayer for StdDecoderLayer {
    fn forward_attention(
        &self,
        input: &Tensor,
        batch_size: usize,
        input_seq_len: usize,
        past_seq_len: usize,
        mask: Option<&Tensor>,
        key_cache: &CacheView,
        value_cache: &CacheView,
    ) -> Result<Tensor> {
        let normed = self.input_norm.forward(input)?;
        self.attention.forward(
            &normed,
            batch_size,
            input_seq_len,
            past_seq_len,
            mask,
            key_cache,
            value_cache,
        )
    }

    fn forward_ffn(&self, input: &Tensor) -> Result<Tensor> {
        let normed = self.post_attn_norm.forward(input)?;
        self.mlp.forward(&normed)
    }
}
