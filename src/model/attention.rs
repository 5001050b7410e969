use candle_core::{DType, Device, Tensor};

use crate::error::{EngineError, Result};
use crate::kv_cache::CacheView;

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_positions: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Full (unsharded) attention projection weights for one layer.
///
/// `q/k/v_proj`: `[heads * head_dim, hidden]`; `o_proj`:
/// `[hidden, heads * head_dim]`. Each rank slices its shard at construction.
pub struct AttentionWeights {
    pub q_proj: Tensor,
    pub k_proj: Tensor,
    pub v_proj: Tensor,
    pub o_proj: Tensor,
}

/// Tensor-parallel self-attention for one decoder layer.
///
/// Query/key/value projections are column-sharded by head; the output
/// projection is row-sharded, so `forward` yields a partial that the caller
/// reduces across the TP group.
pub struct StdAttention {
    q_proj: Tensor,
    k_proj: Tensor,
    v_proj: Tensor,
    o_proj: Tensor,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    num_kv_groups: usize,
    head_dim: usize,
}

impl StdAttention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        weights: &AttentionWeights,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        max_positions: usize,
        rope_theta: f64,
        tp_rank: usize,
        tp_size: usize,
    ) -> Result<Self> {
        if num_heads % tp_size != 0 {
            return Err(EngineError::UnevenHeadSplit {
                kind: "attention",
                heads: num_heads,
                tp_size,
            });
        }
        if num_kv_heads % tp_size != 0 {
            return Err(EngineError::UnevenHeadSplit {
                kind: "key/value",
                heads: num_kv_heads,
                tp_size,
            });
        }
        let heads_per_rank = num_heads / tp_size;
        let kv_heads_per_rank = num_kv_heads / tp_size;

        // Column shard: rows [rank * span, (rank + 1) * span) of the packed
        // head dimension.
        let q_span = heads_per_rank * head_dim;
        let kv_span = kv_heads_per_rank * head_dim;
        let q_proj = weights
            .q_proj
            .narrow(0, tp_rank * q_span, q_span)?
            .contiguous()?;
        let k_proj = weights
            .k_proj
            .narrow(0, tp_rank * kv_span, kv_span)?
            .contiguous()?;
        let v_proj = weights
            .v_proj
            .narrow(0, tp_rank * kv_span, kv_span)?
            .contiguous()?;
        // Row shard: the output projection consumes this rank's head slice.
        let o_proj = weights
            .o_proj
            .narrow(1, tp_rank * q_span, q_span)?
            .contiguous()?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            max_positions,
            rope_theta,
            weights.q_proj.dtype(),
            weights.q_proj.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads: heads_per_rank,
            num_kv_heads: kv_heads_per_rank,
            num_kv_groups: heads_per_rank / kv_heads_per_rank,
            head_dim,
        })
    }

    /// KV heads this rank appends to its cache shard.
    pub fn kv_heads_per_rank(&self) -> usize {
        self.num_kv_heads
    }

    /// `input`: `[batch * input_seq_len, hidden]`. Appends this step's K/V
    /// at `past_seq_len`, attends over the whole view, and returns the
    /// pre-reduction partial `[batch * input_seq_len, hidden]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: &Tensor,
        batch_size: usize,
        input_seq_len: usize,
        past_seq_len: usize,
        mask: Option<&Tensor>,
        key_cache: &CacheView,
        value_cache: &CacheView,
    ) -> Result<Tensor> {
        let q = input.matmul(&self.q_proj.t()?)?;
        let k = input.matmul(&self.k_proj.t()?)?;
        let v = input.matmul(&self.v_proj.t()?)?;

        let q = q
            .reshape((batch_size, input_seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch_size, input_seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v.reshape((batch_size, input_seq_len, self.num_kv_heads, self.head_dim))?;

        let (q, k) = self.rotary_emb.apply(&q, &k, past_seq_len)?;

        // Append post-RoPE K and V at this step's position offset.
        let k_for_cache = k.transpose(1, 2)?.contiguous()?;
        key_cache.append(&k_for_cache, past_seq_len)?;
        value_cache.append(&v.contiguous()?, past_seq_len)?;

        // Attend over everything resident, including what was just written.
        let total = past_seq_len + input_seq_len;
        let k_full = key_cache.read(total)?.transpose(1, 2)?.contiguous()?;
        let v_full = value_cache.read(total)?.transpose(1, 2)?.contiguous()?;

        let k_full = self.repeat_kv(k_full)?;
        let v_full = self.repeat_kv(v_full)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k_full.transpose(2, 3)?)? * scale)?;
        let attn_weights = match mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v_full)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((
            batch_size * input_seq_len,
            self.num_heads * self.head_dim,
        ))?;
        Ok(attn_output.matmul(&self.o_proj.t()?)?)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        if self.num_kv_groups == 1 {
            return Ok(x);
        }
        let (b, num_kv_heads, s, d) = x.dims4()?;
        let x = x
            .unsqueeze(2)?
            .expand((b, num_kv_heads, self.num_kv_groups, s, d))?
            .reshape((b, self.num_heads, s, d))?;
        Ok(x)
    }
}
