use candle_core::Tensor;
use candle_nn::Activation;

use crate::error::{EngineError, Result};

/// Full (unsharded) feed-forward weights for one layer.
///
/// `gate/up_proj`: `[intermediate, hidden]`; `down_proj`:
/// `[hidden, intermediate]`.
pub struct MlpWeights {
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

/// Tensor-parallel gated feed-forward block.
///
/// Gate and up projections are column-sharded along the intermediate
/// dimension, the down projection row-sharded, so `forward` yields a partial
/// that the caller reduces across the TP group.
pub struct StdMlp {
    gate_proj: Tensor,
    up_proj: Tensor,
    down_proj: Tensor,
    act: Activation,
}

impl StdMlp {
    pub fn new(
        weights: &MlpWeights,
        intermediate_size: usize,
        hidden_act: &str,
        tp_rank: usize,
        tp_size: usize,
    ) -> Result<Self> {
        if intermediate_size % tp_size != 0 {
            return Err(EngineError::UnevenHeadSplit {
                kind: "intermediate",
                heads: intermediate_size,
                tp_size,
            });
        }
        let act = match hidden_act {
            "silu" => Activation::Silu,
            "gelu" => Activation::Gelu,
            "gelu_pytorch_tanh" => Activation::NewGelu,
            "relu" => Activation::Relu,
            _ => return Err(EngineError::Unimplemented("activation function")),
        };

        let span = intermediate_size / tp_size;
        let gate_proj = weights
            .gate_proj
            .narrow(0, tp_rank * span, span)?
            .contiguous()?;
        let up_proj = weights
            .up_proj
            .narrow(0, tp_rank * span, span)?
            .contiguous()?;
        let down_proj = weights
            .down_proj
            .narrow(1, tp_rank * span, span)?
            .contiguous()?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act,
        })
    }

    /// `input`: `[rows, hidden]`; returns the pre-reduction partial
    /// `[rows, hidden]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        use candle_core::Module;
        let gate = input.matmul(&self.gate_proj.t()?)?;
        let gate = self.act.forward(&gate)?;
        let up = input.matmul(&self.up_proj.t()?)?;
        let hidden = (gate * up)?;
        Ok(hidden.matmul(&self.down_proj.t()?)?)
    }
}
