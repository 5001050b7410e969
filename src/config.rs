use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Decoder hyper-parameters, deserialized from the model's JSON config.
///
/// Field names follow the upstream config files; anything we do not interpret
/// is kept in `extra` so a config round-trips without loss.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub model_max_length: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,

    #[serde(default)]
    pub quant: Option<QuantConfig>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

/// Weight quantization descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantConfig {
    pub weight_dtype: String,
    #[serde(default = "default_group_size")]
    pub group_size: i64,
}

fn default_group_size() -> i64 {
    -1
}

impl ModelConfig {
    /// KV head count; models without grouped-query attention omit it.
    pub fn kv_head_num(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head width; derived from the hidden size when not given.
    pub fn att_head_size(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Hard position budget for any sequence held in the cache.
    pub fn max_positions(&self) -> usize {
        self.model_max_length
            .unwrap_or(self.max_position_embeddings)
    }

    /// Reject configurations the execution core cannot honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(quant) = &self.quant {
            match quant.weight_dtype.as_str() {
                "fp32" | "fp16" | "bf16" => {}
                other => {
                    return Err(EngineError::UnsupportedQuantization(format!(
                        "weight dtype {other:?} with group_size {}",
                        quant.group_size
                    )))
                }
            }
            if quant.group_size != -1 {
                return Err(EngineError::UnsupportedQuantization(format!(
                    "grouped quantization (group_size {})",
                    quant.group_size
                )));
            }
        }
        Ok(())
    }
}
