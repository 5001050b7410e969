use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tandem_core::model::{AttentionWeights, LayerWeights, MlpWeights};
use tandem_core::{ModelConfig, ModelWeights};

pub fn tiny_config() -> ModelConfig {
    serde_json::from_str(
        r#"{
            "hidden_size": 16,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2,
            "intermediate_size": 24,
            "vocab_size": 32,
            "max_position_embeddings": 64
        }"#,
    )
    .unwrap()
}

/// Deterministic random weights: the same seed yields byte-identical tensors,
/// so every rank of a test world can rebuild the model independently.
pub fn tiny_weights(seed: u64, config: &ModelConfig) -> ModelWeights {
    let mut rng = StdRng::seed_from_u64(seed);
    let dev = Device::Cpu;
    let mut t = |shape: (usize, usize)| {
        let n = shape.0 * shape.1;
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.2..0.2)).collect();
        Tensor::from_vec(data, shape, &dev).unwrap()
    };
    let hidden = config.hidden_size;
    let heads = config.num_attention_heads;
    let kv_heads = config.kv_head_num();
    let d = config.att_head_size();
    let inter = config.intermediate_size;

    let mut layers = Vec::new();
    for _ in 0..config.num_hidden_layers {
        layers.push(LayerWeights {
            attention: AttentionWeights {
                q_proj: t((heads * d, hidden)),
                k_proj: t((kv_heads * d, hidden)),
                v_proj: t((kv_heads * d, hidden)),
                o_proj: t((hidden, heads * d)),
            },
            mlp: MlpWeights {
                gate_proj: t((inter, hidden)),
                up_proj: t((inter, hidden)),
                down_proj: t((hidden, inter)),
            },
            input_norm: Tensor::ones(hidden, DType::F32, &dev).unwrap(),
            post_attn_norm: Tensor::ones(hidden, DType::F32, &dev).unwrap(),
        });
    }
    ModelWeights {
        embed_tokens: t((config.vocab_size, hidden)),
        final_norm: Tensor::ones(hidden, DType::F32, &dev).unwrap(),
        lm_head: t((config.vocab_size, hidden)),
        layers,
    }
}

pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32, what: &str) {
    assert_eq!(a.len(), b.len(), "{what}: length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "{what}: element {i} differs: {x} vs {y}"
        );
    }
}
