//! Multi-rank equivalence: a tensor-parallel world of threads must produce
//! the same logits as a single rank, modulo shard reassembly.

mod common;

use std::sync::Arc;
use std::thread;

use tandem_core::distributed::{LocalFabric, ParallelConfig, ThreadFabric};
use tandem_core::{DecoderEngine, EngineOptions, ForwardDims, ForwardOutput};

use common::{assert_close, tiny_config, tiny_weights, to_vec};

const SEED: u64 = 23;

fn reference_logits(steps: &[(Vec<u32>, ForwardDims)]) -> Vec<Vec<f32>> {
    let config = tiny_config();
    let weights = tiny_weights(SEED, &config);
    let mut engine = DecoderEngine::new(
        &config,
        &weights,
        Arc::new(LocalFabric::new()),
        EngineOptions::default(),
    )
    .unwrap();

    steps
        .iter()
        .enumerate()
        .map(|(step, (ids, dims))| match engine.forward(0, ids, *dims, step).unwrap() {
            ForwardOutput::Logits { logits, .. } => to_vec(&logits),
            ForwardOutput::Forwarded => panic!("single rank never forwards"),
        })
        .collect()
}

/// Run the same step schedule on every rank of a TP world and reassemble
/// rank shards into full logit rows.
fn tensor_parallel_logits(tp: usize, steps: &[(Vec<u32>, ForwardDims)]) -> Vec<Vec<f32>> {
    let fabrics = ThreadFabric::connect(ParallelConfig::tensor_parallel(tp));
    let vocab = tiny_config().vocab_size;

    let handles: Vec<_> = fabrics
        .into_iter()
        .map(|fabric| {
            let steps = steps.to_vec();
            thread::spawn(move || {
                let config = tiny_config();
                let weights = tiny_weights(SEED, &config);
                let mut engine = DecoderEngine::new(
                    &config,
                    &weights,
                    Arc::new(fabric),
                    EngineOptions::default(),
                )
                .unwrap();

                steps
                    .iter()
                    .enumerate()
                    .map(|(step, (ids, dims))| {
                        match engine.forward(0, ids, *dims, step).unwrap() {
                            ForwardOutput::Logits {
                                logits,
                                shard_offset,
                                shard_size,
                            } => (to_vec(&logits), shard_offset, shard_size),
                            ForwardOutput::Forwarded => panic!("tp-only world never forwards"),
                        }
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let per_rank: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let n_steps = steps.len();
    (0..n_steps)
        .map(|s| {
            let rows = per_rank[0][s].0.len() / per_rank[0][s].2;
            let mut full = vec![0f32; rows * vocab];
            for rank_out in &per_rank {
                let (shard, offset, size) = &rank_out[s];
                for r in 0..rows {
                    full[r * vocab + offset..r * vocab + offset + size]
                        .copy_from_slice(&shard[r * size..(r + 1) * size]);
                }
            }
            full
        })
        .collect()
}

#[test]
fn tp2_matches_single_rank() {
    let steps = vec![
        (
            vec![3u32, 14, 15, 9],
            ForwardDims {
                user_side_bs: 1,
                beam_size: 1,
                seq_len: 4,
            },
        ),
        (
            vec![26u32],
            ForwardDims {
                user_side_bs: 1,
                beam_size: 1,
                seq_len: 1,
            },
        ),
        (
            vec![5u32],
            ForwardDims {
                user_side_bs: 1,
                beam_size: 1,
                seq_len: 1,
            },
        ),
    ];

    let reference = reference_logits(&steps);
    let sharded = tensor_parallel_logits(2, &steps);
    for (step, (a, b)) in reference.iter().zip(&sharded).enumerate() {
        assert_close(a, b, 2e-3, &format!("step {step} logits"));
    }
}

#[test]
fn tp2_matches_single_rank_with_batch() {
    let steps = vec![
        (
            (0..8u32).collect::<Vec<_>>(),
            ForwardDims {
                user_side_bs: 2,
                beam_size: 1,
                seq_len: 4,
            },
        ),
        (
            vec![1u32, 2],
            ForwardDims {
                user_side_bs: 2,
                beam_size: 1,
                seq_len: 1,
            },
        ),
    ];

    let reference = reference_logits(&steps);
    let sharded = tensor_parallel_logits(2, &steps);
    for (step, (a, b)) in reference.iter().zip(&sharded).enumerate() {
        assert_close(a, b, 2e-3, &format!("step {step} logits"));
    }
}

#[test]
fn vocab_shards_tile_without_overlap() {
    let fabrics = ThreadFabric::connect(ParallelConfig::tensor_parallel(2));
    let handles: Vec<_> = fabrics
        .into_iter()
        .map(|fabric| {
            thread::spawn(move || {
                let config = tiny_config();
                let weights = tiny_weights(SEED, &config);
                let mut engine = DecoderEngine::new(
                    &config,
                    &weights,
                    Arc::new(fabric),
                    EngineOptions::default(),
                )
                .unwrap();
                let dims = ForwardDims {
                    user_side_bs: 1,
                    beam_size: 1,
                    seq_len: 2,
                };
                match engine.forward(0, &[1, 2], dims, 0).unwrap() {
                    ForwardOutput::Logits {
                        shard_offset,
                        shard_size,
                        ..
                    } => (shard_offset, shard_size),
                    ForwardOutput::Forwarded => unreachable!(),
                }
            })
        })
        .collect();

    let mut shards: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![(0, 16), (16, 16)]);
}
