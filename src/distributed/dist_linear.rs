//! Output projection sharded across the world along the vocabulary axis.
//!
//! Each rank owns a contiguous row slice of the `[vocab, hidden]` weight and
//! produces only its slice of the logits; the caller reports the slice's
//! offset and width instead of gathering. When the vocabulary does not divide
//! evenly the remainder rows go to the lowest ranks, one each.

use candle_core::Tensor;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DistLinear {
    weight: Tensor,
    offset: usize,
    shard_size: usize,
    vocab_size: usize,
    hidden_size: usize,
}

impl DistLinear {
    /// Shard `full_weight` (`[vocab, hidden]`) for `rank` of `world` ranks.
    pub fn new(full_weight: &Tensor, rank: usize, world: usize) -> Result<Self> {
        let (vocab_size, hidden_size) = full_weight.dims2()?;
        let (offset, shard_size) = Self::split(vocab_size, rank, world);
        let weight = full_weight.narrow(0, offset, shard_size)?.contiguous()?;
        Ok(Self {
            weight,
            offset,
            shard_size,
            vocab_size,
            hidden_size,
        })
    }

    fn split(vocab: usize, rank: usize, world: usize) -> (usize, usize) {
        let base = vocab / world;
        let rem = vocab % world;
        let size = base + usize::from(rank < rem);
        let offset = rank * base + rank.min(rem);
        (offset, size)
    }

    /// `[rows, hidden] -> [rows, shard]` slice of the logits.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.matmul(&self.weight.t()?)?)
    }

    /// First vocabulary index covered by this rank's shard.
    pub fn split_offset(&self) -> usize {
        self.offset
    }

    /// Number of vocabulary entries in this rank's shard.
    pub fn split_size(&self) -> usize {
        self.shard_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn uneven_vocab_gives_remainder_to_low_ranks() {
        // vocab 10 over 3 ranks: 4 + 3 + 3
        assert_eq!(DistLinear::split(10, 0, 3), (0, 4));
        assert_eq!(DistLinear::split(10, 1, 3), (4, 3));
        assert_eq!(DistLinear::split(10, 2, 3), (7, 3));
    }

    #[test]
    fn shards_tile_the_vocabulary() {
        for world in 1..=5 {
            let mut next = 0;
            for rank in 0..world {
                let (offset, size) = DistLinear::split(11, rank, world);
                assert_eq!(offset, next);
                next += size;
            }
            assert_eq!(next, 11);
        }
    }

    #[test]
    fn sharded_forward_matches_full_projection() {
        let dev = Device::Cpu;
        let vocab = 7;
        let hidden = 4;
        let w: Vec<f32> = (0..vocab * hidden).map(|i| i as f32 * 0.1).collect();
        let full = Tensor::from_vec(w, (vocab, hidden), &dev).unwrap();
        let x = Tensor::from_vec(vec![1f32, -1.0, 0.5, 2.0], (1, hidden), &dev).unwrap();

        let reference = x.matmul(&full.t().unwrap()).unwrap();
        let reference = reference.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let mut gathered = vec![0f32; vocab];
        for rank in 0..3 {
            let shard = DistLinear::new(&full, rank, 3).unwrap();
            let out = shard.forward(&x).unwrap();
            let out = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(out.len(), shard.split_size());
            gathered[shard.split_offset()..shard.split_offset() + shard.split_size()]
                .copy_from_slice(&out);
        }
        for (a, b) in gathered.iter().zip(&reference) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn single_rank_covers_full_vocab() {
        let dev = Device::Cpu;
        let full = Tensor::zeros((6, 2), DType::F32, &dev).unwrap();
        let shard = DistLinear::new(&full, 0, 1).unwrap();
        assert_eq!(shard.split_offset(), 0);
        assert_eq!(shard.split_size(), 6);
    }
}
