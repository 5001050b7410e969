//! KV cache storage and lifecycle for the decode loop.

pub mod cache_tensor;
pub mod error;
pub mod manager;

pub use cache_tensor::KvCacheTensor;
pub use error::{CacheError, Result};
pub use manager::KvCacheManager;

use candle_core::Tensor;

/// Borrowed window over a span of slots in one layer's cache tensor.
///
/// Attention kernels receive a view scoped to the sequences they are
/// processing and address positions relative to it.
pub struct CacheView<'a> {
    cache: &'a KvCacheTensor,
    slot_offset: usize,
    slots: usize,
}

impl<'a> CacheView<'a> {
    pub fn new(cache: &'a KvCacheTensor, slot_offset: usize, slots: usize) -> Self {
        Self {
            cache,
            slot_offset,
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Append `src` ([slots, len, kv_heads, head_dim]) at position `past`.
    pub fn append(&self, src: &Tensor, past: usize) -> Result<()> {
        self.cache.write(src, self.slot_offset, past)
    }

    /// Read the first `len` positions of every slot in the view.
    /// Returns [slots, len, kv_heads, head_dim].
    pub fn read(&self, len: usize) -> Result<Tensor> {
        self.cache.read(self.slot_offset, self.slots, len)
    }
}
