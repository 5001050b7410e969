//! Per-stage KV cache lifecycle: allocation and growth, beam expansion,
//! shared-prefix seeding, and beam-search reordering.

use candle_core::{DType, Device, Tensor};
use tracing::info;

use super::cache_tensor::KvCacheTensor;
use super::error::{CacheError, Result};

/// Owns the key and value caches for every layer held by this stage.
///
/// Slot axis conventions: one slot per live sequence, `width` slots total.
/// During a beam run the first step only populates slots `0..user_bs`;
/// `expand_cache` then replicates each of those across its beam span.
pub struct KvCacheManager {
    layers: usize,
    kv_heads: usize,
    head_dim: usize,
    dtype: DType,
    device: Device,

    keys: Vec<KvCacheTensor>,
    values: Vec<KvCacheTensor>,

    prefix_keys: Vec<KvCacheTensor>,
    prefix_values: Vec<KvCacheTensor>,
}

impl KvCacheManager {
    /// Configure an empty manager; backing storage materializes on the
    /// first `resize`, which always carries the full position budget.
    pub fn configure(
        layers: usize,
        kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            layers,
            kv_heads,
            head_dim,
            dtype,
            device,
            keys: Vec::new(),
            values: Vec::new(),
            prefix_keys: Vec::new(),
            prefix_values: Vec::new(),
        }
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.layers {
            return Err(CacheError::LayerOutOfRange {
                layer,
                layers: self.layers,
            });
        }
        Ok(())
    }

    /// Ensure every layer's cache covers at least `width` slots and
    /// `max_positions` positions. Growth preserves resident entries; shrink
    /// requests are no-ops. Returns whether a reallocation happened.
    pub fn resize(&mut self, width: usize, max_positions: usize) -> Result<bool> {
        let (need_alloc, old_width, old_positions) = match self.keys.first() {
            None => (true, 0, 0),
            Some(k) => (
                k.width() < width || k.max_positions() < max_positions,
                k.width(),
                k.max_positions(),
            ),
        };
        if !need_alloc {
            return Ok(false);
        }

        let new_width = width.max(old_width);
        let new_positions = max_positions.max(old_positions);
        info!(
            layers = self.layers,
            width = new_width,
            max_positions = new_positions,
            "allocating kv cache"
        );

        let mut keys = Vec::with_capacity(self.layers);
        let mut values = Vec::with_capacity(self.layers);
        for layer in 0..self.layers {
            let k = self.grown(self.keys.get(layer), new_width, new_positions)?;
            let v = self.grown(self.values.get(layer), new_width, new_positions)?;
            keys.push(k);
            values.push(v);
        }
        self.keys = keys;
        self.values = values;
        Ok(true)
    }

    fn grown(
        &self,
        old: Option<&KvCacheTensor>,
        width: usize,
        max_positions: usize,
    ) -> Result<KvCacheTensor> {
        let fresh = KvCacheTensor::new(
            width,
            max_positions,
            self.kv_heads,
            self.head_dim,
            self.dtype,
            &self.device,
        )?;
        if let Some(old) = old {
            if old.layout_matches(self.kv_heads, self.head_dim, self.dtype) {
                let carried = old.read(0, old.width(), old.max_positions())?;
                fresh.write(&carried, 0, 0)?;
            }
        }
        Ok(fresh)
    }

    pub fn key(&self, layer: usize) -> Result<&KvCacheTensor> {
        self.check_layer(layer)?;
        Ok(&self.keys[layer])
    }

    pub fn value(&self, layer: usize) -> Result<&KvCacheTensor> {
        self.check_layer(layer)?;
        Ok(&self.values[layer])
    }

    /// Allocate per-layer prefix caches sized for one shared sequence of
    /// `prefix_len` tokens. Any previously resident prefix is discarded.
    pub fn resize_prefix(&mut self, prefix_len: usize) -> Result<()> {
        let mut prefix_keys = Vec::with_capacity(self.layers);
        let mut prefix_values = Vec::with_capacity(self.layers);
        for _ in 0..self.layers {
            prefix_keys.push(KvCacheTensor::new(
                1,
                prefix_len,
                self.kv_heads,
                self.head_dim,
                self.dtype,
                &self.device,
            )?);
            prefix_values.push(KvCacheTensor::new(
                1,
                prefix_len,
                self.kv_heads,
                self.head_dim,
                self.dtype,
                &self.device,
            )?);
        }
        self.prefix_keys = prefix_keys;
        self.prefix_values = prefix_values;
        Ok(())
    }

    /// Drop the resident shared prefix.
    pub fn clear_prefix(&mut self) {
        self.prefix_keys.clear();
        self.prefix_values.clear();
    }

    pub fn has_prefix(&self) -> bool {
        !self.prefix_keys.is_empty()
    }

    pub fn prefix_key(&self, layer: usize) -> Result<&KvCacheTensor> {
        self.check_layer(layer)?;
        self.prefix_keys.get(layer).ok_or(CacheError::PrefixNotSeeded)
    }

    pub fn prefix_value(&self, layer: usize) -> Result<&KvCacheTensor> {
        self.check_layer(layer)?;
        self.prefix_values.get(layer).ok_or(CacheError::PrefixNotSeeded)
    }

    /// Copy the shared prefix entries into the first `user_bs` slots of one
    /// layer's main cache, so per-sequence appends can start at position
    /// `prefix_len`.
    pub fn expand_prefix_cache(
        &self,
        layer: usize,
        user_bs: usize,
        prefix_len: usize,
    ) -> Result<()> {
        let pk = self.prefix_key(layer)?;
        let pv = self.prefix_value(layer)?;
        let shape = (user_bs, prefix_len, self.kv_heads, self.head_dim);

        let k = pk.read(0, 1, prefix_len)?.expand(shape)?.contiguous()?;
        self.keys[layer].write(&k, 0, 0)?;
        let v = pv.read(0, 1, prefix_len)?.expand(shape)?.contiguous()?;
        self.values[layer].write(&v, 0, 0)?;
        Ok(())
    }

    /// Replicate each prompt's cache entries across its beam span: slot `b`
    /// becomes slots `[b * beam, (b + 1) * beam)`.
    ///
    /// Iterates prompts highest-first. The destination span of prompt `b`
    /// overlaps the source slots of prompts above it, so each source must be
    /// read out before any higher-numbered destination is written — going
    /// downward, slot `b` itself is only overwritten after its contents have
    /// been captured.
    pub fn expand_cache(
        &self,
        layer: usize,
        user_bs: usize,
        beam: usize,
        seq_len: usize,
    ) -> Result<()> {
        self.check_layer(layer)?;
        if beam == 1 {
            return Ok(());
        }
        for b in (0..user_bs).rev() {
            let shape = (beam, seq_len, self.kv_heads, self.head_dim);
            let k = self.keys[layer]
                .read(b, 1, seq_len)?
                .expand(shape)?
                .contiguous()?;
            self.keys[layer].write(&k, b * beam, 0)?;
            let v = self.values[layer]
                .read(b, 1, seq_len)?
                .expand(shape)?
                .contiguous()?;
            self.values[layer].write(&v, b * beam, 0)?;
        }
        Ok(())
    }

    /// Rearrange the first `size` slots of every layer so that new slot `i`
    /// holds old slot `indices[i]`. Indices may repeat (a surviving beam can
    /// be selected more than once); only the first `acc_seq_len` positions
    /// carry live data and only they are copied.
    pub fn reorder_cache(
        &self,
        indices: &[usize],
        size: usize,
        acc_seq_len: usize,
    ) -> Result<()> {
        if indices.len() != size {
            return Err(CacheError::InvalidReorderIndex {
                index: indices.len(),
                size,
            });
        }
        for &i in indices {
            if i >= size {
                return Err(CacheError::InvalidReorderIndex { index: i, size });
            }
        }
        // Scratch copy: gather resolves every source before any write lands,
        // so overlapping and repeated indices are safe.
        for layer in 0..self.layers {
            let k = self.keys[layer].gather_slots(indices)?;
            let k: Tensor = k.narrow(1, 0, acc_seq_len)?.contiguous()?;
            self.keys[layer].write(&k, 0, 0)?;
            let v = self.values[layer].gather_slots(indices)?;
            let v: Tensor = v.narrow(1, 0, acc_seq_len)?.contiguous()?;
            self.values[layer].write(&v, 0, 0)?;
        }
        Ok(())
    }
}
