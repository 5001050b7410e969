use candle_core::{DType, Device, Tensor};

use super::error::{CacheError, Result};

/// Owns the pre-allocated key (or value) tensor for one layer's cache.
/// Performs slot-level read/write via scatter_set and narrow.
///
/// Cache layout: [width, max_positions, kv_heads, head_dim], where `width` is
/// one slot per live sequence. The layout reshapes to
/// [width * max_positions, kv_heads, head_dim] as a zero-copy view, which is
/// what scatter and gather operate on.
pub struct KvCacheTensor {
    data: Tensor,
    width: usize,
    max_positions: usize,
    kv_heads: usize,
    head_dim: usize,
    dtype: DType,
    device: Device,
}

impl KvCacheTensor {
    /// Pre-allocate a zero-filled cache tensor.
    pub fn new(
        width: usize,
        max_positions: usize,
        kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let data = Tensor::zeros((width, max_positions, kv_heads, head_dim), dtype, device)?;
        Ok(Self {
            data,
            width,
            max_positions,
            kv_heads,
            head_dim,
            dtype,
            device: device.clone(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Raw cache tensor, [width, max_positions, kv_heads, head_dim].
    pub fn raw(&self) -> &Tensor {
        &self.data
    }

    /// Whether a cache with these per-token shapes can reuse this allocation's
    /// contents.
    pub fn layout_matches(&self, kv_heads: usize, head_dim: usize, dtype: DType) -> bool {
        self.kv_heads == kv_heads && self.head_dim == head_dim && self.dtype == dtype
    }

    fn check_slots(&self, slot_offset: usize, slots: usize) -> Result<()> {
        if slot_offset + slots > self.width {
            return Err(CacheError::SlotOutOfRange {
                offset: slot_offset,
                slots,
                width: self.width,
            });
        }
        Ok(())
    }

    /// Write `src` ([slots, len, kv_heads, head_dim]) at `pos_offset` within
    /// each of the `slots` slots starting at `slot_offset`.
    ///
    /// Scatter on a flat [width * max_positions, H, D] view; the row index of
    /// (slot s, position p) is `(slot_offset + s) * max_positions +
    /// pos_offset + p`.
    pub fn write(&self, src: &Tensor, slot_offset: usize, pos_offset: usize) -> Result<()> {
        let (slots, len, heads, head_dim) = src.dims4()?;
        self.check_slots(slot_offset, slots)?;
        if heads != self.kv_heads || head_dim != self.head_dim {
            return Err(CacheError::ShapeMismatch {
                expected: vec![slots, len, self.kv_heads, self.head_dim],
                actual: src.dims().to_vec(),
            });
        }
        if pos_offset + len > self.max_positions {
            return Err(CacheError::PositionBudgetExceeded {
                needed: pos_offset + len,
                budget: self.max_positions,
            });
        }

        let rows = slots * len;
        let flat_shape = (self.width * self.max_positions, self.kv_heads, self.head_dim);
        let flat = self.data.reshape(flat_shape)?;

        let mut idx = Vec::with_capacity(rows);
        for s in 0..slots {
            let base = (slot_offset + s) * self.max_positions + pos_offset;
            for p in 0..len {
                idx.push((base + p) as u32);
            }
        }
        let indices = Tensor::from_vec(idx, (rows,), &self.device)?
            .reshape((rows, 1, 1))?
            .expand((rows, self.kv_heads, self.head_dim))?
            .contiguous()?;

        let src_flat = src
            .reshape((rows, self.kv_heads, self.head_dim))?
            .contiguous()?;
        flat.scatter_set(&indices, &src_flat, 0)?;
        Ok(())
    }

    /// Read the first `len` positions of `slots` slots starting at
    /// `slot_offset`. Returns [slots, len, kv_heads, head_dim].
    pub fn read(&self, slot_offset: usize, slots: usize, len: usize) -> Result<Tensor> {
        self.check_slots(slot_offset, slots)?;
        if len > self.max_positions {
            return Err(CacheError::PositionBudgetExceeded {
                needed: len,
                budget: self.max_positions,
            });
        }
        let out = self
            .data
            .narrow(0, slot_offset, slots)?
            .narrow(1, 0, len)?
            .contiguous()?;
        Ok(out)
    }

    /// Gather whole slots in the order given by `indices`.
    /// Returns [indices.len(), max_positions, kv_heads, head_dim].
    pub fn gather_slots(&self, indices: &[usize]) -> Result<Tensor> {
        for &i in indices {
            self.check_slots(i, 1)?;
        }
        let idx = Tensor::from_vec(
            indices.iter().map(|&i| i as u32).collect::<Vec<_>>(),
            (indices.len(),),
            &self.device,
        )?;
        Ok(self.data.index_select(&idx, 0)?)
    }
}
