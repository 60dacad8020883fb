//! Intermediate caches owned by one forward call.

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use super::kernel::TileOutput;
use super::operand::{KernelElement, MatrixView};
use crate::error::{MoeError, Result};

/// Initialization policy for an [`IntermediateBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferInit {
    /// Rows never written must read as zero (sharded execution).
    Zeroed,
    /// Every row will be written exactly once; contents before that are
    /// unspecified. Debug builds poison them with NaN so a missed write
    /// surfaces in the result.
    Uninit,
}

impl BufferInit {
    /// Zero-fill only when some referenced experts live elsewhere.
    pub fn for_shard(all_experts_local: bool) -> Self {
        if all_experts_local {
            Self::Uninit
        } else {
            Self::Zeroed
        }
    }

    fn fill<T: KernelElement>(self) -> T {
        match self {
            Self::Zeroed => T::from_acc(0.0),
            Self::Uninit if cfg!(debug_assertions) => T::from_acc(f32::NAN),
            Self::Uninit => T::from_acc(0.0),
        }
    }
}

/// `(num_tokens, top_k, width)` row-major cache, addressed as
/// `num_tokens * top_k` flat rows.
#[derive(Debug)]
pub struct IntermediateBuffer<T> {
    data: Vec<T>,
    num_tokens: usize,
    top_k: usize,
    width: usize,
}

impl<T: KernelElement> IntermediateBuffer<T> {
    /// Allocate without panicking on exhaustion.
    pub fn allocate(
        what: &'static str,
        num_tokens: usize,
        top_k: usize,
        width: usize,
        init: BufferInit,
    ) -> Result<Self> {
        let len = num_tokens
            .checked_mul(top_k)
            .and_then(|rows| rows.checked_mul(width))
            .ok_or(MoeError::ResourceExhausted {
                what,
                bytes: usize::MAX,
            })?;
        let bytes = len.saturating_mul(std::mem::size_of::<T>());

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| MoeError::ResourceExhausted { what, bytes })?;
        data.resize(len, init.fill::<T>());

        tracing::trace!(
            what,
            num_tokens,
            top_k,
            width,
            bytes,
            ?init,
            "Allocated MoE cache"
        );
        Ok(Self {
            data,
            num_tokens,
            top_k,
            width,
        })
    }

    /// Flat row count (`num_tokens * top_k`).
    pub fn rows(&self) -> usize {
        self.num_tokens * self.top_k
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Dense `(rows, width)` view, for feeding a later pass directly.
    pub fn view(&self) -> Result<MatrixView<'_, T>> {
        MatrixView::contiguous(&self.data, self.rows(), self.width)
    }

    /// Write one finished tile. Rows and columns come from the kernel and
    /// are in range by construction.
    pub(crate) fn store_tile(&mut self, tile: &TileOutput<T>) {
        let cols = tile.num_cols;
        for (i, &row) in tile.rows.iter().enumerate() {
            let dst = row * self.width + tile.col_start;
            self.data[dst..dst + cols].copy_from_slice(&tile.values[i * cols..(i + 1) * cols]);
        }
    }

    /// Sum over the top-k axis with an `f32` accumulator. Returns a
    /// `(num_tokens, width)` buffer (`top_k == 1`).
    pub fn reduce_topk(&self) -> Result<IntermediateBuffer<T>> {
        let mut out = IntermediateBuffer::allocate(
            "moe output",
            self.num_tokens,
            1,
            self.width,
            BufferInit::Zeroed,
        )?;
        let (top_k, width) = (self.top_k, self.width);
        if width == 0 {
            return Ok(out);
        }

        out.data
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(token, row)| {
                let base = token * top_k * width;
                for (j, slot) in row.iter_mut().enumerate() {
                    let acc: f32 = (0..top_k)
                        .map(|s| self.data[base + s * width + j].to_acc())
                        .sum();
                    *slot = T::from_acc(acc);
                }
            });
        Ok(out)
    }

    /// Move into a CPU tensor of shape `(rows, width)`.
    pub fn into_tensor(self) -> Result<Tensor> {
        let rows = self.rows();
        Ok(Tensor::from_vec(self.data, (rows, self.width), &Device::Cpu)?)
    }
}
