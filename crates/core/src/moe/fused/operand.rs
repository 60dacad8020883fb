//! Strided kernel operands.
//!
//! Kernels address their inputs purely through element strides so that
//! non-contiguous candle views (transposed weights, narrowed activations)
//! are consumed in place.

use candle_core::{Layout, Storage, WithDType};
use half::{bf16, f16};

use crate::error::{MoeError, Result};

/// Storage element of kernel operands. Loads widen to the `f32`
/// accumulator, stores narrow back.
pub trait KernelElement: WithDType {
    fn to_acc(self) -> f32;
    fn from_acc(v: f32) -> Self;
}

impl KernelElement for f32 {
    #[inline]
    fn to_acc(self) -> f32 {
        self
    }

    #[inline]
    fn from_acc(v: f32) -> Self {
        v
    }
}

impl KernelElement for f16 {
    #[inline]
    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_acc(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl KernelElement for bf16 {
    #[inline]
    fn to_acc(self) -> f32 {
        self.to_f32()
    }

    #[inline]
    fn from_acc(v: f32) -> Self {
        bf16::from_f32(v)
    }
}

/// Borrow the host slice behind a CPU tensor's storage.
pub(crate) fn cpu_slice<T: KernelElement>(storage: &Storage) -> Result<&[T]> {
    match storage {
        Storage::Cpu(cpu) => Ok(T::cpu_storage_as_slice(cpu)?),
        _ => Err(MoeError::config(
            "kernel operands must be staged on the CPU backend",
        )),
    }
}

/// Last element index touched by a strided view, or `None` on overflow.
fn last_index(offset: usize, dims: &[usize], strides: &[usize]) -> Option<usize> {
    dims.iter()
        .zip(strides)
        .try_fold(offset, |acc, (&d, &s)| acc.checked_add((d - 1).checked_mul(s)?))
}

fn check_extent(
    what: &'static str,
    len: usize,
    offset: usize,
    dims: &[usize],
    strides: &[usize],
) -> Result<()> {
    if dims.contains(&0) {
        return Ok(());
    }
    match last_index(offset, dims, strides) {
        Some(last) if last < len => Ok(()),
        _ => Err(MoeError::shape(what, &[len], &[offset, dims.iter().product()])),
    }
}

/// Read-only 2D strided view.
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a, T> {
    data: &'a [T],
    offset: usize,
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a, T: Copy> MatrixView<'a, T> {
    /// View `rows x cols` elements of `data` starting at `offset`.
    pub fn new(
        data: &'a [T],
        offset: usize,
        (rows, cols): (usize, usize),
        (row_stride, col_stride): (usize, usize),
    ) -> Result<Self> {
        check_extent(
            "matrix view",
            data.len(),
            offset,
            &[rows, cols],
            &[row_stride, col_stride],
        )?;
        Ok(Self {
            data,
            offset,
            rows,
            cols,
            row_stride,
            col_stride,
        })
    }

    /// Row-major contiguous view.
    pub fn contiguous(data: &'a [T], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, 0, (rows, cols), (cols, 1))
    }

    /// View over a rank-2 candle layout.
    pub fn from_layout(data: &'a [T], layout: &Layout) -> Result<Self> {
        match (layout.dims(), layout.stride()) {
            (&[rows, cols], &[rs, cs]) => {
                Self::new(data, layout.start_offset(), (rows, cols), (rs, cs))
            }
            (dims, _) => Err(MoeError::shape("matrix operand rank", &[2], &[dims.len()])),
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[self.offset + row * self.row_stride + col * self.col_stride]
    }
}

/// Read-only strided view of stacked expert weights, shape `(E, N, K)`.
#[derive(Debug, Clone, Copy)]
pub struct ExpertWeights<'a, T> {
    data: &'a [T],
    offset: usize,
    dims: (usize, usize, usize),
    strides: (usize, usize, usize),
}

impl<'a, T: Copy> ExpertWeights<'a, T> {
    pub fn new(
        data: &'a [T],
        offset: usize,
        dims: (usize, usize, usize),
        strides: (usize, usize, usize),
    ) -> Result<Self> {
        check_extent(
            "expert weights",
            data.len(),
            offset,
            &[dims.0, dims.1, dims.2],
            &[strides.0, strides.1, strides.2],
        )?;
        Ok(Self {
            data,
            offset,
            dims,
            strides,
        })
    }

    pub fn contiguous(data: &'a [T], experts: usize, n: usize, k: usize) -> Result<Self> {
        Self::new(data, 0, (experts, n, k), (n * k, k, 1))
    }

    /// View over a rank-3 candle layout.
    pub fn from_layout(data: &'a [T], layout: &Layout) -> Result<Self> {
        match (layout.dims(), layout.stride()) {
            (&[e, n, k], &[se, sn, sk]) => {
                Self::new(data, layout.start_offset(), (e, n, k), (se, sn, sk))
            }
            (dims, _) => Err(MoeError::shape("expert weight rank", &[3], &[dims.len()])),
        }
    }

    #[inline]
    pub fn num_experts(&self) -> usize {
        self.dims.0
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.dims.1
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.dims.2
    }

    /// Base element index of `expert`. Index math is `usize`, so large
    /// expert counts times the expert stride do not wrap.
    #[inline]
    pub fn expert_base(&self, expert: usize) -> usize {
        self.offset + expert * self.strides.0
    }

    #[inline]
    pub fn get(&self, expert_base: usize, n: usize, k: usize) -> T {
        self.data[expert_base + n * self.strides.1 + k * self.strides.2]
    }
}
