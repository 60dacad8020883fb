//! Gated activation applied between the two projections.

use candle_core::{Result, Tensor, D};

/// Activation over the gate/up cache.
pub trait GatedActivation: Send + Sync + std::fmt::Debug {
    /// Map a `(rows, width)` gate/up tensor to `(rows, output_width(width))`.
    fn apply(&self, x: &Tensor) -> Result<Tensor>;

    /// Output width for an input of `width` columns.
    fn output_width(&self, width: usize) -> usize {
        width / 2
    }

    /// Whether a gate/up cache of `width` columns is accepted.
    fn is_valid_width(&self, width: usize) -> bool {
        width % 2 == 0
    }
}

/// SwiGLU: `silu(x[:, :n]) * x[:, n:]` with `n = width / 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SiluAndMul;

impl GatedActivation for SiluAndMul {
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dim(D::Minus1)?;
        if width % 2 != 0 {
            candle_core::bail!("gated activation needs an even width, got {width}");
        }
        let half = width / 2;
        let gate = x.narrow(D::Minus1, 0, half)?;
        let up = x.narrow(D::Minus1, half, half)?;
        candle_nn::ops::silu(&gate)?.mul(&up)
    }
}
