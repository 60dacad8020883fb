//! Error types for the fused MoE engine.

use candle_core::DType;
use thiserror::Error;

/// Errors surfaced by the fused MoE entry points.
///
/// Every variant except [`MoeError::Tensor`] is raised during argument
/// validation, before any projection is launched.
#[derive(Error, Debug)]
pub enum MoeError {
    /// Inconsistent expert counts, shard bounds, routing ids or `top_k`.
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    /// An operand's shape does not line up with the others.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Intermediate buffer allocation failed.
    #[error("failed to allocate {bytes} bytes for {what}")]
    ResourceExhausted { what: &'static str, bytes: usize },

    /// Storage precision the kernels are not instantiated for.
    #[error("unsupported dtype {0:?}: expected f32, f16 or bf16")]
    UnsupportedDType(DType),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl MoeError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MoeError>;
