//! Fused Mixture-of-Experts feed-forward engine.
//!
//! Re-exports [`fused_moe_core`]. The dispatch and kernel pipeline lives in
//! [`moe::fused`].

pub use fused_moe_core::*;
