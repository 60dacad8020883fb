//! Mixture of Experts (MoE) module.
//!
//! Routing (choosing experts and gating weights per token) happens upstream;
//! this module consumes its output and runs the expert feed-forward.
//!
//! ## Submodules
//!
//! - [`fused`]: grouped dispatch and the fused two-pass projection engine

pub mod fused;

pub use fused::{
    fused_moe, Autotuner, FusedMoe, FusedMoeParams, GatedActivation, SiluAndMul, TileConfig,
};
