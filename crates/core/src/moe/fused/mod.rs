//! Fused MoE execution: dispatch, tiled projection, two-pass orchestration.
//!
//! This module implements the permute-compute-unpermute pattern without
//! materializing per-expert token copies:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          FusedMoe::forward                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────┐   ┌──────────────────┐  │
//! │  │ SegmentBuilder │──▶│ TileScheduler  │──▶│ compute_tile x N │  │
//! │  │ (sort + scan)  │   │ (grouped grid) │   │ (rayon, no sync) │  │
//! │  └────────────────┘   └────────────────┘   └────────┬─────────┘  │
//! │                                                      │            │
//! │  ┌───────────────────────────────────────────────────▼──────────┐ │
//! │  │   gate/up ─▶ activation ─▶ down (gated, scattered) ─▶ Σ top-k │ │
//! │  └──────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`SegmentBuilder`]: stable dispatch permutation and per-expert segments
//! - [`TileScheduler`]: launch grid and grouped tile ordering
//! - [`launch_projection`]: the masked, blocked projection over the grid
//! - [`FusedMoe`]: buffer policy, both passes and the final reduction
//! - [`Autotuner`]: tile configuration per `(N, K, padded M)` signature
//!
//! ## Write disjointness
//!
//! The dispatch permutation is a bijection on token-slots, so every
//! destination row belongs to exactly one expert segment and every
//! destination element to exactly one tile. Units therefore run without
//! locks or atomics.

mod activation;
mod autotune;
mod buffer;
mod config;
mod forward;
mod kernel;
mod kernel_wrapper;
mod operand;
mod scheduler;
mod segments;

pub use activation::{GatedActivation, SiluAndMul};
pub use autotune::Autotuner;
pub use buffer::{BufferInit, IntermediateBuffer};
pub use config::{padded_rows, AutotuneKey, TileConfig, MIN_PADDED_ROWS};
pub use forward::{fused_moe, renormalize_topk, FusedMoe, FusedMoeParams};
pub use kernel::{ProjectionOperands, ProjectionPass, TileOutput};
pub use kernel_wrapper::{launch_projection, LaunchStats};
pub use operand::{ExpertWeights, KernelElement, MatrixView};
pub use scheduler::{TileScheduler, TileUnit};
pub use segments::{DispatchPlan, ExpertSegments, SegmentBuilder};
