//! Shared test utilities for fused-moe-core.
//!
//! Deterministic random problems and a naive dense oracle for checking the
//! fused path numerically. The CLI bench builds its problems here too.

mod fixtures;
mod reference;

pub use fixtures::MoeProblem;
pub use reference::reference_moe_forward;
