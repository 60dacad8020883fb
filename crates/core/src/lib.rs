pub mod config;
pub mod error;
pub mod moe;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{AutotuneMode, FusedMoeConfig};
pub use error::{MoeError, Result};
pub use moe::{fused_moe, FusedMoe, FusedMoeParams};
