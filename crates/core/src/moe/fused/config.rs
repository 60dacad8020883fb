//! Tile configuration for the fused projection kernel.

use serde::{Deserialize, Serialize};

/// Smallest padded row count used for grid sizing and autotune keys.
pub const MIN_PADDED_ROWS: usize = 64;

/// Tile shape and launch parameters for one projection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileConfig {
    /// Block size for M dimension (segment rows).
    pub block_m: usize,
    /// Block size for N dimension (output features).
    pub block_n: usize,
    /// Block size for K dimension (contraction).
    pub block_k: usize,
    /// Number of row-tiles sharing one column traversal (weight tile reuse).
    pub group_size_m: usize,
    /// Warps per unit on SIMT backends. Recorded for parity with GPU configs.
    pub num_warps: usize,
    /// Software pipeline depth on SIMT backends.
    pub num_stages: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_m: 128,
            block_n: 128,
            block_k: 32,
            group_size_m: 1,
            num_warps: 4,
            num_stages: 4,
        }
    }
}

impl TileConfig {
    /// Configuration favouring wide outputs.
    pub fn wide() -> Self {
        Self {
            block_m: 64,
            block_n: 256,
            block_k: 32,
            ..Self::default()
        }
    }

    /// Configuration favouring deep contractions.
    pub fn deep() -> Self {
        Self {
            block_m: 64,
            block_n: 128,
            block_k: 64,
            ..Self::default()
        }
    }

    /// Candidate set searched by the autotuner.
    pub fn candidates() -> Vec<Self> {
        vec![Self::default(), Self::wide(), Self::deep()]
    }

    /// Band-grouped variant of this config.
    pub fn with_group_size_m(mut self, group_size_m: usize) -> Self {
        self.group_size_m = group_size_m;
        self
    }

    /// Every block dimension and the group size must be non-zero.
    pub fn is_valid(&self) -> bool {
        self.block_m > 0 && self.block_n > 0 && self.block_k > 0 && self.group_size_m > 0
    }
}

/// Problem signature used to cache autotune decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AutotuneKey {
    /// Output width of the projection.
    pub n: usize,
    /// Contraction width of the projection.
    pub k: usize,
    /// Padded row count (see [`padded_rows`]).
    pub padded_m: usize,
}

/// Round a row count up to the next power of two, with a floor of
/// [`MIN_PADDED_ROWS`]. Bounds the number of distinct autotune keys.
pub fn padded_rows(rows: usize) -> usize {
    rows.max(1).next_power_of_two().max(MIN_PADDED_ROWS)
}
