use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};
use crate::moe::fused::TileConfig;

/// Default number of permutation positions scanned per step when computing
/// expert segment bounds.
pub const DEFAULT_SEGMENT_BLOCK: usize = 128;

/// How the projection tile configuration is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotuneMode {
    /// Benchmark every candidate once per problem signature and cache the winner.
    #[default]
    Benchmark,
    /// Always use `static_tile`.
    Static,
}

/// Runtime configuration of the fused MoE engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedMoeConfig {
    pub autotune: AutotuneMode,
    /// Untimed runs per candidate before measuring.
    pub warmup: usize,
    /// Timed runs per candidate; the median is compared.
    pub rep: usize,
    /// Tile used in static mode and as the fallback when no candidate ran.
    pub static_tile: TileConfig,
    pub segment_block: usize,
}

impl Default for FusedMoeConfig {
    fn default() -> Self {
        Self {
            autotune: AutotuneMode::Benchmark,
            warmup: 10,
            rep: 25,
            static_tile: TileConfig::default(),
            segment_block: DEFAULT_SEGMENT_BLOCK,
        }
    }
}

impl FusedMoeConfig {
    /// Static-tile configuration, no benchmarking.
    pub fn static_tile(tile: TileConfig) -> Self {
        Self {
            autotune: AutotuneMode::Static,
            static_tile: tile,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MoeError::config(format!("malformed fused MoE config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    ///
    /// - `FUSED_MOE_AUTOTUNE`: `0`/`off`/`false`/`static` or `1`/`on`/`true`/`benchmark`
    /// - `FUSED_MOE_AUTOTUNE_WARMUP`, `FUSED_MOE_AUTOTUNE_REP`: positive integers
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FUSED_MOE_AUTOTUNE") {
            match value.trim().to_lowercase().as_str() {
                "0" | "off" | "false" | "static" => self.autotune = AutotuneMode::Static,
                "1" | "on" | "true" | "benchmark" => self.autotune = AutotuneMode::Benchmark,
                other => {
                    tracing::warn!(value = other, "Unknown FUSED_MOE_AUTOTUNE value, ignoring")
                }
            }
        }
        if let Some(n) = positive_override(&lookup, "FUSED_MOE_AUTOTUNE_WARMUP") {
            self.warmup = n;
        }
        if let Some(n) = positive_override(&lookup, "FUSED_MOE_AUTOTUNE_REP") {
            self.rep = n;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rep == 0 {
            return Err(MoeError::config("autotune rep must be at least 1"));
        }
        if self.segment_block == 0 {
            return Err(MoeError::config("segment_block must be at least 1"));
        }
        if !self.static_tile.is_valid() {
            return Err(MoeError::config(format!(
                "static tile has a zero dimension: {:?}",
                self.static_tile
            )));
        }
        Ok(())
    }
}

fn positive_override<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Expected a positive integer, ignoring");
            None
        }
    }
}
