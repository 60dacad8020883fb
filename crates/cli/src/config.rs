//! Configuration persistence for the `fused-moe` tool.
//!
//! Settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/fused-moe/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Tokens per forward call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,

    /// Hidden size (input and output width).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<usize>,

    /// Expert intermediate size (half the gate/up width).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffn: Option<usize>,

    /// Total number of experts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experts: Option<usize>,

    /// Experts selected per token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    /// Storage precision (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Number of equal expert shards, each run as its own call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<usize>,

    /// Timed iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iters: Option<usize>,

    /// Seed for the synthetic problem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Use the default tile instead of benchmarking candidates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_tile: Option<bool>,

    /// Untimed autotune runs per candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup: Option<usize>,

    /// Timed autotune runs per candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rep: Option<usize>,
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fused-moe").join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if absent or
    /// unreadable.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.tokens.is_some() {
            self.tokens = other.tokens;
        }
        if other.hidden.is_some() {
            self.hidden = other.hidden;
        }
        if other.ffn.is_some() {
            self.ffn = other.ffn;
        }
        if other.experts.is_some() {
            self.experts = other.experts;
        }
        if other.top_k.is_some() {
            self.top_k = other.top_k;
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.shards.is_some() {
            self.shards = other.shards;
        }
        if other.iters.is_some() {
            self.iters = other.iters;
        }
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.static_tile.is_some() {
            self.static_tile = other.static_tile;
        }
        if other.warmup.is_some() {
            self.warmup = other.warmup;
        }
        if other.rep.is_some() {
            self.rep = other.rep;
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
