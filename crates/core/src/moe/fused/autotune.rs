//! Per-problem-signature tile selection.
//!
//! The first call for an [`AutotuneKey`] benchmarks every candidate and
//! caches the fastest; later calls with the same key reuse the choice.
//! Concurrent first calls may both benchmark; the first insert wins so all
//! callers agree afterwards.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::config::{AutotuneKey, TileConfig};
use crate::config::{AutotuneMode, FusedMoeConfig};
use crate::error::Result;

#[derive(Debug)]
pub struct Autotuner {
    mode: AutotuneMode,
    static_tile: TileConfig,
    warmup: usize,
    rep: usize,
    candidates: Vec<TileConfig>,
    cache: RwLock<HashMap<AutotuneKey, TileConfig>>,
}

impl Autotuner {
    pub fn new(config: &FusedMoeConfig) -> Self {
        Self {
            mode: config.autotune,
            static_tile: config.static_tile,
            warmup: config.warmup,
            rep: config.rep.max(1),
            candidates: TileConfig::candidates(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the candidate set. An empty set falls back to the static tile.
    pub fn with_candidates(mut self, candidates: Vec<TileConfig>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Process-wide tuner, configured from the environment on first use.
    pub fn global() -> Arc<Autotuner> {
        static GLOBAL: OnceLock<Arc<Autotuner>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Autotuner::new(&FusedMoeConfig::from_env())))
            .clone()
    }

    pub fn mode(&self) -> AutotuneMode {
        self.mode
    }

    /// Tile for `key`. `bench` runs the projection once with the given tile;
    /// it is only invoked on a cache miss in benchmark mode.
    pub fn select<F>(&self, key: AutotuneKey, mut bench: F) -> Result<TileConfig>
    where
        F: FnMut(&TileConfig) -> Result<()>,
    {
        if self.mode == AutotuneMode::Static {
            return Ok(self.static_tile);
        }
        if let Some(tile) = self.cached(&key) {
            return Ok(tile);
        }

        let mut best: Option<(TileConfig, Duration)> = None;
        for candidate in self.candidates.iter().filter(|c| c.is_valid()) {
            let timing = self.measure(candidate, &mut bench)?;
            tracing::debug!(
                ?key,
                ?candidate,
                median_us = timing.as_micros() as u64,
                "Autotune candidate"
            );
            if best.map_or(true, |(_, t)| timing < t) {
                best = Some((*candidate, timing));
            }
        }
        let Some((winner, timing)) = best else {
            return Ok(self.static_tile);
        };

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let chosen = *cache.entry(key).or_insert(winner);
        drop(cache);

        tracing::info!(
            n = key.n,
            k = key.k,
            padded_m = key.padded_m,
            block_m = chosen.block_m,
            block_n = chosen.block_n,
            block_k = chosen.block_k,
            median_us = timing.as_micros() as u64,
            "Autotune selected tile config"
        );
        Ok(chosen)
    }

    /// Median of `rep` timed runs after `warmup` untimed ones.
    fn measure<F>(&self, tile: &TileConfig, bench: &mut F) -> Result<Duration>
    where
        F: FnMut(&TileConfig) -> Result<()>,
    {
        for _ in 0..self.warmup {
            bench(tile)?;
        }
        let mut samples = Vec::with_capacity(self.rep);
        for _ in 0..self.rep {
            let start = Instant::now();
            bench(tile)?;
            samples.push(start.elapsed());
        }
        samples.sort_unstable();
        Ok(samples[samples.len() / 2])
    }

    pub fn cached(&self, key: &AutotuneKey) -> Option<TileConfig> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Cached decisions, ordered by key.
    pub fn snapshot(&self) -> Vec<(AutotuneKey, TileConfig)> {
        let mut entries: Vec<_> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
