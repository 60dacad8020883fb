//! Synthetic-problem benchmark of the fused forward pass.

use std::time::Instant;

use anyhow::{bail, ensure, Context};
use candle_core::{DType, Tensor};
use fused_moe_core::moe::fused::{AutotuneKey, TileConfig};
use fused_moe_core::testing::MoeProblem;
use fused_moe_core::{AutotuneMode, FusedMoe, FusedMoeConfig, FusedMoeParams};
use serde::Serialize;

use crate::config::CliConfig;

/// Fully resolved benchmark settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchOptions {
    pub tokens: usize,
    pub hidden: usize,
    pub ffn: usize,
    pub experts: usize,
    pub top_k: usize,
    pub dtype: String,
    pub shards: usize,
    pub iters: usize,
    pub seed: u64,
    pub static_tile: bool,
    pub warmup: usize,
    pub rep: usize,
    /// Compare the sharded result against a single all-local call.
    pub verify: bool,
}

impl Default for BenchOptions {
    fn default() -> Self {
        let engine = FusedMoeConfig::default();
        Self {
            tokens: 64,
            hidden: 256,
            ffn: 512,
            experts: 8,
            top_k: 2,
            dtype: "f32".to_string(),
            shards: 1,
            iters: 10,
            seed: 0,
            static_tile: false,
            warmup: engine.warmup,
            rep: engine.rep,
            verify: false,
        }
    }
}

impl BenchOptions {
    /// Defaults overridden by every field set in `config`.
    pub fn from_config(config: &CliConfig) -> Self {
        let d = Self::default();
        Self {
            tokens: config.tokens.unwrap_or(d.tokens),
            hidden: config.hidden.unwrap_or(d.hidden),
            ffn: config.ffn.unwrap_or(d.ffn),
            experts: config.experts.unwrap_or(d.experts),
            top_k: config.top_k.unwrap_or(d.top_k),
            dtype: config.dtype.clone().unwrap_or(d.dtype),
            shards: config.shards.unwrap_or(d.shards),
            iters: config.iters.unwrap_or(d.iters),
            seed: config.seed.unwrap_or(d.seed),
            static_tile: config.static_tile.unwrap_or(d.static_tile),
            warmup: config.warmup.unwrap_or(d.warmup),
            rep: config.rep.unwrap_or(d.rep),
            verify: d.verify,
        }
    }

    fn engine_config(&self) -> FusedMoeConfig {
        FusedMoeConfig {
            autotune: if self.static_tile {
                AutotuneMode::Static
            } else {
                AutotuneMode::Benchmark
            },
            warmup: self.warmup,
            rep: self.rep,
            ..FusedMoeConfig::from_env()
        }
    }
}

pub fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    match name.trim().to_lowercase().as_str() {
        "f32" | "fp32" | "float32" => Ok(DType::F32),
        "f16" | "fp16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => bail!("unsupported dtype '{other}' (expected f32, f16 or bf16)"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutotuneEntry {
    pub key: AutotuneKey,
    pub tile: TileConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub options: BenchOptions,
    /// Per-iteration wall time of all shards together.
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Largest elementwise difference between the sharded and the
    /// all-local result, when verification was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_abs_diff: Option<f32>,
    pub autotune: Vec<AutotuneEntry>,
}

fn synthetic_problem(opts: &BenchOptions, dtype: DType) -> anyhow::Result<MoeProblem> {
    let problem = MoeProblem::random(
        opts.seed,
        opts.tokens,
        opts.hidden,
        opts.ffn,
        opts.experts,
        opts.top_k,
    )?;
    Ok(problem.to_dtype(dtype)?)
}

/// One full forward: every shard as its own call, outputs summed.
fn run_sharded(engine: &FusedMoe, p: &MoeProblem, opts: &BenchOptions) -> anyhow::Result<Tensor> {
    let params = FusedMoeParams::new(opts.top_k).with_renormalize(true);
    if opts.shards == 1 {
        return Ok(engine.forward(&p.hidden, &p.w1, &p.w2, &p.topk_weights, &p.topk_ids, &params)?);
    }

    let per_shard = opts.experts / opts.shards;
    let mut total: Option<Tensor> = None;
    for shard in 0..opts.shards {
        let offset = shard * per_shard;
        let (w1, w2) = p.shard(offset, per_shard)?;
        let out = engine.forward(
            &p.hidden,
            &w1,
            &w2,
            &p.topk_weights,
            &p.topk_ids,
            &params.with_shard(offset, opts.experts),
        )?;
        total = Some(match total {
            Some(acc) => acc.add(&out)?,
            None => out,
        });
    }
    total.context("no shards ran")
}

pub fn run(opts: &BenchOptions) -> anyhow::Result<BenchReport> {
    ensure!(opts.iters > 0, "iters must be at least 1");
    ensure!(opts.shards > 0, "shards must be at least 1");
    ensure!(
        opts.experts % opts.shards == 0,
        "{} experts do not split into {} equal shards",
        opts.experts,
        opts.shards
    );
    ensure!(
        opts.top_k <= opts.experts,
        "top_k {} exceeds {} experts",
        opts.top_k,
        opts.experts
    );

    let dtype = parse_dtype(&opts.dtype)?;
    let problem = synthetic_problem(opts, dtype)?;
    let engine = FusedMoe::new(opts.engine_config())?;

    // First call pays for autotuning; keep it out of the timings.
    let first = run_sharded(&engine, &problem, opts)?;

    let mut times = Vec::with_capacity(opts.iters);
    for iter in 0..opts.iters {
        let start = Instant::now();
        run_sharded(&engine, &problem, opts)?;
        let ms = start.elapsed().as_secs_f64() * 1e3;
        tracing::debug!(iter, ms, "Bench iteration");
        times.push(ms);
    }

    let max_abs_diff = if opts.verify {
        let single = BenchOptions {
            shards: 1,
            ..opts.clone()
        };
        let reference = run_sharded(&engine, &problem, &single)?;
        let diff = first
            .to_dtype(DType::F32)?
            .sub(&reference.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        Some(diff)
    } else {
        None
    };

    let mean_ms = times.iter().sum::<f64>() / times.len() as f64;
    let min_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = times.iter().copied().fold(0.0, f64::max);
    tracing::info!(mean_ms, min_ms, max_ms, "Benchmark finished");

    Ok(BenchReport {
        options: opts.clone(),
        mean_ms,
        min_ms,
        max_ms,
        max_abs_diff,
        autotune: engine
            .autotuner()
            .snapshot()
            .into_iter()
            .map(|(key, tile)| AutotuneEntry { key, tile })
            .collect(),
    })
}
