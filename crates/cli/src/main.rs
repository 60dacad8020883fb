use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fused_moe_cli::bench::{self, BenchOptions};
use fused_moe_cli::config::CliConfig;
use fused_moe_cli::logging;

#[derive(Parser)]
#[command(name = "fused-moe", about = "Fused MoE benchmark and tuning tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fused forward pass on a synthetic problem and print a JSON report
    Bench {
        #[command(flatten)]
        problem: ProblemArgs,

        /// Compare the sharded result against a single all-local call
        #[arg(long)]
        verify: bool,

        /// Read defaults from this file instead of the user config
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Inspect or persist defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Merge the given values into the user config file
    Save {
        #[command(flatten)]
        problem: ProblemArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ProblemArgs {
    /// Tokens per forward call
    #[arg(long)]
    tokens: Option<usize>,

    /// Hidden size
    #[arg(long)]
    hidden: Option<usize>,

    /// Expert intermediate size
    #[arg(long)]
    ffn: Option<usize>,

    /// Total number of experts
    #[arg(long)]
    experts: Option<usize>,

    /// Experts per token
    #[arg(long)]
    top_k: Option<usize>,

    /// Storage precision (f32, f16, bf16)
    #[arg(long)]
    dtype: Option<String>,

    /// Split experts into this many equal shards, one call each
    #[arg(long)]
    shards: Option<usize>,

    /// Timed iterations
    #[arg(long)]
    iters: Option<usize>,

    /// Seed for the synthetic problem
    #[arg(long)]
    seed: Option<u64>,

    /// Use the default tile instead of autotuning
    #[arg(long)]
    static_tile: bool,

    /// Untimed autotune runs per candidate
    #[arg(long)]
    warmup: Option<usize>,

    /// Timed autotune runs per candidate
    #[arg(long)]
    rep: Option<usize>,
}

impl ProblemArgs {
    fn to_config(&self) -> CliConfig {
        CliConfig {
            tokens: self.tokens,
            hidden: self.hidden,
            ffn: self.ffn,
            experts: self.experts,
            top_k: self.top_k,
            dtype: self.dtype.clone(),
            shards: self.shards,
            iters: self.iters,
            seed: self.seed,
            static_tile: self.static_tile.then_some(true),
            warmup: self.warmup,
            rep: self.rep,
        }
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Bench {
            problem,
            verify,
            config,
        } => {
            // CLI flags take precedence over the config file
            let mut resolved = match config {
                Some(path) => CliConfig::load_from(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => CliConfig::load(),
            };
            resolved.merge(&problem.to_config());

            let opts = BenchOptions {
                verify,
                ..BenchOptions::from_config(&resolved)
            };
            let report = bench::run(&opts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                if let Some(path) = CliConfig::default_path() {
                    eprintln!("Config file: {}", path.display());
                }
                println!("{}", toml::to_string_pretty(&CliConfig::load())?);
            }
            ConfigAction::Save { problem } => {
                let mut config = CliConfig::load();
                config.merge(&problem.to_config());
                let path = config.save()?;
                eprintln!("Saved config to: {}", path.display());
            }
        },
    }
    Ok(())
}
