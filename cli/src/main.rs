use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bytefuzz::fuzz::{execute, FuzzConfig};
use bytefuzz::onchain::{api_keys, Chain, OnchainClient};

/// A fuzzing tool for EVM smart contract bytecode
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Open a summary console after the runs
    #[arg(short = 's', long, global = true)]
    session: bool,

    /// Stage-1 iterations per entry
    #[arg(long, default_value_t = 128)]
    epoch: usize,

    /// Stage-2 prefix depth bound
    #[arg(long, default_value_t = 4)]
    depth: usize,

    /// Per-stage deadline in seconds
    #[arg(long, default_value_t = 60)]
    deadline: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuzz contracts found in a directory
    Local {
        /// Folder containing <name>.abi / <name>.bin pairs
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Prepare the creation cache from a block explorer, then fuzz
    Onchain {
        /// Contract address (0x-prefixed)
        #[arg(short, long)]
        address: String,
        /// Chain name as used in keys.toml
        #[arg(short, long, default_value = "eth")]
        chain: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = FuzzConfig {
        epoch1: cli.epoch,
        stage2_depth: cli.depth,
        stage_deadline: std::time::Duration::from_secs(cli.deadline),
        ..FuzzConfig::default()
    };

    let dir = match &cli.command {
        Commands::Local { input } => input.clone(),
        Commands::Onchain { address, chain } => {
            let chain = Chain::from_str(chain)?;
            let keys = api_keys();
            if !keys.contains_key(&chain) {
                bail!("keys.toml provides no key for chain {chain}; cannot run on-chain");
            }
            let client = OnchainClient::new(keys);
            client
                .prepare_cache(chain, address)
                .context("preparing the on-chain creation cache")?
        }
    };

    let report = execute(&dir, &config).context("fuzzing run")?;
    info!(
        attempted = report.attempted,
        failed = report.failed,
        "run complete"
    );

    if cli.session {
        for (name, session) in &report.sessions {
            println!("──────── {name} ────────");
            println!("{session}");
        }
    }

    if report.all_failed() {
        bail!("all targets failed to load or fuzz");
    }
    Ok(())
}
