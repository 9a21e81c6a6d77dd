//! Minicoin CLI Application
//!
//! A command-line interface for running coin nodes.

use clap::{Parser, Subcommand};
use minicoin::cli::{self, SimulateOptions, TransferSpec};
use minicoin::config::{GenesisConfig, NodeConfig, DEFAULT_REQUIRED_ZERO_BITS};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "minicoin")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A minimal peer-to-peer coin node in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run nodes over an in-memory network and carry out transfers
    Simulate {
        /// Number of nodes (named n1, n2, ...)
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Transfer as from:to:value (repeatable)
        #[arg(short, long = "transfer", value_parser = cli::parse_transfer)]
        transfers: Vec<TransferSpec>,

        /// Node settings template (JSON); names are assigned per node
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Proof-of-work target in leading zero bits
        #[arg(short, long)]
        bits: Option<u32>,

        /// Genesis stake granted to n1
        #[arg(short, long, default_value = "10")]
        stake: u64,

        /// Seconds to wait for each confirmation
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Benchmark the confirmation miner
    Mine {
        /// Number of leading zero bits
        #[arg(short, long, default_value_t = DEFAULT_REQUIRED_ZERO_BITS)]
        bits: u32,

        /// Worker threads
        #[arg(short, long, default_value = "1")]
        workers: usize,
    },

    /// Write a default node configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Node name
        #[arg(short, long, default_value = "n1")]
        name: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            nodes,
            transfers,
            config,
            bits,
            stake,
            timeout,
            json,
        } => {
            let mut template = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig {
                    genesis: GenesisConfig {
                        beneficiary: "n1".to_string(),
                        stake,
                    },
                    ..NodeConfig::default()
                },
            };
            if let Some(bits) = bits {
                template.required_zero_bits = bits;
                template.max_required_zero_bits = template.max_required_zero_bits.max(bits);
            }
            let transfers = if transfers.is_empty() {
                vec![TransferSpec {
                    from: "n1".to_string(),
                    to: "n2".to_string(),
                    value: 3,
                }]
            } else {
                transfers
            };

            let options = SimulateOptions {
                template,
                nodes,
                transfers,
                timeout: Duration::from_secs(timeout),
                json,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_simulate(options))?;
        }

        Commands::Mine { bits, workers } => {
            cli::cmd_mine(bits, workers)?;
        }

        Commands::Config { output, name } => {
            cli::cmd_config(&output, &name)?;
        }
    }

    Ok(())
}
