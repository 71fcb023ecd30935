//! warp-pool CLI - run and exercise distributed memory pool nodes

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use warp_config::PoolConfig;
use warp_telemetry::{init_logging, LogLevel};

mod commands;

#[derive(Parser)]
#[command(name = "warp-pool")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML); `WARP_POOL_*` variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a networked pool node
    Serve {
        /// Chunk server bind address (defaults to node.listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
        /// Seconds between status lines
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },
    /// Time an allocate/write/read/free cycle on a single node
    Bench {
        /// Tensor size (e.g. 64M, 1G)
        #[arg(long, default_value = "64M")]
        size: String,
        /// Number of cycles
        #[arg(short, long, default_value = "3")]
        iterations: u32,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stream model layers through an in-memory cluster
    Simulate {
        /// Number of layers
        #[arg(long, default_value = "12")]
        layers: usize,
        /// Size of each layer (e.g. 8M)
        #[arg(long, default_value = "8M")]
        layer_size: String,
        /// Layers the local node can hold
        #[arg(long, default_value = "4")]
        resident: usize,
        /// Number of in-memory peers
        #[arg(long, default_value = "2")]
        peers: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
        /// Directory to write the script into (prints to stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return commands::completions::execute(*shell, output.as_deref());
    }

    let mut config = PoolConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Serve {
            listen,
            status_interval,
        } => commands::serve::execute(config, listen, status_interval).await,
        Commands::Bench {
            size,
            iterations,
            json,
        } => commands::bench::execute(config, &size, iterations, json).await,
        Commands::Simulate {
            layers,
            layer_size,
            resident,
            peers,
            json,
        } => {
            let opts = commands::simulate::SimulateOptions {
                layers,
                layer_size: commands::parse_size(&layer_size)?,
                resident,
                peers,
            };
            commands::simulate::execute(config, opts, json).await
        }
        Commands::Config { json } => commands::config::execute(&config, json),
        Commands::Completions { .. } => Ok(()),
    }
}
