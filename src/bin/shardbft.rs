use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use shardbft_devnet::Devnet;
use shardbft_node::{logging, NodeConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shardbft")]
#[command(about = "shardbft sharded BFT node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// YAML or TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Validators per committee
    #[arg(long)]
    validators: Option<usize>,

    /// Number of shards (power of two)
    #[arg(long)]
    shards: Option<usize>,

    /// Heights every layer must finalize
    #[arg(long)]
    heights: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a beacon committee and one committee per shard in process
    Devnet {
        #[command(flatten)]
        args: ConfigArgs,
    },

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        args: ConfigArgs,
    },
}

fn load_config(args: &ConfigArgs) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(validators) = args.validators {
        config.devnet.validators_per_committee = validators;
    }
    if let Some(shards) = args.shards {
        config.consensus.shard_count = shards;
    }
    if let Some(heights) = args.heights {
        config.devnet.heights = heights;
    }
    config.validate().context("validating command line overrides")?;
    Ok(config)
}

async fn run_devnet(config: NodeConfig) -> Result<()> {
    info!(
        "starting devnet: {} shards, {} validators per committee, {} heights",
        config.consensus.shard_count, config.devnet.validators_per_committee, config.devnet.heights
    );
    let devnet = Arc::new(Devnet::new(config.devnet_options(), config.consensus.clone())?);

    let run = devnet.run(config.devnet.heights);
    let reports = tokio::select! {
        reports = run => reports?,
        _ = tokio::signal::ctrl_c() => {
            devnet.shutdown();
            anyhow::bail!("interrupted");
        }
    };

    for report in reports {
        info!("{} reached height {} at {}", report.layer, report.height, report.tip);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let args = match &cli.command {
        Commands::Devnet { args } | Commands::Config { args } => args,
    };
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.log_level) {
        eprintln!("logger already installed: {}", e);
    }

    let outcome = match cli.command {
        Commands::Devnet { .. } => run_devnet(config).await,
        Commands::Config { .. } => config.to_yaml().map(|yaml| print!("{}", yaml)).map_err(Into::into),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
