use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corral::cli::{chats, list, messages, stats, validate, RecencyFilter};
use corral::config::Config;

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Marketplace conversation collector and dataset quality grader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "corral.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect the conversation list into the central store
    Chats {
        /// Only conversations active within the window
        #[arg(long, value_enum, default_value_t = RecencyFilter::All)]
        filter: RecencyFilter,

        /// Stop after this many conversations
        #[arg(long)]
        limit: Option<u32>,

        /// Collect without merging
        #[arg(long)]
        dry_run: bool,
    },

    /// Collect messages for stored conversations
    Messages {
        /// Only conversations active within the window
        #[arg(long, value_enum, default_value_t = RecencyFilter::All)]
        filter: RecencyFilter,

        /// Process at most this many conversations
        #[arg(long)]
        limit: Option<usize>,

        /// Concurrent workers (1-3)
        #[arg(long)]
        workers: Option<usize>,

        /// Skip conversations already marked fully collected
        #[arg(long)]
        skip_existing: bool,

        /// Collect without merging
        #[arg(long)]
        dry_run: bool,
    },

    /// Grade the central store
    Validate {
        /// Emit the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored conversations
    List {
        /// Filter by service title substring
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Show dataset statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corral=info")),
        )
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config).unwrap_or_default();

    match cli.command {
        Commands::Chats {
            filter,
            limit,
            dry_run,
        } => {
            chats::run(&config, filter, limit, dry_run).await?;
        }
        Commands::Messages {
            filter,
            limit,
            workers,
            skip_existing,
            dry_run,
        } => {
            messages::run(&config, filter, limit, workers, skip_existing, dry_run).await?;
        }
        Commands::Validate { json } => {
            validate::run(&config, json)?;
        }
        Commands::List { service } => {
            list::run(&config, service)?;
        }
        Commands::Stats => {
            stats::run(&config)?;
        }
    }

    Ok(())
}
