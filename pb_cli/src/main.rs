//! Pourbrew CLI - installs and upgrades Homebrew bottles.

use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pb_core::InstallConfig;
use pb_io::api::DEFAULT_API_URL;
use pb_io::{ApiClient, Prefix};

mod commands;
mod display;

use commands::Context;

#[derive(Parser)]
#[command(name = "pb")]
#[command(about = "Pourbrew - installs and upgrades Homebrew bottles")]
#[command(version)]
struct Cli {
    /// Root directory for pourbrew data (cache, store, database)
    #[arg(long, env = "POURBREW_ROOT", default_value = "/opt/pourbrew")]
    root: PathBuf,

    /// Prefix directory for kegs and linked files [default: <root>/prefix]
    #[arg(long, env = "POURBREW_PREFIX")]
    prefix: Option<PathBuf>,

    /// Number of parallel downloads [default: twice the CPU count]
    #[arg(long)]
    concurrency: Option<usize>,

    /// Formula API base URL
    #[arg(long, env = "POURBREW_API_URL", default_value = DEFAULT_API_URL, hide = true)]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install formulae and their dependencies
    Install {
        /// Formula names to install
        #[arg(required = true)]
        formulas: Vec<String>,
    },

    /// Upgrade outdated formulae
    Upgrade {
        /// Formula names to upgrade (omit to upgrade everything outdated)
        formulas: Vec<String>,

        /// Show what would be upgraded without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Show each step of every upgrade
        #[arg(long, short = 'v')]
        verbose: bool,
    },

    /// List outdated formulae
    Outdated {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn prefix_dir(&self) -> PathBuf {
        self.prefix
            .clone()
            .unwrap_or_else(|| self.root.join("prefix"))
    }
}

/// Log filter from `POURBREW_LOG`, then `RUST_LOG`, defaulting to `warn`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env("POURBREW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), pb_core::Error> {
    let config = InstallConfig::from_env()?.with_download_concurrency(cli.concurrency)?;
    let prefix = Prefix::open(&cli.root, &cli.prefix_dir())?;
    tracing::debug!(
        root = %cli.root.display(),
        concurrency = config.download_concurrency,
        "opened prefix"
    );

    let ctx = Context {
        prefix: Arc::new(prefix),
        api: ApiClient::with_base_url(cli.api_url),
        config,
    };

    match cli.command {
        Commands::Install { formulas } => commands::install::run(&ctx, &formulas).await,
        Commands::Upgrade {
            formulas,
            dry_run,
            verbose,
        } => commands::upgrade::run_upgrade(&ctx, &formulas, dry_run, verbose).await,
        Commands::Outdated { json } => commands::upgrade::run_outdated(&ctx, json).await,
    }
}
