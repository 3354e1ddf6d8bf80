//! RDM CLI - Command-line download manager
//!
//! Downloads survive interruptions: Ctrl-C pauses, `rdm resume` picks up
//! where the partial file stopped.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RDM - Resumable Download Manager
#[derive(Parser)]
#[command(name = "rdm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for RDM
    #[arg(long, env = "RDM_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Directory to save into
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// File name (single URL only)
        #[arg(short, long)]
        name: Option<String>,

        /// Extra request header, "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Tag attached to every transfer
        #[arg(long)]
        tag: Option<String>,

        /// Max concurrent downloads
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Resume a paused download
    Resume {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// Cancel a download and delete its partial file
    Cancel {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// Show download status
    Status {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// List downloads
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Forget a finished or paused download
    Clear {
        /// Download ID (or unique prefix)
        id: String,
    },

    /// Forget downloads untouched for a number of days
    Cleanup {
        /// Minimum age in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Show/initialize settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all config
    Show,

    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "rdm_core=debug,rdm=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(rdm_types::default_data_dir);

    match cli.command {
        Commands::Get {
            urls,
            dir,
            name,
            headers,
            tag,
            concurrency,
        } => {
            let options = commands::GetOptions {
                dir,
                name,
                headers,
                tag,
                concurrency,
            };
            commands::get(&data_dir, urls, options, cli.output).await?
        }

        Commands::Resume { id } => commands::resume(&data_dir, &id, cli.output).await?,

        Commands::Cancel { id } => commands::cancel(&data_dir, &id, cli.output).await?,

        Commands::Status { id } => commands::status(&data_dir, &id, cli.output).await?,

        Commands::List { status } => commands::list(&data_dir, status, cli.output).await?,

        Commands::Clear { id } => commands::clear(&data_dir, &id, cli.output).await?,

        Commands::Cleanup { days } => commands::cleanup(&data_dir, days, cli.output).await?,

        Commands::Config { action } => commands::config_action(&data_dir, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "rdm", &mut std::io::stdout());
        }
    }

    Ok(())
}
