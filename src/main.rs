//! # SmartDrive CLI (`smartdrive`)
//!
//! ## Usage
//!
//! ```bash
//! smartdrive --config ./config/smartdrive.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `smartdrive login` | Sign in with the device-code flow and cache the token |
//! | `smartdrive crawl` | Discover, extract and upload new or changed documents |
//! | `smartdrive search "<query>"` | Query the vector index |
//! | `smartdrive folders list` | Show saved folder decisions |
//! | `smartdrive folders cycle <path>` | process → list-only → skip → process |
//! | `smartdrive folders remove <path>` | Forget one folder decision |
//! | `smartdrive folders reset` | Forget all folder decisions |
//! | `smartdrive delete-folder <path>` | Remove a folder's documents from the index |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use smartdrive::config;
use smartdrive::crawl::{self, CrawlArgs, CrawlMode};
use smartdrive::logging::{init_logging, LogFormat};
use smartdrive::progress::ProgressMode;
use smartdrive::{auth, maintenance, search};

/// SmartDrive: incremental sync of OneDrive documents into a vector index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/smartdrive.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "smartdrive", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/smartdrive.toml")]
    config: PathBuf,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Debug-level logging. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in interactively and cache the token.
    Login,

    /// Crawl the configured root folder and upload new or changed documents.
    ///
    /// `preflight` discovers every folder first and asks about each one;
    /// `interactive` asks about uncached folders as they are reached;
    /// `unattended` never prompts.
    Crawl {
        #[arg(long, value_enum, default_value_t = CrawlMode::Preflight)]
        mode: CrawlMode,

        /// Stop after this many files (overrides `[crawl] max_files`).
        #[arg(long)]
        max_files: Option<usize>,

        /// Delete every vector in the namespace before crawling.
        #[arg(long)]
        clear: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search indexed documents.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Inspect or edit saved folder decisions.
    Folders {
        #[command(subcommand)]
        action: FolderAction,
    },

    /// Remove every document under a folder from the index and mark the folder `skip`.
    DeleteFolder {
        /// Full remote path, e.g. `/Documents/Old Scans`.
        path: String,
    },
}

#[derive(Subcommand)]
enum FolderAction {
    List,
    Reset,
    Cycle { path: String },
    Remove { path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Login => {
            auth::run_login(&cfg).await?;
        }
        Commands::Crawl {
            mode,
            max_files,
            clear,
            progress,
        } => {
            let args = CrawlArgs {
                mode,
                max_files,
                clear,
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            crawl::run_crawl(&cfg, args).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Folders { action } => match action {
            FolderAction::List => maintenance::list_folders(&cfg)?,
            FolderAction::Reset => maintenance::reset_folders(&cfg)?,
            FolderAction::Cycle { path } => maintenance::cycle_folder(&cfg, &path)?,
            FolderAction::Remove { path } => maintenance::remove_folder(&cfg, &path)?,
        },
        Commands::DeleteFolder { path } => {
            maintenance::run_delete_folder(&cfg, &path).await?;
        }
    }

    Ok(())
}
