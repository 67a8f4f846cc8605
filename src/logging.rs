//! `tracing` subscriber setup for the CLI.
//!
//! Log events go to stderr so stdout stays reserved for command output and
//! the end-of-run tally. `RUST_LOG` overrides the default filter.

use anyhow::{anyhow, Result};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Default filter: this crate at `level`, noisy HTTP dependencies at warn.
fn default_filter(level: &str) -> String {
    format!(
        "smartdrive={},smartdrive_sync={},h2=warn,hyper=warn,reqwest=warn,rustls=warn",
        level, level
    )
}

fn build_filter(verbose: bool) -> Result<EnvFilter> {
    if let Ok(from_env) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(from_env).map_err(|e| anyhow!("Invalid RUST_LOG filter: {}", e));
    }
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_new(default_filter(level)).map_err(|e| anyhow!("Invalid log filter: {}", e))
}

/// Install the global subscriber. Call once from `main`.
pub fn init_logging(format: LogFormat, verbose: bool) -> Result<()> {
    let filter = build_filter(verbose)?;

    match format {
        LogFormat::Compact => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_target(true)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}
