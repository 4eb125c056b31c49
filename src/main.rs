//! Main entry point for the collection-put CLI

use clap::Parser;
use collection_put::cli::{Cli, CliError};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting.
///
/// Logs go to stderr; stdout carries only the command output.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collection_put=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

// The upload runs on the main thread with no runtime threads alive, so a
// checkpoint signal always interrupts the thread doing the reads.
fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result: anyhow::Result<()> = cli.execute().map_err(anyhow::Error::from);

    if let Err(e) = result {
        let code = e.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
        match e.downcast_ref::<CliError>() {
            Some(CliError::Interrupted { signal }) => {
                warn!(signal, "Upload interrupted; progress saved");
            }
            _ => error!("Command failed: {}", e),
        }
        eprintln!("collection-put: {e}");
        std::process::exit(code);
    }
}
