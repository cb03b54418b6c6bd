//! cutover - interactive live migration of Redis-protocol fleets.
//!
//! Connects the given source/destination pairs, then walks the operator
//! through replication, buffer drain, and promotion in a live terminal
//! view. Configuration and connection failures are reported before any
//! terminal mode change and exit with code 1.
#![allow(clippy::print_stderr)]

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use cutover::config::{parse_endpoint_lists, CutoverOptions};
use cutover::console;
use cutover::orchestrator::Orchestrator;

/// Interactively migrate a fleet of stores to replacement instances.
///
/// Each destination is attached to its source as a replica; once all
/// replication links are up the operator can enable writes and finally
/// promote the destinations to independent masters.
#[derive(Parser, Debug)]
#[command(name = "cutover")]
#[command(author, version, about)]
struct Cli {
    /// Source instance URLs to sync from (repeatable; redis://[:pass@]host[:port])
    #[arg(long = "src", value_name = "src_url", required = true, num_args = 1..)]
    sources: Vec<String>,

    /// Destination instance URLs to sync to (repeatable, same count as --src)
    #[arg(long = "dst", value_name = "dst_url", required = true, num_args = 1..)]
    destinations: Vec<String>,

    /// Status refresh interval while idle, in milliseconds
    #[arg(long = "poll-interval-ms", value_name = "MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Maximum wait per endpoint query or command, in milliseconds
    #[arg(long = "call-timeout-ms", value_name = "MS", default_value = "5000")]
    call_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = CutoverOptions {
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        call_timeout: Duration::from_millis(cli.call_timeout_ms),
    };

    // Both of these fail before any terminal mode change.
    let pair_specs = parse_endpoint_lists(&cli.sources, &cli.destinations)?;
    let orchestrator = Orchestrator::connect(pair_specs, &options).await?;

    let phase = console::run(orchestrator, &options).await?;
    tracing::info!(%phase, "session ended");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Off unless RUST_LOG asks for it: log lines would tear the live
    // status display.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
