use std::sync::Arc;

use anyhow::{Context, Result};
use callbench::cli::Cli;
use callbench::config::RunConfig;
use callbench::orchestrator::Orchestrator;
use callbench::ptrace_source::PtraceCounterSource;
use callbench::signals;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Initialize the stderr subscriber; warnings are always shown
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Must happen before any thread exists so every thread inherits the mask
    let signal_set = signals::block().context("Failed to block termination signals")?;

    init_tracing(args.debug);

    let config = RunConfig::from_cli(&args)?;
    config.check_destination()?;

    if nix::unistd::geteuid().is_root()
        && config.identity.is_none()
        && std::env::var_os("SUDO_UID").is_none()
    {
        eprintln!("Warning: You should probably run callbench with sudo, not from a root shell.");
        if config.destination.is_filesystem() {
            eprintln!("Warning: No --user given, snapshot files will not be written.");
        }
    }

    let orchestrator = Orchestrator::new(config, Arc::new(PtraceCounterSource::new()));
    signals::spawn_listener(signal_set, orchestrator.event_sender())?;

    let outcome = orchestrator.run()?;
    tracing::info!(
        "{} snapshot(s) produced, {} written, {} skipped, {} failed",
        outcome.stats.produced,
        outcome.stats.written,
        outcome.stats.skipped,
        outcome.stats.failed
    );
    if !outcome.final_written {
        eprintln!("Error: final snapshot was not written");
    }
    std::process::exit(outcome.exit_code());
}
