//! Binary entry point: parses CLI flags, installs structured logging,
//! loads configuration (file + environment overlay), builds the
//! dependency graph, and runs either one supervisor cycle (`--once`) or
//! the full daemon loop until a termination signal arrives.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use beadkeep_daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "beadkeep-daemon", about = "Autonomous coding-agent orchestrator")]
struct Cli {
    /// Path to a TOML config file. Defaults to ~/.beadkeep/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single claim-through-terminal-outcome cycle and exit,
    /// instead of looping until a termination signal.
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match &cli.config {
        Some(path) => beadkeep_core::Config::load_from(path.clone())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => beadkeep_core::Config::load().context("failed to load config")?,
    };

    let daemon = Daemon::new(config).context("failed to construct daemon")?;

    if cli.once {
        let outcome = daemon.run_once();
        tracing::info!(?outcome, "single cycle complete");
        return Ok(());
    }

    let shutdown = daemon.shutdown_handle();
    let daemon_thread = std::thread::spawn(move || daemon.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("ctrl-c received, shutting down");
    shutdown.trigger();

    if daemon_thread.join().is_err() {
        anyhow::bail!("daemon thread panicked");
    }
    Ok(())
}
