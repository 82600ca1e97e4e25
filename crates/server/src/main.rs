//! episodic-server: runs the scheduler and serves its status over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use episodic_core::config::load_dotenv;
use episodic_core::Config;
use episodic_scheduler::Scheduler;

/// Per-group episode scheduler with a system-wide GPU lock.
#[derive(Parser, Debug)]
#[command(name = "episodic-server", version, about)]
struct Cli {
    /// TOML config file (environment variables are used when omitted).
    #[arg(long, env = "EPISODIC_CONFIG")]
    config: Option<PathBuf>,

    /// Override `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config =
        Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
        config.validate().context("invalid --port")?;
    }
    config.log_summary();

    let scheduler = Arc::new(Scheduler::new(&config)?);
    episodic_server::serve(&config, scheduler).await?;

    info!("Shutdown complete");
    Ok(())
}
