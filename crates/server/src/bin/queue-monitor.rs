//! queue-monitor: watch a running scheduler, or block until it drains.
//!
//! `watch` prints one line per group every interval. `wait` runs the
//! gatekeeping protocol and exits non-zero if the queues never drain.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use episodic_core::config::load_dotenv;
use episodic_core::Config;
use episodic_scheduler::{Gatekeeper, SchedulerError, StatusSnapshot, StatusSource};
use episodic_server::HttpStatusSource;

#[derive(Parser, Debug)]
#[command(name = "queue-monitor", version, about = "Poll the episode scheduler status endpoint")]
struct Cli {
    /// Status endpoint (defaults to `monitor.status_url` from EPISODIC_CONFIG or QUEUE_STATUS_URL).
    #[arg(long, env = "QUEUE_STATUS_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print queue state periodically until interrupted.
    Watch {
        /// Seconds between polls.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Block until every group is drained.
    Wait {
        /// Give up after this many seconds (waits forever when omitted).
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let mut monitor = Config::load()?.monitor;
    if let Some(url) = cli.url {
        monitor.status_url = url;
    }
    let source = HttpStatusSource::from_config(&monitor)?;

    match cli.command {
        Command::Watch { interval } => {
            watch(&source, Duration::from_secs(interval.max(1))).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Wait { timeout } => {
            let gate = Gatekeeper::from_config(source, &monitor);
            match gate.wait_until_drained(timeout.map(Duration::from_secs)).await {
                Ok(_) => {
                    println!("All queues drained.");
                    Ok(ExitCode::SUCCESS)
                }
                Err(SchedulerError::GateTimeout(after)) => {
                    error!("Queues still busy after {:?}", after);
                    Ok(ExitCode::from(2))
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

async fn watch(source: &HttpStatusSource, interval: Duration) {
    println!("Watching {} every {:?} (Ctrl-C to stop)", source.status_url(), interval);
    loop {
        match source.fetch_status().await {
            Ok(snapshot) => print_snapshot(&snapshot),
            Err(e) => println!("[{}] status unavailable: {}", chrono::Local::now().format("%H:%M:%S"), e),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return,
        }
    }
}

fn print_snapshot(snapshot: &StatusSnapshot) {
    let stamp = snapshot.captured_at.with_timezone(&chrono::Local).format("%H:%M:%S");
    let lock = match &snapshot.lock.holder_id {
        Some(holder) => format!("held by {} for {:.0}s", holder, snapshot.lock.held_since_seconds),
        None => "free".to_string(),
    };
    println!(
        "[{}] {} group(s), {} pending, GPU lock {}, {} waiting",
        stamp,
        snapshot.group_queues.len(),
        snapshot.total_pending(),
        lock,
        snapshot.lock.waiting
    );
    for (group, g) in &snapshot.group_queues {
        let current = g.currently_processing_name.as_deref().unwrap_or("-");
        println!(
            "  {:<24} size={:<4} worker={:<5} processing={} ok={} failed={} timed_out={}",
            group,
            g.size,
            g.worker_active,
            current,
            g.counters.succeeded,
            g.counters.failed,
            g.counters.timed_out
        );
        if let Some(err) = &g.last_error {
            println!("  {:<24} last error: {}", "", err);
        }
    }
}
