//! HTTP status surface for the episode scheduler.
//!
//! Serves queue and GPU lock state so pollers never have to scrape logs,
//! and provides [`HttpStatusSource`] so a gatekeeper in another process
//! can wait on the same data.

pub mod api;
pub mod client;
pub mod router;
pub mod state;

use std::sync::Arc;

use episodic_core::Config;
use episodic_scheduler::Scheduler;
use tracing::{info, warn};

pub use client::HttpStatusSource;
pub use router::build_router;
pub use state::AppState;

/// Bind the configured address and serve until SIGINT/SIGTERM, then stop
/// the scheduler's workers.
pub async fn serve(config: &Config, scheduler: Arc<Scheduler>) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(scheduler.status()));
    let app = build_router(state, &config.server.cors_origin);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Status server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Status server stopped, draining workers");
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
