//! Server orchestration: wiring, listen loop, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warplan_signaling::{Hub, RateLimiter};

use crate::config::Config;
use crate::http::{self, AppState, Metrics};

/// Connection admissions per source key per window.
const CONNECT_RATE_LIMIT: usize = 5;
const CONNECT_RATE_WINDOW: Duration = Duration::from_secs(60);

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Runs the server until SIGINT or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let hub = Hub::new();
    let hub_task = {
        let hub = Arc::clone(&hub);
        let cancel = cancel.clone();
        tokio::spawn(async move { hub.run(cancel).await })
    };

    let rate_limiter = Arc::new(RateLimiter::new(CONNECT_RATE_LIMIT, CONNECT_RATE_WINDOW));
    {
        let limiter = Arc::clone(&rate_limiter);
        let cancel = cancel.clone();
        tokio::spawn(async move { limiter.run_cleanup(cancel).await });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        hub,
        rate_limiter,
        metrics: Arc::new(Metrics::new()),
        cancel: cancel.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                http::router(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        })
    };

    shutdown_signal().await;
    info!("shutting down gracefully");
    cancel.cancel();

    // Cancelling the hub closes every client outbox, which closes the
    // sockets, so the drain normally finishes well inside the grace
    // window.
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!("forced shutdown: connections did not drain in time"),
    }

    let _ = hub_task.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("SIGINT received"),
        () = terminate => info!("SIGTERM received"),
    }
}
