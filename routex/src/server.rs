//! HTTP server with graceful shutdown

use axum::Router;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tokio::signal;

use crate::error::{Error, Result};
use crate::state::AppState;

/// Server instance
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the server with the given router
    ///
    /// On SIGTERM/SIGINT the listener stops accepting, in-flight requests
    /// drain, and the store flushes its log buffer before the process exits.
    pub async fn serve(self, app: Router) -> Result<()> {
        let host: IpAddr = self
            .state
            .config
            .server
            .host
            .parse()
            .map_err(|_| Error::Config(format!("invalid host '{}'", self.state.config.server.host)))?;
        let addr = SocketAddr::new(host, self.state.config.server.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;

        tracing::info!("routex listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))?;

        self.state.shutdown().await;
        tracing::info!("server shutdown complete");
        Ok(())
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    tracing::info!("Shutdown signal received, draining requests...");
}
