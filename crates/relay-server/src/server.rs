//! HTTP server with graceful shutdown.
//!
//! On shutdown the listener stops accepting, in-flight connections finish,
//! and the background accounting group is drained with a deadline so
//! post-stream credit deductions are not lost on restart.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use relay_core::{GatewayError, GatewayResult};

use crate::routes::create_router;
use crate::state::AppState;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Deadline for draining background accounting on shutdown
    pub drain_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            drain_deadline: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// Create with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the bind port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// The gateway HTTP server
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a server over the assembled state
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Bind and serve until SIGTERM/ctrl-c, then drain accounting.
    ///
    /// # Errors
    /// Returns an error when the listener cannot bind.
    pub async fn run(self) -> GatewayResult<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::configuration(format!("failed to bind {addr}: {e}")))?;

        info!(addr = %addr, "Gateway listening");

        let state = self.state.clone();
        let app = create_router(self.state)
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::internal(format!("server error: {e}")))?;

        info!("Listener closed, draining background accounting");
        if !state
            .accounting()
            .tasks()
            .drain(self.config.drain_deadline)
            .await
        {
            warn!("Accounting drain deadline reached; some post-flight work was dropped");
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
