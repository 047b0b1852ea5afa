//! Read API server lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Where the read API listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind (e.g. `0.0.0.0`).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerConfig {
    /// All interfaces on `port`.
    pub fn on_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 8080,
        }
    }
}

/// Serve the read API until `shutdown` resolves, then drain in-flight
/// requests and return.
///
/// # Errors
///
/// Returns [`ServerError::Address`] or [`ServerError::Bind`] if the listener
/// cannot be opened, or [`ServerError::Serve`] on a fatal I/O error.
pub async fn start_server<F>(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let text = format!("{}:{}", config.host, config.port);
    let addr: SocketAddr = text.parse().map_err(|source| ServerError::Address {
        addr: text.clone(),
        source,
    })?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Read API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    info!(%addr, "Read API drained");
    Ok(())
}

/// Failures of the read API server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `host:port` is not a socket address.
    #[error("invalid listen address {addr}: {source}")]
    Address {
        /// The rejected address text.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// The listener could not be opened.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("serve error: {0}")]
    Serve(#[source] std::io::Error),
}
