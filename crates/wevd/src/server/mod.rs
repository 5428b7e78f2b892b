//! WebSocket server for named-event connections.
//!
//! The server:
//! - Listens on TCP for WebSocket upgrades
//! - Spawns a ConnectionHandler for each client
//! - Owns one connection registry, so several servers can coexist
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   EventServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │   (per client)  │     │                 │
//! └───────┬─────────┘     └────────┬────────┘
//!         │ invoke                 │ snapshot
//!         ▼                        ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │  HandlerTable   │────▶│    Directory    │
//! │ (app handlers)  │     │   (read-only)   │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop keeps serving

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::CLOSE_GOING_AWAY;
use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::handlers::HandlerTable;
use crate::registry::{spawn_registry, RegistryHandle};

/// How long shutdown waits for clients to finish the close handshake
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting for connections to drain
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// WebSocket event server.
///
/// Each server owns its registry; connections of one server are never
/// visible to another.
pub struct EventServer {
    /// Server settings
    config: ServerConfig,

    /// Handlers shared by all connections
    handlers: Arc<HandlerTable>,

    /// Handle to this server's connection registry
    registry: RegistryHandle,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

impl EventServer {
    /// Creates a server and spawns its registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig, handlers: HandlerTable) -> Self {
        let registry = spawn_registry(config.max_connections, config.id_max_attempts);
        Self {
            config,
            handlers: Arc::new(handlers),
            registry,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Replaces the shutdown token, e.g. with a child of an app-wide one.
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Server settings.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Read-only view of this server's connections.
    pub fn directory(&self) -> Directory {
        Directory::new(self.registry.clone())
    }

    /// Binds `config.bind` and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.config.bind,
                error: e.to_string(),
            })?;

        self.run_with_listener(listener).await
    }

    /// Serves a pre-bound listener until cancelled.
    ///
    /// On cancellation every live connection is sent a "going away" close
    /// frame and given a short grace period to finish.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Event server listening"),
            Err(e) => warn!(error = %e, "Event server listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                            self.serve_stream(stream, Some(peer));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Serves one already-accepted byte stream as a WebSocket connection.
    ///
    /// The returned task finishes once the connection has fully closed.
    pub fn serve_stream<S>(&self, stream: S, peer: Option<SocketAddr>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = ConnectionHandler::new(
            self.registry.clone(),
            Arc::clone(&self.handlers),
            &self.config,
            peer,
        );
        tokio::spawn(handler.run(stream))
    }

    /// Closes every connection and waits briefly for them to leave.
    async fn shutdown(&self) {
        self.registry
            .close_all(CLOSE_GOING_AWAY, "server shutting down")
            .await;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = self.registry.count(false).await;
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Connections still open after shutdown grace period");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        info!("Server shutdown complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },
}
