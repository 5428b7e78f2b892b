//! Connection lifecycle for individual WebSocket clients.
//!
//! Each accepted stream gets its own `ConnectionHandler` that:
//! - Performs the WebSocket upgrade, running the `checkHeaders` hook
//! - Registers the connection and runs the `connection` hook before
//!   marking it ready, reading frames while the hook is pending
//! - Decodes inbound frames and starts their handlers in arrival order
//! - Unregisters on close, then runs the `close` hook
//! - Gives up on a peer that does not answer a server close within the
//!   write timeout
//!
//! Outbound frames never touch the socket from handler code: they go
//! through the registry to a per-connection writer task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler panics are caught and logged; they affect only one event
//! - Transport errors are logged and end the connection gracefully

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, SplitSink};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wev_core::ConnectionId;
use wev_protocol::{decode_bounded, Envelope};

use crate::client::{
    ClientHandle, CloseInfo, ConnectInfo, CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_POLICY,
    CLOSE_TRY_AGAIN,
};
use crate::config::ServerConfig;
use crate::dispatch::{invoke, DispatchError};
use crate::handlers::{EventHandler, HandlerTable, HandshakeRejection, EVENT_CLOSE, EVENT_CONNECTION};
use crate::registry::{Outbound, RegistryError, RegistryHandle};

/// Handler futures still running for one connection.
type InFlight = FuturesUnordered<BoxFuture<'static, ()>>;

/// Lifecycle controller for a single connection.
pub struct ConnectionHandler {
    /// Handle to the connection registry
    registry: RegistryHandle,

    /// Handlers shared by every connection of the server
    handlers: Arc<HandlerTable>,

    /// Remote address, if known
    peer_addr: Option<SocketAddr>,

    /// Inbound frames larger than this are dropped
    max_message_size: usize,

    /// Bound on each outbound write
    write_timeout: Duration,
}

impl ConnectionHandler {
    /// Creates a handler for one accepted stream.
    pub fn new(
        registry: RegistryHandle,
        handlers: Arc<HandlerTable>,
        config: &ServerConfig,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            registry,
            handlers,
            peer_addr,
            max_message_size: config.max_message_size,
            write_timeout: config.write_timeout(),
        }
    }

    /// Runs the connection from upgrade to teardown.
    ///
    /// Returns once the connection has closed, the `close` hook has run
    /// and every in-flight handler has finished.
    pub async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws, info) = match self.handshake(stream).await {
            Ok(accepted) => accepted,
            Err(ConnectionError::Rejected { status }) => {
                info!(peer = ?self.peer_addr, status, "Upgrade rejected");
                return;
            }
            Err(e) => {
                debug!(peer = ?self.peer_addr, error = %e, "Handshake failed");
                return;
            }
        };

        let info = Arc::new(info);
        let (mut sink, mut source) = ws.split();
        let (transport, outbound) = mpsc::unbounded_channel();

        let id = match self.registry.register(transport, Arc::clone(&info)).await {
            Ok(id) => id,
            Err(e) => {
                let code = match e {
                    RegistryError::RegistryFull { .. } => CLOSE_TRY_AGAIN,
                    _ => CLOSE_POLICY,
                };
                warn!(peer = ?self.peer_addr, error = %e, "Refusing connection");
                let refusal = close_message(code, "connection refused".to_string());
                if timeout(self.write_timeout, sink.send(refusal)).await.is_err() {
                    debug!(peer = ?self.peer_addr, "Timed out sending refusal");
                }
                return;
            }
        };

        info!(
            connection_id = %id,
            peer = ?self.peer_addr,
            path = %info.path,
            "Client connected"
        );

        let write_failed = CancellationToken::new();
        let close_sent = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound,
            self.write_timeout,
            WriterSignals {
                failed: write_failed.clone(),
                close_sent: close_sent.clone(),
            },
            id.clone(),
        ));

        let client = ClientHandle::new(id.clone(), self.registry.clone());

        // Hidden from enumeration until the connection hook has finished.
        // The hook runs alongside the read loop so a peer leaving during
        // setup is noticed at once.
        let mut setup: Option<BoxFuture<'static, ()>> = self.handlers.connection().map(|hook| {
            let hook = Arc::clone(hook);
            let client = client.clone();
            let info = Arc::clone(&info);
            async move {
                isolate(EVENT_CONNECTION, &client, invoke(&hook, &client, info)).await;
            }
            .boxed()
        });
        if setup.is_none() {
            self.mark_ready(&id).await;
        }

        // Bounds the wait for the peer's answer to a server-initiated close
        let close_grace = {
            let close_sent = close_sent.clone();
            let grace = self.write_timeout;
            async move {
                close_sent.cancelled().await;
                tokio::time::sleep(grace).await;
            }
        };
        tokio::pin!(close_grace);

        let mut in_flight = InFlight::new();
        let mut peer_close: Option<CloseInfo> = None;

        let close_info = loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.on_text(&client, text.as_str(), &mut in_flight);
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.on_text(&client, text, &mut in_flight),
                        Err(_) => {
                            debug!(connection_id = %id, len = bytes.len(), "Dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        // Keep reading so the close reply is flushed
                        peer_close = Some(match frame {
                            Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.as_str()),
                            None => CloseInfo::new(CLOSE_NO_STATUS, ""),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "Read failed");
                        break peer_close.take().unwrap_or_else(abnormal);
                    }
                    None => break peer_close.take().unwrap_or_else(abnormal),
                },

                () = async {
                    if let Some(hook) = setup.as_mut() {
                        hook.await;
                    }
                }, if setup.is_some() => {
                    setup = None;
                    self.mark_ready(&id).await;
                }

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                _ = write_failed.cancelled() => {
                    break peer_close.take().unwrap_or_else(abnormal);
                }

                () = &mut close_grace => {
                    debug!(connection_id = %id, "Peer did not answer close");
                    break peer_close.take().unwrap_or_else(abnormal);
                }
            }
        };

        // Closed during setup: never marked ready, the hook finishes as an
        // in-flight handler against a stale handle
        if let Some(hook) = setup.take() {
            debug!(connection_id = %id, "Connection closed before the connection hook finished");
            in_flight.push(hook);
        }

        // Leave the registry before the close hook so it never sees itself
        if let Err(e) = self.registry.unregister(id.clone()).await {
            debug!(connection_id = %id, error = %e, "Failed to unregister connection");
        }

        info!(
            connection_id = %id,
            code = close_info.code,
            reason = %close_info.reason,
            "Client disconnected"
        );

        if let Some(hook) = self.handlers.close() {
            isolate(EVENT_CLOSE, &client, invoke(hook, &client, close_info)).await;
        }

        while in_flight.next().await.is_some() {}

        if let Err(e) = writer.await {
            debug!(connection_id = %id, error = %e, "Writer task ended abnormally");
        }
    }

    /// Performs the upgrade and captures the request metadata.
    async fn handshake<S>(
        &self,
        stream: S,
    ) -> Result<(WebSocketStream<S>, ConnectInfo), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hook = self.handlers.headers().cloned();
        let peer_addr = self.peer_addr;
        let mut captured: Option<ConnectInfo> = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let info = connect_info(request, peer_addr);
            if let Some(hook) = &hook {
                if let Err(rejection) = hook(&info, response.headers_mut()) {
                    debug!(path = %info.path, reason = %rejection.reason, "checkHeaders refused upgrade");
                    return Err(rejection_response(rejection));
                }
            }
            captured = Some(info);
            Ok(response)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| match e {
                WsError::Http(response) => ConnectionError::Rejected {
                    status: response.status().as_u16(),
                },
                other => ConnectionError::Handshake(other.to_string()),
            })?;

        let info = captured
            .ok_or_else(|| ConnectionError::Handshake("request was not captured".to_string()))?;
        Ok((ws, info))
    }

    /// Makes the connection visible to enumeration.
    async fn mark_ready(&self, id: &ConnectionId) {
        if let Err(e) = self.registry.mark_ready(id.clone()).await {
            debug!(connection_id = %id, error = %e, "Failed to mark connection ready");
        }
    }

    /// Decodes one text frame and starts its handler.
    ///
    /// Malformed frames and unknown events are dropped without a reply.
    fn on_text(&self, client: &ClientHandle, text: &str, in_flight: &mut InFlight) {
        let envelope = match decode_bounded(text, self.max_message_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(connection_id = %client.id(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        let Some(handler) = self.handlers.event(&envelope.event) else {
            debug!(connection_id = %client.id(), event = %envelope.event, "No handler for event");
            return;
        };

        in_flight.push(handle_event(handler.clone(), client.clone(), envelope));
    }
}

/// Runs one application handler as an owned future.
fn handle_event(
    handler: EventHandler,
    client: ClientHandle,
    envelope: Envelope,
) -> BoxFuture<'static, ()> {
    async move {
        let Envelope { event, args } = envelope;
        isolate(&event, &client, invoke(&handler, &client, args)).await;
    }
    .boxed()
}

/// Awaits a handler invocation, containing its failure or panic.
async fn isolate<F>(event: &str, client: &ClientHandle, invocation: F)
where
    F: Future<Output = Result<(), DispatchError>>,
{
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(DispatchError::Emit(e))) if e.is_stale() => {
            debug!(
                connection_id = %client.id(),
                event = %event,
                "Reply dropped, connection already closed"
            );
        }
        Ok(Err(e)) => {
            error!(connection_id = %client.id(), event = %event, error = %e, "Handler failed");
        }
        Err(panic) => {
            error!(
                connection_id = %client.id(),
                event = %event,
                panic = %panic_message(panic.as_ref()),
                "Handler panicked"
            );
        }
    }
}

/// Signals from the writer task back to the read loop.
struct WriterSignals {
    /// Cancelled when a write fails or times out
    failed: CancellationToken,

    /// Cancelled once a server-initiated close frame is on the wire
    close_sent: CancellationToken,
}

/// Drains outbound frames into the socket until the channel closes.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    write_timeout: Duration,
    signals: WriterSignals,
    id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let (message, closing) = match item {
            Outbound::Frame(text) => (Message::text(text), false),
            Outbound::Close { code, reason } => {
                debug!(connection_id = %id, code, "Closing connection");
                (close_message(code, reason), true)
            }
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = %id, error = %e, "Write failed");
                signals.failed.cancel();
                return;
            }
            Err(_) => {
                warn!(
                    connection_id = %id,
                    timeout_secs = write_timeout.as_secs(),
                    "Write timed out"
                );
                signals.failed.cancel();
                return;
            }
        }

        if closing {
            signals.close_sent.cancel();
            return;
        }
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn abnormal() -> CloseInfo {
    CloseInfo::new(CLOSE_ABNORMAL, "")
}

/// Builds connection metadata from the upgrade request.
fn connect_info(request: &Request, peer_addr: Option<SocketAddr>) -> ConnectInfo {
    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    ConnectInfo {
        peer_addr,
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        headers,
        connected_at: Utc::now(),
    }
}

fn rejection_response(rejection: HandshakeRejection) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(rejection.reason));
    *response.status_mut() =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Errors that end a connection before it is registered.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Upgrade rejected with status {status}")]
    Rejected { status: u16 },
}
