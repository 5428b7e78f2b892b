//! Per-connection client handle and public connection data.
//!
//! A [`ClientHandle`] is what application handlers receive as their
//! context. It only holds the connection id and a registry handle, so
//! every `emit`/`close` goes through the registry and fails with
//! [`ClientError::StaleConnection`] once the connection is gone instead
//! of touching a dead socket.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use wev_core::ConnectionId;
use wev_protocol::{encode, Envelope};

use crate::directory::Directory;
use crate::registry::{PublicRecord, RegistryError, RegistryHandle};

/// Normal closure (RFC 6455).
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Policy violation; used when a connection cannot be admitted.
pub const CLOSE_POLICY: u16 = 1008;

/// Try again later; used when the registry is full.
pub const CLOSE_TRY_AGAIN: u16 = 1013;

/// No status code was present in the close frame.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

// ============================================================================
// Connection Metadata
// ============================================================================

/// Request metadata captured during the WebSocket handshake.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    /// Remote address, when the listener knows it
    pub peer_addr: Option<SocketAddr>,

    /// Request path, e.g. `/events`
    pub path: String,

    /// Raw query string without the leading `?`
    pub query: Option<String>,

    /// Request headers in arrival order (names lowercased)
    pub headers: Vec<(String, String)>,

    /// When the handshake was received
    pub connected_at: DateTime<Utc>,
}

impl ConnectInfo {
    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            peer_addr: None,
            path: "/".to_string(),
            query: None,
            headers: Vec::new(),
            connected_at: Utc::now(),
        }
    }
}

/// Close code and reason passed to the `close` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code (1005 when the peer sent none, 1006 on abnormal drop)
    pub code: u16,

    /// Close reason text, possibly empty
    pub reason: String,
}

impl CloseInfo {
    /// Creates close info.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Public Data
// ============================================================================

/// Public view of one connection.
///
/// Exposes the id, handshake metadata, application fields, and a client
/// handle. The transport and the readiness flag are never reachable from
/// here.
#[derive(Debug, Clone)]
pub struct PublicData {
    record: PublicRecord,
    client: ClientHandle,
}

impl PublicData {
    pub(crate) fn new(record: PublicRecord, client: ClientHandle) -> Self {
        Self { record, client }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.record.id
    }

    /// Handshake metadata.
    pub fn info(&self) -> &ConnectInfo {
        &self.record.info
    }

    /// All application-attached fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.record.fields
    }

    /// One application-attached field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.record.fields.get(key)
    }

    /// Handle for emitting to or closing this connection.
    pub fn client(&self) -> &ClientHandle {
        &self.client
    }
}

// ============================================================================
// Client Handle
// ============================================================================

/// Handle bound to one connection.
///
/// Cheap to clone; clones refer to the same connection.
#[derive(Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    registry: RegistryHandle,
}

impl ClientHandle {
    pub(crate) fn new(id: ConnectionId, registry: RegistryHandle) -> Self {
        Self { id, registry }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Sends event `event` to this connection.
    ///
    /// A single JSON object argument is delivered in named form, anything
    /// else positionally.
    ///
    /// # Errors
    ///
    /// `ClientError::StaleConnection` if the connection has closed.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), ClientError> {
        self.emit_envelope(&encode(event, args)).await
    }

    /// Sends a prepared envelope to this connection.
    pub async fn emit_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let frame = envelope
            .to_json()
            .map_err(|e| ClientError::Encode(e.to_string()))?;

        debug!(connection_id = %self.id, event = %envelope.event, "Emitting event");

        self.registry
            .send(self.id.clone(), frame)
            .await
            .map_err(|e| self.map_err(e))
    }

    /// Closes the connection normally.
    ///
    /// The `close` hook runs once the transport confirms the close.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.close_with(CLOSE_NORMAL, "").await
    }

    /// Closes the connection with an explicit code and reason.
    pub async fn close_with(&self, code: u16, reason: &str) -> Result<(), ClientError> {
        self.registry
            .close(self.id.clone(), code, reason)
            .await
            .map_err(|e| self.map_err(e))
    }

    /// Attaches `value` under `key` in this connection's public data.
    ///
    /// Returns the previous value.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, ClientError> {
        self.registry
            .set_field(self.id.clone(), key.into(), value)
            .await
            .map_err(|e| self.map_err(e))
    }

    /// Removes `key` from this connection's public data.
    pub async fn remove(&self, key: impl Into<String>) -> Result<Option<Value>, ClientError> {
        self.registry
            .remove_field(self.id.clone(), key.into())
            .await
            .map_err(|e| self.map_err(e))
    }

    /// Reads `key` from this connection's public data.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, ClientError> {
        let data = self.data().await?;
        Ok(data.field(key).cloned())
    }

    /// Current public data of this connection.
    pub async fn data(&self) -> Result<PublicData, ClientError> {
        self.registry
            .get(self.id.clone())
            .await
            .ok_or_else(|| ClientError::StaleConnection(self.id.clone()))
    }

    /// Returns true while the connection is registered.
    pub async fn is_connected(&self) -> bool {
        self.registry.get(self.id.clone()).await.is_some()
    }

    /// Read-only view of all connections on the same server.
    pub fn directory(&self) -> Directory {
        Directory::new(self.registry.clone())
    }

    fn map_err(&self, err: RegistryError) -> ClientError {
        if err.is_gone() {
            ClientError::StaleConnection(self.id.clone())
        } else {
            ClientError::Registry(err)
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Errors returned by [`ClientHandle`] operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The connection has closed and left the registry.
    #[error("connection {0} is closed")]
    StaleConnection(ConnectionId),

    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The registry could not be reached.
    #[error("registry error: {0}")]
    Registry(RegistryError),
}

impl ClientError {
    /// Returns true for [`ClientError::StaleConnection`].
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleConnection(_))
    }
}
