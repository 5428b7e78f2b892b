//! Registry actor commands, errors, and transport messages.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `Outbound`: Messages the registry forwards to a connection's writer task
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use wev_core::{ConnectionId, DomainError};

use crate::client::ConnectInfo;

// ============================================================================
// Transport Handle
// ============================================================================

/// Messages delivered to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded envelope to send as a text frame.
    Frame(String),

    /// Close the session with the given code and reason.
    Close { code: u16, reason: String },
}

/// Sending side of a connection's writer channel.
///
/// Owned by the registry entry; never handed to application code.
pub type TransportHandle = mpsc::UnboundedSender<Outbound>;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Allocate an id and register a new, not-yet-ready connection.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    /// - `RegistryError::Domain` if no free id could be allocated
    Register {
        /// Writer channel for the new connection
        transport: TransportHandle,
        /// Handshake metadata
        info: Arc<ConnectInfo>,
        /// Channel to send the assigned id
        respond_to: oneshot::Sender<Result<ConnectionId, RegistryError>>,
    },

    /// Mark a connection visible to enumeration.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    /// - `RegistryError::Domain` if the connection is already ready
    MarkReady {
        /// Connection to mark
        id: ConnectionId,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Remove a connection whose transport session has closed.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    Unregister {
        /// Connection to remove
        id: ConnectionId,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Get the public record of one connection, ready or not.
    Get {
        /// Connection to look up
        id: ConnectionId,
        /// Channel to send the result
        respond_to: oneshot::Sender<Option<PublicRecord>>,
    },

    /// Get the public records of all ready connections.
    SnapshotReady {
        /// Channel to send the results
        respond_to: oneshot::Sender<Vec<PublicRecord>>,
    },

    /// Count registered connections.
    Count {
        /// Only count ready connections
        ready_only: bool,
        /// Channel to send the count
        respond_to: oneshot::Sender<usize>,
    },

    /// Forward an encoded frame to a connection's writer.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    /// - `RegistryError::TransportClosed` if the writer has stopped
    Send {
        /// Target connection
        id: ConnectionId,
        /// Encoded envelope
        frame: String,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Ask a connection's writer to close the session.
    ///
    /// The entry stays registered until the transport reports the close.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    /// - `RegistryError::TransportClosed` if the writer has stopped
    Close {
        /// Target connection
        id: ConnectionId,
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
        /// Channel to send the result
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Close every registered connection (server shutdown).
    ///
    /// Fire-and-forget.
    CloseAll {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },

    /// Attach an application field to a connection's public data.
    ///
    /// Responds with the previous value, if any.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    SetField {
        /// Target connection
        id: ConnectionId,
        /// Field name
        key: String,
        /// Field value
        value: Value,
        /// Channel to send the previous value
        respond_to: oneshot::Sender<Result<Option<Value>, RegistryError>>,
    },

    /// Remove an application field from a connection's public data.
    ///
    /// # Errors
    /// - `RegistryError::ConnectionNotFound` if the connection is gone
    RemoveField {
        /// Target connection
        id: ConnectionId,
        /// Field name
        key: String,
        /// Channel to send the removed value
        respond_to: oneshot::Sender<Result<Option<Value>, RegistryError>>,
    },
}

/// Public portion of a registry entry, as copied out of the actor.
///
/// Never carries the transport handle or the ready flag.
#[derive(Debug, Clone)]
pub struct PublicRecord {
    /// Connection id
    pub id: ConnectionId,
    /// Handshake metadata
    pub info: Arc<ConnectInfo>,
    /// Application-attached fields
    pub fields: Map<String, Value>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
///
/// Uses `thiserror` for ergonomic error handling and Display implementations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum connection capacity.
    #[error("registry is full (max: {max} connections)")]
    RegistryFull {
        /// Maximum number of connections allowed
        max: usize,
    },

    /// The requested connection is not registered.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// The connection is registered but its writer has stopped.
    #[error("transport closed for connection: {0}")]
    TransportClosed(ConnectionId),

    /// Id allocation or state transition failure.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Returns true if the error means the connection no longer exists.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::ConnectionNotFound(_) | Self::TransportClosed(_))
    }
}
