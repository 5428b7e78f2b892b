//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending
//! commands to the registry actor.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use wev_core::ConnectionId;

use super::commands::{PublicRecord, RegistryCommand, RegistryError, TransportHandle};
use crate::client::{ClientHandle, ConnectInfo, PublicData};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Sends a command and waits for its response.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Register a new connection and return its allocated id.
    ///
    /// The connection starts hidden from enumeration until
    /// [`mark_ready`](Self::mark_ready).
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::Domain` if no free id could be allocated
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        transport: TransportHandle,
        info: Arc<ConnectInfo>,
    ) -> Result<ConnectionId, RegistryError> {
        self.request(|respond_to| RegistryCommand::Register {
            transport,
            info,
            respond_to,
        })
        .await?
    }

    /// Make a connection visible to enumeration.
    pub async fn mark_ready(&self, id: ConnectionId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::MarkReady { id, respond_to })
            .await?
    }

    /// Remove a connection.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Unregister { id, respond_to })
            .await?
    }

    /// Get a connection's public data, ready or not.
    ///
    /// Returns `None` if the connection doesn't exist or if communication
    /// with the actor fails.
    pub async fn get(&self, id: ConnectionId) -> Option<PublicData> {
        let record = self
            .request(|respond_to| RegistryCommand::Get { id, respond_to })
            .await
            .ok()??;

        Some(self.to_public(record))
    }

    /// Get the public data of all ready connections.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn ready_snapshot(&self) -> Vec<PublicData> {
        let records = self
            .request(|respond_to| RegistryCommand::SnapshotReady { respond_to })
            .await
            .unwrap_or_default();

        records.into_iter().map(|r| self.to_public(r)).collect()
    }

    /// Count connections; `ready_only` excludes those still connecting.
    pub async fn count(&self, ready_only: bool) -> usize {
        self.request(|respond_to| RegistryCommand::Count {
            ready_only,
            respond_to,
        })
        .await
        .unwrap_or(0)
    }

    /// Forward an encoded frame to a connection.
    pub async fn send(&self, id: ConnectionId, frame: String) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Send {
            id,
            frame,
            respond_to,
        })
        .await?
    }

    /// Ask a connection's writer to close the session.
    pub async fn close(
        &self,
        id: ConnectionId,
        code: u16,
        reason: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let reason = reason.into();
        self.request(|respond_to| RegistryCommand::Close {
            id,
            code,
            reason,
            respond_to,
        })
        .await?
    }

    /// Close every connection (fire-and-forget).
    pub async fn close_all(&self, code: u16, reason: impl Into<String>) {
        let _ = self
            .sender
            .send(RegistryCommand::CloseAll {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Attach a field to a connection's public data.
    pub async fn set_field(
        &self,
        id: ConnectionId,
        key: String,
        value: Value,
    ) -> Result<Option<Value>, RegistryError> {
        self.request(|respond_to| RegistryCommand::SetField {
            id,
            key,
            value,
            respond_to,
        })
        .await?
    }

    /// Remove a field from a connection's public data.
    pub async fn remove_field(
        &self,
        id: ConnectionId,
        key: String,
    ) -> Result<Option<Value>, RegistryError> {
        self.request(|respond_to| RegistryCommand::RemoveField {
            id,
            key,
            respond_to,
        })
        .await?
    }

    /// Pairs a copied-out record with a client handle for the same id.
    fn to_public(&self, record: PublicRecord) -> PublicData {
        let client = ClientHandle::new(record.id.clone(), self.clone());
        PublicData::new(record, client)
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
