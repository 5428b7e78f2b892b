//! Registry actor - owns all connection state and processes commands.
//!
//! The RegistryActor is the single owner of connection state in the server.
//! Registration, removal, enumeration and outbound sends are all serialized
//! through its command channel, so enumeration can never observe a
//! half-registered or half-removed connection.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wev_core::{ConnectionId, ConnectionState, IdAllocator};

use super::commands::{Outbound, PublicRecord, RegistryCommand, RegistryError, TransportHandle};
use crate::client::ConnectInfo;

/// Default maximum number of connections the registry can hold.
pub const MAX_CONNECTIONS: usize = 1024;

// ============================================================================
// Registry Entry
// ============================================================================

/// One registered connection.
struct ConnectionEntry {
    /// Writer channel; the only way to reach the socket
    transport: TransportHandle,

    /// Handshake metadata
    info: Arc<ConnectInfo>,

    /// Application-attached fields
    fields: Map<String, Value>,

    /// `New` until the connection handler has finished
    state: ConnectionState,
}

impl ConnectionEntry {
    fn public_record(&self, id: &ConnectionId) -> PublicRecord {
        PublicRecord {
            id: id.clone(),
            info: Arc::clone(&self.info),
            fields: self.fields.clone(),
        }
    }
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all connection state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially.
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially.
/// All state mutations happen within this single task.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Live connections keyed by id
    connections: HashMap<ConnectionId, ConnectionEntry>,

    /// Id allocator checked against `connections`
    allocator: IdAllocator,

    /// Capacity limit
    max_connections: usize,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `allocator` - Id allocator for new connections
    /// * `max_connections` - Capacity limit
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        allocator: IdAllocator,
        max_connections: usize,
    ) -> Self {
        Self {
            receiver,
            connections: HashMap::new(),
            allocator,
            max_connections,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    /// This is the main entry point - call this in a spawned task.
    pub async fn run(mut self) {
        info!(max_connections = self.max_connections, "Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            "Registry actor stopped (connections: {})",
            self.connections.len()
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Register {
                transport,
                info,
                respond_to,
            } => {
                let result = self.handle_register(transport, info);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::MarkReady { id, respond_to } => {
                let result = self.handle_mark_ready(&id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Unregister { id, respond_to } => {
                let result = self.handle_unregister(&id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Get { id, respond_to } => {
                let result = self
                    .connections
                    .get(&id)
                    .map(|entry| entry.public_record(&id));
                let _ = respond_to.send(result);
            }
            RegistryCommand::SnapshotReady { respond_to } => {
                let _ = respond_to.send(self.handle_snapshot_ready());
            }
            RegistryCommand::Count {
                ready_only,
                respond_to,
            } => {
                let count = if ready_only {
                    self.connections
                        .values()
                        .filter(|entry| entry.state.is_ready())
                        .count()
                } else {
                    self.connections.len()
                };
                let _ = respond_to.send(count);
            }
            RegistryCommand::Send {
                id,
                frame,
                respond_to,
            } => {
                let result = self.forward(&id, Outbound::Frame(frame));
                let _ = respond_to.send(result);
            }
            RegistryCommand::Close {
                id,
                code,
                reason,
                respond_to,
            } => {
                let result = self.forward(&id, Outbound::Close { code, reason });
                let _ = respond_to.send(result);
            }
            RegistryCommand::CloseAll { code, reason } => {
                self.handle_close_all(code, &reason);
            }
            RegistryCommand::SetField {
                id,
                key,
                value,
                respond_to,
            } => {
                let result = match self.connections.get_mut(&id) {
                    Some(entry) => Ok(entry.fields.insert(key, value)),
                    None => Err(RegistryError::ConnectionNotFound(id)),
                };
                let _ = respond_to.send(result);
            }
            RegistryCommand::RemoveField {
                id,
                key,
                respond_to,
            } => {
                let result = match self.connections.get_mut(&id) {
                    Some(entry) => Ok(entry.fields.remove(&key)),
                    None => Err(RegistryError::ConnectionNotFound(id)),
                };
                let _ = respond_to.send(result);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Handles connection registration.
    fn handle_register(
        &mut self,
        transport: TransportHandle,
        info: Arc<ConnectInfo>,
    ) -> Result<ConnectionId, RegistryError> {
        if self.connections.len() >= self.max_connections {
            warn!(
                current = self.connections.len(),
                max = self.max_connections,
                "Registry is full, rejecting connection"
            );
            return Err(RegistryError::RegistryFull {
                max: self.max_connections,
            });
        }

        let connections = &self.connections;
        let id = self
            .allocator
            .allocate(|candidate| connections.contains_key(candidate))
            .map_err(|e| {
                warn!(error = %e, "Could not allocate connection id");
                RegistryError::from(e)
            })?;

        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                transport,
                info,
                fields: Map::new(),
                state: ConnectionState::New,
            },
        );

        info!(
            connection_id = %id,
            total_connections = self.connections.len(),
            "Connection registered"
        );

        Ok(id)
    }

    /// Moves a connection from `New` to `Ready`.
    fn handle_mark_ready(&mut self, id: &ConnectionId) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;

        entry.state = entry.state.advance(ConnectionState::Ready)?;
        debug!(connection_id = %id, "Connection ready");
        Ok(())
    }

    /// Removes a connection.
    fn handle_unregister(&mut self, id: &ConnectionId) -> Result<(), RegistryError> {
        match self.connections.remove(id) {
            Some(entry) => {
                let state = entry.state.advance(ConnectionState::Closed)?;
                info!(
                    connection_id = %id,
                    previous = %entry.state,
                    state = %state,
                    total_connections = self.connections.len(),
                    "Connection removed"
                );
                Ok(())
            }
            None => {
                debug!(connection_id = %id, "Unregister for unknown connection");
                Err(RegistryError::ConnectionNotFound(id.clone()))
            }
        }
    }

    /// Public records of ready connections.
    fn handle_snapshot_ready(&self) -> Vec<PublicRecord> {
        self.connections
            .iter()
            .filter(|(_, entry)| entry.state.is_ready())
            .map(|(id, entry)| entry.public_record(id))
            .collect()
    }

    /// Pushes a message onto a connection's writer channel.
    fn forward(&self, id: &ConnectionId, msg: Outbound) -> Result<(), RegistryError> {
        let entry = self
            .connections
            .get(id)
            .ok_or_else(|| RegistryError::ConnectionNotFound(id.clone()))?;

        entry
            .transport
            .send(msg)
            .map_err(|_| RegistryError::TransportClosed(id.clone()))
    }

    /// Asks every writer to close its session.
    fn handle_close_all(&self, code: u16, reason: &str) {
        info!(
            connections = self.connections.len(),
            "Closing all connections"
        );

        for (id, entry) in &self.connections {
            let msg = Outbound::Close {
                code,
                reason: reason.to_string(),
            };
            if entry.transport.send(msg).is_err() {
                debug!(connection_id = %id, "Writer already stopped");
            }
        }
    }
}
