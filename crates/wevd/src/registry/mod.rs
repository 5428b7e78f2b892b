//! Connection registry using Actor pattern.
//!
//! The registry is the central state manager for all live connections.
//! It receives commands via a tokio mpsc channel and maintains the canonical
//! source of truth for connection data.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ConnectionHandler│────▶│  RegistryActor  │────▶│  writer task     │
//! │ / ClientHandle  │     │                 │     │ (per connection) │
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   Outbound            │
//!         │   (mpsc channel)      │   (unbounded mpsc)    │
//!         ▼                       ▼                       ▼
//!   Register/Ready/          HashMap<ConnectionId,   WebSocket sink
//!   Send/Close/Unregister    ConnectionEntry>
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

use wev_core::IdAllocator;

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_CONNECTIONS};
pub use commands::{
    Outbound, PublicRecord, RegistryCommand, RegistryError, TransportHandle,
};
pub use handle::RegistryHandle;

/// Channel buffer size
const COMMAND_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// The actor stops once every handle (including those held inside
/// client handles) has been dropped.
///
/// # Example
///
/// ```no_run
/// use wevd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(1024, 16);
///     let ready = handle.ready_snapshot().await;
///     assert!(ready.is_empty());
/// }
/// ```
pub fn spawn_registry(max_connections: usize, id_max_attempts: usize) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = RegistryActor::new(cmd_rx, IdAllocator::new(id_max_attempts), max_connections);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx)
}
