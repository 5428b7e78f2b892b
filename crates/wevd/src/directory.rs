//! Read-only directory of live connections.
//!
//! [`Directory`] is the only view of the connection set that application
//! code gets. It can look a connection up by id and enumerate ready
//! connections; it has no way to add, remove or replace entries. The
//! registry is changed only by the connection lifecycle.

use wev_core::ConnectionId;

use crate::client::PublicData;
use crate::registry::RegistryHandle;

/// Read-only view over the connection registry.
///
/// Cheap to clone. Enumeration works on a snapshot taken through the
/// registry actor, so callbacks never run while the registry is locked
/// and may freely call back into the server (e.g. `emit`).
#[derive(Clone, Debug)]
pub struct Directory {
    registry: RegistryHandle,
}

impl Directory {
    pub(crate) fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Public data of connection `id`, if it is registered.
    ///
    /// Connections still running their connect handler are returned too;
    /// only enumeration hides them.
    pub async fn get(&self, id: impl Into<ConnectionId>) -> Option<PublicData> {
        self.registry.get(id.into()).await
    }

    /// Calls `f` for every ready connection.
    ///
    /// No ordering is guaranteed.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&PublicData),
    {
        for data in self.registry.ready_snapshot().await {
            f(&data);
        }
    }

    /// Maps every ready connection through `f`.
    ///
    /// No ordering is guaranteed.
    pub async fn map<T, F>(&self, f: F) -> Vec<T>
    where
        F: FnMut(&PublicData) -> T,
    {
        self.registry.ready_snapshot().await.iter().map(f).collect()
    }

    /// Number of ready connections.
    pub async fn len(&self) -> usize {
        self.registry.count(true).await
    }

    /// Returns true if no connection is ready.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
