//! Connection identity and lifecycle state.

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a live connection.
///
/// Wraps an opaque string (the default allocator produces decimal digits,
/// e.g. "4830012957731846"). Unique only among currently-registered
/// connections; an id may be reused after its connection closes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a new ConnectionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle state of a connection.
///
/// Transitions only move forward: `New -> Ready -> Closed`, or
/// `New -> Closed` when the peer leaves during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, connection handler still running; hidden from enumeration
    #[default]
    New,

    /// Connection handler finished; visible to enumeration
    Ready,

    /// Transport session closed; registry entry removed
    Closed,
}

impl ConnectionState {
    /// Moves to `next`, rejecting backward or repeated transitions.
    pub fn advance(self, next: ConnectionState) -> DomainResult<ConnectionState> {
        let allowed = matches!(
            (self, next),
            (Self::New, Self::Ready) | (Self::New, Self::Closed) | (Self::Ready, Self::Closed)
        );

        if allowed {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Returns true once the connect handler has completed and the
    /// session is still open.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
