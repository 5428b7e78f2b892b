//! Domain-specific error types following panic-free policy.

use crate::ConnectionState;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No free identifier was found within the retry budget
    #[error("Identifier allocation exhausted after {attempts} attempts")]
    AllocationExhausted { attempts: usize },

    /// A lifecycle transition that would move a connection backwards
    #[error("Invalid connection state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
