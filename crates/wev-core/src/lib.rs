//! wev Core - Shared types for the wev event server
//!
//! This crate provides the domain types shared between the wire
//! protocol (`wev-protocol`) and the server (`wevd`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod id;

// Re-exports for convenience
pub use connection::{ConnectionId, ConnectionState};
pub use error::{DomainError, DomainResult};
pub use id::{IdAllocator, IdSource, RandomDigits, DEFAULT_MAX_ATTEMPTS};
