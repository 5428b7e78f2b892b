//! wevd - Named-event request/response server over WebSocket
//!
//! This crate provides:
//! - `registry` - Connection registry actor (ids, readiness, transports)
//! - `server` - WebSocket accept loop and per-connection lifecycle
//! - `handlers` - Handler table with lifecycle hooks
//! - `dispatch` - Turns handler return values into implicit replies
//! - `directory` - Read-only view over ready connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventServer                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│────▶│     RegistryActor           │   │
//! │  │  (per client)   │     │  (connection state owner)   │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ frames                      │ Outbound          │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   dispatch      │     │   writer task               │   │
//! │  │ (handler+reply) │     │   (per connection)          │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use wev_protocol::Args;
//! use wevd::{ClientHandle, EventServer, HandlerTable, ServerConfig};
//!
//! async fn sum(_client: ClientHandle, args: Args) -> anyhow::Result<Value> {
//!     let (a, b): (i64, i64) = args.deserialize()?;
//!     Ok(json!(["sumResult", a + b]))
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handlers = HandlerTable::builder().on("sum", sum).build()?;
//!
//!     EventServer::new(ServerConfig::default(), handlers).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate does not call `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()` or `todo!()`. Handler panics are caught
//! per event.

pub mod client;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod handlers;
pub mod registry;
pub mod server;

pub use client::{ClientError, ClientHandle, CloseInfo, ConnectInfo, PublicData};
pub use config::{ConfigError, ServerConfig};
pub use directory::Directory;
pub use dispatch::DispatchError;
pub use handlers::{HandlerTable, HandlerTableBuilder, HandshakeRejection};
pub use server::{EventServer, ServerError};
