//! wev Protocol - Wire envelope for named-event traffic
//!
//! Every transport message carries exactly one [`Envelope`]:
//!
//! ```text
//! {"type": "<event name>", "args": [ ...positional... ] | { ...named... }}
//! ```
//!
//! This crate provides the envelope type and its encode/decode rules, and
//! the [`Reply`] classification that turns a handler's return value into
//! an outbound envelope.

pub mod envelope;
pub mod reply;

pub use envelope::{decode, decode_bounded, encode, Args, Envelope, ParseFailure};
pub use reply::{Reply, ReplyError};
