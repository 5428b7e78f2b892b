//! Return-value dispatcher.
//!
//! Runs one handler on behalf of one connection and turns whatever it
//! returns into an implicit reply on that same connection. The reply is
//! only built after the handler's future has resolved, and it always
//! targets the handle the handler was invoked with.

use thiserror::Error;
use tracing::{debug, warn};

use wev_protocol::{Reply, ReplyError};

use crate::client::{ClientError, ClientHandle};
use crate::handlers::Handler;

/// Failure of one handler invocation.
///
/// Returned to the lifecycle controller, which logs it and moves on.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handler itself returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The handler returned an aggregate that does not name an event.
    #[error("invalid reply: {0}")]
    InvalidReply(#[from] ReplyError),

    /// The reply could not be delivered.
    #[error("reply not delivered: {0}")]
    Emit(#[from] ClientError),
}

/// Invokes `handler` for `client` and sends its implicit reply.
///
/// Primitive and `null` results send nothing.
///
/// # Errors
///
/// - `DispatchError::Handler` if the handler fails
/// - `DispatchError::InvalidReply` if the result names no event
/// - `DispatchError::Emit` if the connection closed before the reply
pub async fn invoke<A>(
    handler: &Handler<A>,
    client: &ClientHandle,
    input: A,
) -> Result<(), DispatchError> {
    let value = handler(client.clone(), input)
        .await
        .map_err(DispatchError::Handler)?;

    let reply = Reply::from_value(value).map_err(|e| {
        warn!(connection_id = %client.id(), error = %e, "Handler returned an unusable reply");
        e
    })?;

    match reply.into_envelope() {
        Some(envelope) => {
            debug!(
                connection_id = %client.id(),
                event = %envelope.event,
                "Sending implicit reply"
            );
            client.emit_envelope(&envelope).await?;
        }
        None => {
            debug!(connection_id = %client.id(), "Handler returned no reply");
        }
    }

    Ok(())
}
