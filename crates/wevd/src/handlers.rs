//! Handler table: event names mapped to application handlers.
//!
//! Application event handlers are registered with [`HandlerTableBuilder::on`].
//! The lifecycle hooks have their own typed setters because their inputs
//! differ from event arguments:
//!
//! | Hook            | Setter            | Input                        |
//! |-----------------|-------------------|------------------------------|
//! | `connection`    | `on_connection`   | [`ConnectInfo`]              |
//! | `close`         | `on_close`        | [`CloseInfo`]                |
//! | `checkHeaders`  | `check_headers`   | request info + response headers |
//!
//! `error` is reserved as well; transport errors are only logged.
//! Registering any reserved name through `on` is rejected by `build`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_tungstenite::tungstenite::http::HeaderMap;

use wev_protocol::Args;

use crate::client::{ClientHandle, CloseInfo, ConnectInfo};
use crate::config::ConfigError;

/// Reserved hook: connection established.
pub const EVENT_CONNECTION: &str = "connection";

/// Reserved hook: connection closed.
pub const EVENT_CLOSE: &str = "close";

/// Reserved hook: inspect or amend the handshake response headers.
pub const EVENT_CHECK_HEADERS: &str = "checkHeaders";

/// Reserved, unused hook name.
pub const EVENT_ERROR: &str = "error";

/// Names that cannot be used for application events.
pub const RESERVED_EVENTS: [&str; 4] = [EVENT_CONNECTION, EVENT_CLOSE, EVENT_CHECK_HEADERS, EVENT_ERROR];

/// Future returned by every handler.
///
/// The resolved value is turned into an implicit reply (see
/// [`wev_protocol::Reply`]); return `Value::Null` to send nothing.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A handler taking input `A` in the context of one connection.
pub type Handler<A> = Arc<dyn Fn(ClientHandle, A) -> HandlerFuture + Send + Sync>;

/// Application event handler.
pub type EventHandler = Handler<Args>;

/// `connection` hook.
pub type ConnectHandler = Handler<Arc<ConnectInfo>>;

/// `close` hook.
pub type CloseHandler = Handler<CloseInfo>;

/// `checkHeaders` hook.
///
/// Runs before any connection exists, so it cannot emit events. It may
/// add response headers or refuse the upgrade.
pub type HeadersHook =
    Arc<dyn Fn(&ConnectInfo, &mut HeaderMap) -> Result<(), HandshakeRejection> + Send + Sync>;

/// Refusal of a WebSocket upgrade by the `checkHeaders` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    /// HTTP status sent instead of `101 Switching Protocols`
    pub status: u16,

    /// Response body
    pub reason: String,
}

impl HandshakeRejection {
    /// Rejects with an explicit status.
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// `401 Unauthorized`.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(401, reason)
    }

    /// `403 Forbidden`.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(403, reason)
    }
}

fn boxed<A, F, Fut>(handler: F) -> Handler<A>
where
    F: Fn(ClientHandle, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |client, input| -> HandlerFuture { Box::pin(handler(client, input)) })
}

// ============================================================================
// Handler Table
// ============================================================================

/// Immutable table of handlers shared by every connection of a server.
#[derive(Clone, Default)]
pub struct HandlerTable {
    events: HashMap<String, EventHandler>,
    on_connection: Option<ConnectHandler>,
    on_close: Option<CloseHandler>,
    check_headers: Option<HeadersHook>,
}

impl HandlerTable {
    /// Starts building a table.
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    /// Handler for application event `name`.
    ///
    /// Reserved hook names never match.
    pub fn event(&self, name: &str) -> Option<&EventHandler> {
        self.events.get(name)
    }

    /// `connection` hook, if set.
    pub fn connection(&self) -> Option<&ConnectHandler> {
        self.on_connection.as_ref()
    }

    /// `close` hook, if set.
    pub fn close(&self) -> Option<&CloseHandler> {
        self.on_close.as_ref()
    }

    /// `checkHeaders` hook, if set.
    pub fn headers(&self) -> Option<&HeadersHook> {
        self.check_headers.as_ref()
    }

    /// Registered application event names.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.event_names().collect();
        names.sort_unstable();
        f.debug_struct("HandlerTable")
            .field("events", &names)
            .field("connection", &self.on_connection.is_some())
            .field("close", &self.on_close.is_some())
            .field("check_headers", &self.check_headers.is_some())
            .finish()
    }
}

/// Builder for [`HandlerTable`].
///
/// Registration problems are collected and reported once by [`build`](Self::build).
#[derive(Default)]
pub struct HandlerTableBuilder {
    events: Vec<(String, EventHandler)>,
    on_connection: Option<ConnectHandler>,
    on_close: Option<CloseHandler>,
    check_headers: Option<HeadersHook>,
}

impl HandlerTableBuilder {
    /// Registers a handler for application event `event`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use serde_json::{json, Value};
    /// use wev_protocol::Args;
    /// use wevd::handlers::HandlerTable;
    /// use wevd::ClientHandle;
    ///
    /// async fn sum(_client: ClientHandle, args: Args) -> anyhow::Result<Value> {
    ///     let (a, b): (i64, i64) = args.deserialize()?;
    ///     Ok(json!(["sumResult", a + b]))
    /// }
    ///
    /// let table = HandlerTable::builder().on("sum", sum).build();
    /// assert!(table.is_ok());
    /// ```
    pub fn on<F, Fut>(mut self, event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ClientHandle, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.events.push((event.into(), boxed(handler)));
        self
    }

    /// Sets the `connection` hook.
    ///
    /// The new connection is hidden from directory enumeration until this
    /// hook's future completes.
    pub fn on_connection<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ClientHandle, Arc<ConnectInfo>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_connection = Some(boxed(handler));
        self
    }

    /// Sets the `close` hook.
    ///
    /// Runs after the connection has left the registry; `emit` and
    /// `close` on its handle fail with a stale-connection error.
    pub fn on_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ClientHandle, CloseInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_close = Some(boxed(handler));
        self
    }

    /// Sets the `checkHeaders` hook.
    pub fn check_headers<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnectInfo, &mut HeaderMap) -> Result<(), HandshakeRejection>
            + Send
            + Sync
            + 'static,
    {
        self.check_headers = Some(Arc::new(hook));
        self
    }

    /// Validates registrations and freezes the table.
    ///
    /// # Errors
    ///
    /// - `ConfigError::EmptyEventName` for an empty event name
    /// - `ConfigError::ReservedEvent` if `on` was used with a hook name
    /// - `ConfigError::DuplicateEvent` if a name was registered twice
    pub fn build(self) -> Result<HandlerTable, ConfigError> {
        let mut events = HashMap::with_capacity(self.events.len());

        for (name, handler) in self.events {
            if name.is_empty() {
                return Err(ConfigError::EmptyEventName);
            }
            if RESERVED_EVENTS.contains(&name.as_str()) {
                return Err(ConfigError::ReservedEvent(name));
            }
            if events.contains_key(&name) {
                return Err(ConfigError::DuplicateEvent(name));
            }
            events.insert(name, handler);
        }

        Ok(HandlerTable {
            events,
            on_connection: self.on_connection,
            on_close: self.on_close,
            check_headers: self.check_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[test]
    fn test_build_table() {
        let table = HandlerTable::builder()
            .on("ping", |_c, _a| async { Ok(json!(["pong"])) })
            .on("echo", |_c, a: Args| async move { Ok(a.into_value()) })
            .on_connection(|_c, _info| async { Ok(Value::Null) })
            .build()
            .unwrap();

        assert!(table.event("ping").is_some());
        assert!(table.event("echo").is_some());
        assert!(table.event("nope").is_none());
        assert!(table.connection().is_some());
        assert!(table.close().is_none());
        assert!(table.headers().is_none());

        let mut names: Vec<&str> = table.event_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["echo", "ping"]);
    }

    #[test]
    fn test_reserved_names_rejected() {
        for name in RESERVED_EVENTS {
            let err = HandlerTable::builder()
                .on(name, |_c, _a| async { Ok(Value::Null) })
                .build()
                .unwrap_err();
            assert!(matches!(err, ConfigError::ReservedEvent(ref n) if n == name));
        }
    }

    #[test]
    fn test_check_headers_cannot_be_registered_as_event() {
        let err = HandlerTable::builder()
            .on("checkHeaders", |_c, _a| async { Ok(json!(["hello"])) })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("checkHeaders"));
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let err = HandlerTable::builder()
            .on("a", |_c, _a| async { Ok(Value::Null) })
            .on("a", |_c, _a| async { Ok(Value::Null) })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEvent(_)));

        let err = HandlerTable::builder()
            .on("", |_c, _a| async { Ok(Value::Null) })
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyEventName));
    }

    #[test]
    fn test_headers_hook_mutates_headers() {
        let table = HandlerTable::builder()
            .check_headers(|info, headers| {
                if info.header("x-deny").is_some() {
                    return Err(HandshakeRejection::forbidden("denied"));
                }
                headers.insert("x-server", HeaderValue::from_static("wev"));
                Ok(())
            })
            .build()
            .unwrap();

        let hook = table.headers().unwrap();
        let mut headers = HeaderMap::new();
        hook(&ConnectInfo::default(), &mut headers).unwrap();
        assert_eq!(headers.get("x-server").and_then(|v| v.to_str().ok()), Some("wev"));

        let denied = ConnectInfo {
            headers: vec![("x-deny".to_string(), "1".to_string())],
            ..ConnectInfo::default()
        };
        let err = hook(&denied, &mut HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, 403);
    }
}
