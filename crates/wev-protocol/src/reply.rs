//! Implicit replies derived from handler return values.
//!
//! A handler answers the event that invoked it simply by returning a
//! value. The shape of that value decides what, if anything, goes back
//! to the same connection:
//!
//! | Return value                 | Outbound envelope                     |
//! |------------------------------|---------------------------------------|
//! | `null`, bool, number, string | none                                  |
//! | `["sumResult", 3]`           | `{"type":"sumResult","args":[3]}`     |
//! | `{"type":"ack","ok":true}`   | `{"type":"ack","args":{"ok":true}}`   |

use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{encode, Args, Envelope};

/// Classified handler return value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Primitive or null return: nothing is sent.
    NoReply,

    /// Array return: first element names the event, the rest are arguments.
    Positional { event: String, args: Vec<Value> },

    /// Object return: `type` names the event, remaining fields are arguments.
    Named {
        event: String,
        fields: Map<String, Value>,
    },
}

/// An aggregate return value that does not name a reply event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// Empty array, non-string first element, or missing/non-string `type`.
    #[error("reply value does not name an event: {0}")]
    MissingEventName(String),
}

impl Reply {
    /// Classifies a handler return value.
    pub fn from_value(value: Value) -> Result<Self, ReplyError> {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Ok(Self::NoReply)
            }
            Value::Array(items) => {
                let mut items = items.into_iter();
                match items.next() {
                    Some(Value::String(event)) => Ok(Self::Positional {
                        event,
                        args: items.collect(),
                    }),
                    Some(other) => Err(ReplyError::MissingEventName(other.to_string())),
                    None => Err(ReplyError::MissingEventName("[]".to_string())),
                }
            }
            Value::Object(mut fields) => match fields.remove("type") {
                Some(Value::String(event)) => Ok(Self::Named { event, fields }),
                Some(other) => Err(ReplyError::MissingEventName(other.to_string())),
                None => Err(ReplyError::MissingEventName(
                    Value::Object(fields).to_string(),
                )),
            },
        }
    }

    /// Returns true if nothing should be sent.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::NoReply)
    }

    /// Event name of the reply, if any.
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::NoReply => None,
            Self::Positional { event, .. } | Self::Named { event, .. } => Some(event),
        }
    }

    /// Builds the outbound envelope.
    ///
    /// Positional replies go through [`encode`], so `["x", {...}]` is
    /// delivered in named form just like `emit("x", {...})`.
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::NoReply => None,
            Self::Positional { event, args } => Some(encode(event, args)),
            Self::Named { event, fields } => Some(Envelope::new(event, Args::Named(fields))),
        }
    }
}
