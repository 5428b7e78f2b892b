//! Envelope encode/decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Arguments carried by an envelope.
///
/// Positional arguments travel as a JSON array, named arguments as a
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
    /// `emit("x", a, b, c)` form
    Positional(Vec<Value>),

    /// `emit("x", {a, b, c})` form
    Named(Map<String, Value>),
}

impl Args {
    /// Empty positional argument list.
    pub fn empty() -> Self {
        Self::Positional(Vec::new())
    }

    /// Number of positional arguments, or named fields.
    pub fn len(&self) -> usize {
        match self {
            Self::Positional(values) => values.len(),
            Self::Named(fields) => fields.len(),
        }
    }

    /// Returns true if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positional argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Self::Positional(values) => values.get(index),
            Self::Named(_) => None,
        }
    }

    /// Named argument `key`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Positional(_) => None,
            Self::Named(fields) => fields.get(key),
        }
    }

    /// Converts the arguments to a single JSON value (array or object).
    pub fn into_value(self) -> Value {
        match self {
            Self::Positional(values) => Value::Array(values),
            Self::Named(fields) => Value::Object(fields),
        }
    }

    /// Deserializes the arguments into a typed value.
    ///
    /// Positional arguments map onto tuples or sequences, named
    /// arguments onto structs or maps.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.into_value())
    }
}

impl Default for Args {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl From<Map<String, Value>> for Args {
    fn from(fields: Map<String, Value>) -> Self {
        Self::Named(fields)
    }
}

/// One wire unit: an event name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name
    #[serde(rename = "type")]
    pub event: String,

    /// Event arguments
    pub args: Args,
}

impl Envelope {
    /// Creates an envelope from already-shaped arguments.
    pub fn new(event: impl Into<String>, args: Args) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Serializes the envelope to frame text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds an envelope from an argument list.
///
/// A list holding exactly one JSON object is sent in named form (the
/// object itself becomes `args`); any other list is sent positionally.
pub fn encode(event: impl Into<String>, mut args: Vec<Value>) -> Envelope {
    let args = if args.len() == 1 && args.first().is_some_and(Value::is_object) {
        match args.pop() {
            Some(Value::Object(fields)) => Args::Named(fields),
            Some(other) => Args::Positional(vec![other]),
            None => Args::empty(),
        }
    } else {
        Args::Positional(args)
    };

    Envelope::new(event, args)
}

/// Reasons an inbound frame could not be decoded.
///
/// These are never answered or escalated; the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The frame is valid JSON but not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// The `type` field is absent or not a string.
    #[error("missing or non-string `type` field")]
    MissingType,

    /// The frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// Parses frame text into an envelope.
///
/// A missing or `null` `args` decodes as an empty positional list; any
/// other non-aggregate `args` value becomes a one-element positional list.
pub fn decode(text: &str) -> Result<Envelope, ParseFailure> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;

    let Value::Object(mut object) = value else {
        return Err(ParseFailure::NotAnObject);
    };

    let event = match object.remove("type") {
        Some(Value::String(event)) => event,
        _ => return Err(ParseFailure::MissingType),
    };

    let args = match object.remove("args") {
        None | Some(Value::Null) => Args::empty(),
        Some(Value::Array(values)) => Args::Positional(values),
        Some(Value::Object(fields)) => Args::Named(fields),
        Some(scalar) => Args::Positional(vec![scalar]),
    };

    Ok(Envelope { event, args })
}

/// Parses frame text, rejecting frames larger than `max` bytes first.
pub fn decode_bounded(text: &str, max: usize) -> Result<Envelope, ParseFailure> {
    if text.len() > max {
        return Err(ParseFailure::TooLarge {
            size: text.len(),
            max,
        });
    }
    decode(text)
}
