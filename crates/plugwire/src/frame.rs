//! # Protocol Frames
//!
//! Defines the structure of the RPC envelope (request, response, error).
//!
//! ## Invariants
//! - **Tagged**: Every record carries a `type` of `request`, `response` or `error`.
//! - **Correlated**: Every record carries an integer `id`; a response or error
//!   reuses the id of the request it answers.
//! - **Forward Compatibility**: Unknown fields are ignored on decode.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorBody;
use crate::error::ErrorKind;

/// The addressee of a request: a root capability by name, or a handle by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Handle(u64),
    Capability(String),
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Capability(name.to_string())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Self::Capability(name)
    }
}

impl From<u64> for Target {
    fn from(id: u64) -> Self {
        Self::Handle(id)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handle(id) => write!(f, "handle-{}", id),
            Self::Capability(name) => write!(f, "{}", name),
        }
    }
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request {
        id: u64,
        target: Target,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Response {
        id: u64,
        #[serde(default)]
        value: Value,
    },
    Error {
        id: u64,
        error: ErrorBody,
    },
}

impl Message {
    pub fn request(id: u64, target: Target, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Request { id, target, method: method.into(), args }
    }

    pub fn response(id: u64, value: Value) -> Self {
        Self::Response { id, value }
    }

    pub fn error(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error { id, error: ErrorBody::new(kind, message) }
    }

    /// The correlation id, whatever the record type.
    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    /// True for `response` and `error` records.
    pub fn is_reply(&self) -> bool {
        !matches!(self, Self::Request { .. })
    }
}

// ============================================================================
//  IN-BAND MARKERS
// ============================================================================
//
// Two top-level shapes are reserved and never carried as plain data: an
// object whose only key is `__handle` holding `{id, kind}`, and `{"__end":
// true}`. Peers refuse to send either as a value. Nested occurrences, or
// objects with extra keys, are ordinary data.

/// Key of the object that stands in for a handle inside a value.
pub const HANDLE_KEY: &str = "__handle";

/// Key of the object that marks the end of a stream.
pub const END_KEY: &str = "__end";

/// Pulls the next element from a stream handle.
pub const NEXT_METHOD: &str = "next";

/// Releases a stream handle before it is exhausted.
pub const CLOSE_METHOD: &str = "close";

/// Releases an object handle.
pub const RELEASE_METHOD: &str = "__release";

/// The method a bare function capability answers.
pub const CALL_METHOD: &str = "call";

/// What a handle refers to on its owning side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    Object,
    Stream,
}

/// The opaque reference that crosses the wire in place of an object or stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub id: u64,
    pub kind: HandleKind,
}

impl HandleRef {
    pub fn object(id: u64) -> Self {
        Self { id, kind: HandleKind::Object }
    }

    pub fn stream(id: u64) -> Self {
        Self { id, kind: HandleKind::Stream }
    }

    /// Wraps the reference as `{"__handle": {"id": .., "kind": ..}}`.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(HANDLE_KEY.to_string(), serde_json::json!({ "id": self.id, "kind": self.kind }));
        Value::Object(map)
    }

    /// Recognises a handle marker. Any other value, including objects with
    /// extra keys, is plain data.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let inner = map.get(HANDLE_KEY)?;
        serde_json::from_value(inner.clone()).ok()
    }
}

/// The terminal value a stream handle answers `next` with once exhausted.
pub fn end_of_stream() -> Value {
    let mut map = serde_json::Map::new();
    map.insert(END_KEY.to_string(), Value::Bool(true));
    Value::Object(map)
}

pub fn is_end_of_stream(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.get(END_KEY) == Some(&Value::Bool(true)))
}

/// True for the top-level shapes that mean something to the peer runtime:
/// a handle marker or the end-of-stream marker.
pub fn is_reserved(value: &Value) -> bool {
    is_end_of_stream(value) || HandleRef::from_value(value).is_some()
}
