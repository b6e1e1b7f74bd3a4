//! # Error Definitions
//!
//! Failures of the wire layer itself, plus the error body carried by an
//! `error` record when the remote side fails.

use serde::Deserialize;
use serde::Serialize;

/// Operational failures within the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The record could not be serialized.
    Encode(String),
    /// The line was not a well-formed record (bad JSON, unknown `type`, missing `id`).
    Malformed(String),
    /// The line was empty after trimming the delimiter.
    EmptyRecord,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "Failed to encode record: {}", msg),
            Self::Malformed(msg) => write!(f, "Malformed record: {}", msg),
            Self::EmptyRecord => write!(f, "Empty record"),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a remote call failed (the payload of an `error` record).
///
/// These are distinct from `Error`; these describe the *remote* side failing,
/// whereas `Error` describes the wire failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler ran and returned an error or panicked.
    RemoteInvocation,
    /// No capability or handle matched the request target.
    TargetNotFound,
    /// The target exists but does not answer this method.
    MethodNotFound,
    /// The arguments did not have the shape the method expects.
    BadArguments,
    /// The responding side lost its transport before it could answer.
    TransportClosed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemoteInvocation => "remote_invocation",
            Self::TargetNotFound => "target_not_found",
            Self::MethodNotFound => "method_not_found",
            Self::BadArguments => "bad_arguments",
            Self::TransportClosed => "transport_closed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{message, kind}` as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub kind: ErrorKind,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind }
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
