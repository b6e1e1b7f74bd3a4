//! # Capabilities and Local Values
//!
//! What a peer can expose, and the values that flow through `invoke` before
//! they are lowered to the wire.
//!
//! Objects are not reflected over. Anything callable from the other side
//! implements `Capability`: a single async entry point taking the method name
//! and the already-lifted arguments. The peer keeps these behind ids in its
//! handle table; the other side only ever sees the id.

use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use plugwire::CALL_METHOD;
use plugwire::ErrorBody;
use plugwire::ErrorKind;

use crate::remote::RemoteObject;
use crate::remote::RemoteStream;

/// A handler failure, returned to the caller as an `error` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    /// A failure raised by the handler itself.
    pub fn new(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::RemoteInvocation, message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            kind: ErrorKind::MethodNotFound,
            message: format!("No such method: {}", method),
        }
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self { kind: ErrorKind::BadArguments, message: message.into() }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

impl From<Fault> for ErrorBody {
    fn from(fault: Fault) -> Self {
        ErrorBody::new(fault.kind, fault.message)
    }
}

impl From<serde_json::Error> for Fault {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_arguments(e.to_string())
    }
}

/// Something the other side can call methods on.
#[async_trait::async_trait]
pub trait Capability: Send + Sync + 'static {
    async fn call(&self, method: &str, args: Vec<Local>) -> Result<Local, Fault>;
}

/// A lazy, possibly infinite sequence handed out as a stream handle.
pub type ValueStream = BoxStream<'static, Result<Value, Fault>>;

/// A value on the local side of the wire.
///
/// `Value` passes through unchanged. `Object` and `Stream` are registered in
/// the handle table when sent. `RemoteObject` and `RemoteStream` are proxies
/// for handles owned by the other side.
pub enum Local {
    Value(Value),
    Object(Arc<dyn Capability>),
    Stream(ValueStream),
    RemoteObject(RemoteObject),
    RemoteStream(RemoteStream),
}

impl Local {
    pub fn null() -> Self {
        Self::Value(Value::Null)
    }

    pub fn object(capability: impl Capability) -> Self {
        Self::Object(Arc::new(capability))
    }

    /// Wraps an infallible sequence.
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Value> + Send + 'static,
    {
        Self::Stream(stream.map(Ok).boxed())
    }

    /// Wraps a sequence whose elements may fail.
    pub fn try_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Value, Fault>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_remote_object(self) -> Option<RemoteObject> {
        match self {
            Self::RemoteObject(object) => Some(object),
            _ => None,
        }
    }

    pub fn into_remote_stream(self) -> Option<RemoteStream> {
        match self {
            Self::RemoteStream(stream) => Some(stream),
            _ => None,
        }
    }
}

impl From<Value> for Local {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::RemoteObject(object) => f.debug_tuple("RemoteObject").field(&object.id()).finish(),
            Self::RemoteStream(stream) => f.debug_tuple("RemoteStream").field(&stream.id()).finish(),
        }
    }
}

type Handler = dyn Fn(Vec<Local>) -> BoxFuture<'static, Result<Local, Fault>> + Send + Sync;

/// A bare callable, answering only `call`.
pub struct Function {
    handler: Box<Handler>,
}

impl Function {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Local>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Local, Fault>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |args| Box::pin(f(args))),
        }
    }
}

#[async_trait::async_trait]
impl Capability for Function {
    async fn call(&self, method: &str, args: Vec<Local>) -> Result<Local, Fault> {
        if method != CALL_METHOD {
            return Err(Fault::method_not_found(method));
        }
        (self.handler)(args).await
    }
}

/// Shorthand for exposing a closure as a capability.
pub fn function<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Vec<Local>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Local, Fault>> + Send + 'static,
{
    Arc::new(Function::new(f))
}
