//! # RPC Peer with Async Pump
//!
//! This module provides the `Peer`: one end of a duplex RPC session. A single
//! pump task drains the transport and demultiplexes what it reads:
//!
//! - `response` / `error` records resolve the pending call with the same id.
//! - `request` records are dispatched on their own task, so a slow handler
//!   never stalls the pump or other handlers.
//!
//! ## Invariants
//!
//! - Call ids and handle ids are unique for the lifetime of the peer.
//! - Every pending call resolves exactly once: with its reply, with a write
//!   failure, with a timeout, or with `TransportClosed` when the pump ends.
//!   A caller that stops waiting takes its entry with it.
//! - Reserved marker shapes never travel as plain values in either direction.
//! - Once closed, a peer stays closed and rejects `invoke` immediately.
//! - The capability table is frozen when the peer starts.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use plugwire::CLOSE_METHOD;
use plugwire::ErrorBody;
use plugwire::ErrorKind;
use plugwire::HandleKind;
use plugwire::HandleRef;
use plugwire::Message;
use plugwire::NEXT_METHOD;
use plugwire::RELEASE_METHOD;
use plugwire::Target;

use crate::builder::PeerConfig;
use crate::handle::Capability;
use crate::handle::Fault;
use crate::handle::Local;
use crate::handle::ValueStream;
use crate::remote::RemoteObject;
use crate::remote::RemoteStream;
use crate::transport;
use crate::transport::Outbox;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// The peer's transport ended or broke; terminal for the peer.
    TransportClosed(String),
    /// A write for this call failed.
    Transport(transport::Error),
    /// The record could not be encoded.
    Wire(plugwire::Error),
    /// The remote handler failed, or the target/method did not exist.
    Remote(ErrorBody),
    /// The reply did not arrive within the configured call timeout.
    Timeout,
    /// The peer behind a proxy has been dropped.
    PeerDropped,
    /// A capability name was registered twice.
    DuplicateCapability(String),
    /// A plain value was expected but a handle came back.
    UnexpectedHandle,
    /// An argument had the shape of a handle or end-of-stream marker.
    ReservedValue,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportClosed(reason) => write!(f, "Transport closed: {}", reason),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Remote(body) => write!(f, "Remote failure: {}", body),
            Self::Timeout => write!(f, "Request timed out"),
            Self::PeerDropped => write!(f, "Peer has been dropped"),
            Self::DuplicateCapability(name) => write!(f, "Capability '{}' is already registered", name),
            Self::UnexpectedHandle => write!(f, "Expected a plain value, got a handle"),
            Self::ReservedValue => write!(f, "Value has a reserved marker shape"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<plugwire::Error> for Error {
    fn from(e: plugwire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        match e {
            Error::Remote(body) => Fault { kind: body.kind, message: body.message },
            other => Fault::new(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An entry in the handle table.
#[derive(Clone)]
enum Entry {
    Object(Arc<dyn Capability>),
    Stream(Arc<Mutex<ValueStream>>),
}

pub(crate) struct Inner {
    name: String,
    config: PeerConfig,
    outbox: Outbox,
    capabilities: HashMap<String, Arc<dyn Capability>>,
    pending: DashMap<u64, oneshot::Sender<Result<Value>>>,
    handles: DashMap<u64, Entry>,
    next_call: AtomicU64,
    next_handle: AtomicU64,
    closed: AtomicBool,
    close_reason: OnceLock<String>,
    closed_tx: watch::Sender<bool>,
    pump: OnceLock<AbortHandle>,
}

/// One end of an RPC session.
///
/// The peer spawns a background task that continuously reads from the
/// transport, routing replies to pending calls and requests to capabilities.
/// Cloning is cheap; all clones share the same session.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<Inner>,
}

impl Peer {
    /// Starts the pump and writer tasks. Must be called inside a tokio runtime.
    pub(crate) fn start(
        name: String,
        config: PeerConfig,
        capabilities: HashMap<String, Arc<dyn Capability>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            name,
            config,
            outbox: Outbox::spawn(transport.clone()),
            capabilities,
            pending: DashMap::new(),
            handles: DashMap::new(),
            next_call: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            closed_tx,
            pump: OnceLock::new(),
        });

        let pump_inner = inner.clone();
        let pump = tokio::spawn(async move {
            let reason = loop {
                match transport.recv().await {
                    Ok(Some(line)) => pump_inner.handle_line(&line),
                    Ok(None) => break "End of input stream".to_string(),
                    Err(e) => {
                        tracing::warn!(peer = %pump_inner.name, error = %e, "transport error in pump");
                        break e.to_string();
                    }
                }
            };
            pump_inner.terminate(reason);
        });
        let _ = inner.pump.set(pump.abort_handle());

        tracing::debug!(peer = %inner.name, "peer started");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Returns the peer name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Calls `method` on a remote capability or handle.
    ///
    /// Arguments are lowered with `to_wire`; the result is lifted with
    /// `from_wire`. Replies are correlated by id only, so concurrent calls may
    /// complete in any order.
    pub async fn invoke(
        &self,
        target: impl Into<Target>,
        method: &str,
        args: Vec<Local>,
    ) -> Result<Local> {
        let value = self.inner.invoke_raw(target.into(), method, args).await?;
        Ok(self.inner.from_wire(value))
    }

    /// Like `invoke`, for callers that only deal in plain data.
    pub async fn call(
        &self,
        target: impl Into<Target>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let args = args.into_iter().map(Local::Value).collect();
        match self.invoke(target, method, args).await? {
            Local::Value(value) => Ok(value),
            _ => Err(Error::UnexpectedHandle),
        }
    }

    /// Lowers a local value for the wire, registering objects and streams in
    /// the handle table.
    pub fn to_wire(&self, value: Local) -> Value {
        self.inner.to_wire(value)
    }

    /// Lifts a wire value, turning handle markers into proxies bound to this peer.
    pub fn from_wire(&self, value: Value) -> Local {
        self.inner.from_wire(value)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Why the peer closed, once it has.
    pub fn close_reason(&self) -> Option<&str> {
        self.inner.close_reason.get().map(String::as_str)
    }

    /// Resolves once the peer has closed. The host learns about transport loss
    /// here; nothing else is torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stops the pump and fails every pending call, as if the transport had
    /// closed. Records already queued are written, then the write half is
    /// closed so the other side sees end-of-input.
    pub fn shutdown(&self) {
        if let Some(pump) = self.inner.pump.get() {
            pump.abort();
        }
        self.inner.terminate("Shut down by host".to_string());
        self.inner.outbox.close();
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of local objects and streams currently exposed to the other side.
    pub fn handle_count(&self) -> usize {
        self.inner.handles.len()
    }
}

impl Inner {
    fn closed_error(&self) -> Error {
        let reason = self.close_reason.get().cloned().unwrap_or_else(|| "Peer closed".to_string());
        Error::TransportClosed(reason)
    }

    pub(crate) async fn invoke_raw(
        self: &Arc<Self>,
        target: Target,
        method: &str,
        args: Vec<Local>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        if args.iter().any(|arg| matches!(arg, Local::Value(value) if plugwire::is_reserved(value))) {
            return Err(Error::ReservedValue);
        }

        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let args = args.into_iter().map(|arg| self.to_wire(arg)).collect();
        let payload = plugwire::encode(&Message::request(id, target, method, args))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _waiting = PendingCall { pending: &self.pending, id };

        // lost the race with terminate: either we take the entry back, or the
        // drain already answered it through rx
        if self.closed.load(Ordering::SeqCst) && self.pending.remove(&id).is_some() {
            return Err(self.closed_error());
        }

        let weak = Arc::downgrade(self);
        self.outbox.post(payload, Box::new(move |e| {
            let Some(inner) = weak.upgrade() else { return };
            if let Some((_, tx)) = inner.pending.remove(&id) {
                let _ = tx.send(Err(Error::Transport(e)));
            }
        }));

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Error::Timeout),
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            // the sender only disappears without answering if the peer itself is gone
            Err(_) => Err(Error::PeerDropped),
        }
    }

    fn to_wire(&self, value: Local) -> Value {
        match value {
            Local::Value(value) => value,
            Local::Object(capability) => self.register(HandleKind::Object, Entry::Object(capability)),
            Local::Stream(stream) => self.register(HandleKind::Stream, Entry::Stream(Arc::new(Mutex::new(stream)))),
            Local::RemoteObject(object) => self.register(HandleKind::Object, Entry::Object(Arc::new(object))),
            Local::RemoteStream(stream) => {
                let stream = stream.into_stream();
                self.register(HandleKind::Stream, Entry::Stream(Arc::new(Mutex::new(stream))))
            }
        }
    }

    fn register(&self, kind: HandleKind, entry: Entry) -> Value {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, entry);
        HandleRef { id, kind }.to_value()
    }

    fn from_wire(self: &Arc<Self>, value: Value) -> Local {
        match HandleRef::from_value(&value) {
            Some(HandleRef { id, kind: HandleKind::Object }) => {
                Local::RemoteObject(RemoteObject::new(id, Arc::downgrade(self)))
            }
            Some(HandleRef { id, kind: HandleKind::Stream }) => {
                Local::RemoteStream(RemoteStream::new(id, Arc::downgrade(self)))
            }
            None => Local::Value(value),
        }
    }

    /// Classifies one inbound record. Never blocks on a handler.
    fn handle_line(self: &Arc<Self>, line: &[u8]) {
        let msg = match plugwire::decode(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %self.name, error = %e, "protocol error, dropping record");
                self.answer_malformed(line, &e);
                return;
            }
        };

        match msg {
            Message::Request { id, target, method, args } => {
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.dispatch(id, target, method, args).await;
                });
            }
            Message::Response { id, value } => self.resolve(id, Ok(value)),
            Message::Error { id, error } => self.resolve(id, Err(Error::Remote(error))),
        }
    }

    /// A request that failed to decode still gets an error back if its id is
    /// recoverable, so the caller does not wait forever.
    fn answer_malformed(&self, line: &[u8], error: &plugwire::Error) {
        let Ok(raw) = serde_json::from_slice::<Value>(line) else { return };
        if raw.get("type").and_then(Value::as_str) != Some("request") {
            return;
        }
        if let Some(id) = plugwire::decode_id(line) {
            self.reply(Message::error(id, ErrorKind::BadArguments, error.to_string()));
        }
    }

    fn resolve(&self, id: u64, result: Result<Value>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::warn!(peer = %self.name, id, "protocol error, reply for unknown call id");
            }
        }
    }

    async fn dispatch(self: Arc<Self>, id: u64, target: Target, method: String, args: Vec<Value>) {
        tracing::debug!(peer = %self.name, id, %target, %method, "dispatching request");
        let reply = match self.execute(target, &method, args).await {
            Ok(value) => Message::response(id, value),
            Err(fault) => {
                tracing::debug!(peer = %self.name, id, %fault, "request failed");
                Message::Error { id, error: fault.into() }
            }
        };
        self.reply(reply);
    }

    async fn execute(self: &Arc<Self>, target: Target, method: &str, args: Vec<Value>) -> std::result::Result<Value, Fault> {
        let entry = match &target {
            Target::Capability(name) => self.capabilities.get(name).cloned().map(Entry::Object),
            Target::Handle(id) => self.handles.get(id).map(|entry| entry.value().clone()),
        };
        let Some(entry) = entry else {
            return Err(Fault {
                kind: ErrorKind::TargetNotFound,
                message: format!("No capability or handle for target {}", target),
            });
        };

        match (entry, target) {
            (Entry::Object(_), Target::Handle(id)) if method == RELEASE_METHOD => {
                self.handles.remove(&id);
                Ok(Value::Null)
            }
            (Entry::Object(capability), _) => self.call_object(capability, method, args).await,
            (Entry::Stream(stream), Target::Handle(id)) => match method {
                NEXT_METHOD => self.pull(id, stream).await,
                CLOSE_METHOD => {
                    self.handles.remove(&id);
                    Ok(Value::Null)
                }
                other => Err(Fault::method_not_found(other)),
            },
            (Entry::Stream(_), Target::Capability(_)) => Err(Fault::method_not_found(method)),
        }
    }

    async fn call_object(self: &Arc<Self>, capability: Arc<dyn Capability>, method: &str, args: Vec<Value>) -> std::result::Result<Value, Fault> {
        let args = args.into_iter().map(|arg| self.from_wire(arg)).collect();
        match AssertUnwindSafe(capability.call(method, args)).catch_unwind().await {
            Ok(Ok(Local::Value(value))) if plugwire::is_reserved(&value) => {
                Err(Fault::new("Handler returned a reserved marker shape"))
            }
            Ok(Ok(result)) => Ok(self.to_wire(result)),
            Ok(Err(fault)) => Err(fault),
            Err(panic) => Err(Fault::new(format!("Handler panicked: {}", panic_message(&*panic)))),
        }
    }

    /// Answers `next` on a stream handle. The stream lock keeps elements in
    /// production order; exhaustion releases the handle.
    async fn pull(&self, id: u64, stream: Arc<Mutex<ValueStream>>) -> std::result::Result<Value, Fault> {
        let mut stream = stream.lock().await;
        match AssertUnwindSafe(stream.next()).catch_unwind().await {
            Ok(Some(Ok(value))) if plugwire::is_reserved(&value) => {
                Err(Fault::new("Stream produced a reserved marker shape"))
            }
            Ok(Some(item)) => item,
            Ok(None) => {
                self.handles.remove(&id);
                Ok(plugwire::end_of_stream())
            }
            Err(panic) => Err(Fault::new(format!("Stream panicked: {}", panic_message(&*panic)))),
        }
    }

    fn reply(&self, msg: Message) {
        let id = msg.id();
        let payload = match plugwire::encode(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(peer = %self.name, id, error = %e, "failed to encode reply");
                return;
            }
        };
        let name = self.name.clone();
        self.outbox.post(payload, Box::new(move |e| {
            tracing::warn!(peer = %name, id, error = %e, "reply could not be written");
        }));
    }

    /// Enters the terminal state and fails every pending call. Idempotent.
    fn terminate(&self, reason: String) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_reason.set(reason.clone());

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::TransportClosed(reason.clone())));
            }
        }

        tracing::info!(peer = %self.name, %reason, failed_calls = count, "peer closed");
        self.closed_tx.send_replace(true);
    }
}

/// Removes a call's pending entry when its caller stops waiting, whether it
/// got an answer or was cancelled. Removal after an answer is a no-op.
struct PendingCall<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Result<Value>>>,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
