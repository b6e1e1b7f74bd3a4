//! Tests for the Peer over in-memory transports.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use rand::seq::SliceRandom;
use serde_json::Value;
use serde_json::json;

use plugwire::ErrorKind;
use plugwire::Message;
use plugwire::Target;

use crate::builder::PeerBuilder;
use crate::handle::Capability;
use crate::handle::Fault;
use crate::handle::Local;
use crate::mock_transport::DuplexChannelTransport;
use crate::peer::Error;
use crate::peer::Peer;
use crate::transport;
use crate::transport::Transport;

/// Test capability exercising plain calls, failures, streams and callbacks.
struct Calculator {
    produced: Arc<AtomicUsize>,
}

impl Calculator {
    fn new() -> Self {
        Self { produced: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait::async_trait]
impl Capability for Calculator {
    async fn call(&self, method: &str, args: Vec<Local>) -> Result<Local, Fault> {
        let mut args = args.into_iter();
        match method {
            "add" => {
                let sum: i64 = args.filter_map(|arg| arg.into_value()?.as_i64()).sum();
                Ok(Local::Value(json!(sum)))
            }
            "fail" => Err(Fault::new("boom")),
            "panic" => panic!("kaboom"),
            "count" => {
                let limit = args
                    .next()
                    .and_then(Local::into_value)
                    .and_then(|value| value.as_u64())
                    .ok_or_else(|| Fault::bad_arguments("count takes a number"))?;
                let produced = self.produced.clone();
                Ok(Local::stream(futures::stream::iter(0..limit).map(move |i| {
                    produced.fetch_add(1, Ordering::SeqCst);
                    json!(i)
                })))
            }
            "apply" => {
                let callback = args
                    .next()
                    .and_then(Local::into_remote_object)
                    .ok_or_else(|| Fault::bad_arguments("apply takes a function"))?;
                let result = callback.apply(vec![json!(21).into()]).await?;
                callback.release().await?;
                Ok(result)
            }
            other => Err(Fault::method_not_found(other)),
        }
    }
}

struct Doubler;

#[async_trait::async_trait]
impl Capability for Doubler {
    async fn call(&self, _method: &str, args: Vec<Local>) -> Result<Local, Fault> {
        let n = args
            .first()
            .and_then(Local::as_value)
            .and_then(Value::as_i64)
            .ok_or_else(|| Fault::bad_arguments("expected a number"))?;
        Ok(Local::Value(json!(n * 2)))
    }
}

/// A host peer and a plugin peer exposing `calc`.
fn connect_pair() -> (Peer, Peer, Arc<AtomicUsize>) {
    let (a, b) = DuplexChannelTransport::pair();
    let calc = Calculator::new();
    let produced = calc.produced.clone();
    let plugin = PeerBuilder::new("plugin")
        .capability("calc", Arc::new(calc))
        .unwrap()
        .connect(b);
    let host = PeerBuilder::new("host").connect(a);
    (host, plugin, produced)
}

async fn recv_message(raw: &DuplexChannelTransport) -> Message {
    let line = raw.recv().await.unwrap().expect("transport closed");
    plugwire::decode(&line).unwrap()
}

async fn send_message(raw: &DuplexChannelTransport, msg: Message) {
    raw.send(&plugwire::encode(&msg).unwrap()).await.unwrap();
}

fn remote_kind(result: Result<Value, Error>) -> ErrorKind {
    match result {
        Err(Error::Remote(body)) => body.kind,
        other => panic!("Expected remote error, got {:?}", other),
    }
}

// ============================================================================
//  CORRELATION
// ============================================================================

#[tokio::test]
async fn test_replies_resolve_by_id_in_any_order() {
    let (a, raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    let p = peer.clone();
    let first = tokio::spawn(async move { p.call("svc", "echo", vec![json!("A")]).await });
    let r1 = recv_message(&raw).await;
    let p = peer.clone();
    let second = tokio::spawn(async move { p.call("svc", "echo", vec![json!("B")]).await });
    let r2 = recv_message(&raw).await;

    assert_ne!(r1.id(), r2.id());
    send_message(&raw, Message::response(r2.id(), json!("reply-B"))).await;
    send_message(&raw, Message::response(r1.id(), json!("reply-A"))).await;

    assert_eq!(first.await.unwrap().unwrap(), json!("reply-A"));
    assert_eq!(second.await.unwrap().unwrap(), json!("reply-B"));
    assert_eq!(peer.pending_count(), 0);
}

#[tokio::test]
async fn test_many_concurrent_calls_answered_shuffled() {
    let (a, raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    let calls: Vec<_> = (0..50)
        .map(|i| {
            let p = peer.clone();
            tokio::spawn(async move { (i, p.call("svc", "echo", vec![json!(i)]).await) })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..50 {
        match recv_message(&raw).await {
            Message::Request { id, args, .. } => requests.push((id, args[0].clone())),
            other => panic!("Expected Request, got {:?}", other),
        }
    }
    requests.shuffle(&mut rand::thread_rng());
    for (id, arg) in requests {
        send_message(&raw, Message::response(id, arg)).await;
    }

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!(i));
    }
}

#[tokio::test]
async fn test_unknown_reply_id_is_ignored() {
    let (a, raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    send_message(&raw, Message::response(999, json!("stray"))).await;

    let p = peer.clone();
    let call = tokio::spawn(async move { p.call("svc", "m", vec![]).await });
    let request = recv_message(&raw).await;
    send_message(&raw, Message::response(request.id(), json!(1))).await;

    assert_eq!(call.await.unwrap().unwrap(), json!(1));
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_malformed_request_gets_bad_arguments() {
    let (a, raw) = DuplexChannelTransport::pair();
    let _peer = PeerBuilder::new("a").connect(a);

    raw.send(br#"{"type":"request","id":5,"target":[1],"method":"m"}"#).await.unwrap();

    match recv_message(&raw).await {
        Message::Error { id, error } => {
            assert_eq!(id, 5);
            assert_eq!(error.kind, ErrorKind::BadArguments);
        }
        other => panic!("Expected Error, got {:?}", other),
    }
}

// ============================================================================
//  TERMINATION
// ============================================================================

#[tokio::test]
async fn test_transport_close_fails_every_pending_call() {
    let (a, raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let p = peer.clone();
            tokio::spawn(async move { p.call("svc", "slow", vec![]).await })
        })
        .collect();
    for _ in 0..3 {
        recv_message(&raw).await;
    }
    assert_eq!(peer.pending_count(), 3);

    drop(raw);

    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(Error::TransportClosed(_))));
    }
    peer.closed().await;
    assert!(peer.is_closed());
    assert_eq!(peer.pending_count(), 0);

    // later calls fail without touching the transport
    assert!(matches!(peer.call("svc", "m", vec![]).await, Err(Error::TransportClosed(_))));
}

#[tokio::test]
async fn test_shutdown_closes_the_peer() {
    let (a, _raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    peer.shutdown();
    peer.closed().await;

    assert_eq!(peer.close_reason(), Some("Shut down by host"));
    assert!(matches!(peer.call("svc", "m", vec![]).await, Err(Error::TransportClosed(_))));
}

#[tokio::test]
async fn test_shutdown_ends_the_other_sides_input() {
    let (host, plugin, _) = connect_pair();
    assert_eq!(host.call("calc", "add", vec![json!(1)]).await.unwrap(), json!(1));

    plugin.shutdown();

    tokio::time::timeout(Duration::from_secs(1), host.closed())
        .await
        .expect("host saw end of input");
    assert_eq!(host.close_reason(), Some("End of input stream"));
}

#[tokio::test]
async fn test_cancelled_calls_leave_nothing_pending() {
    let (a, raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    for _ in 0..10 {
        let result = tokio::time::timeout(Duration::from_millis(5), peer.call("svc", "never", vec![])).await;
        assert!(result.is_err());
    }
    assert_eq!(peer.pending_count(), 0);

    // a late reply to an abandoned call is dropped, the session goes on
    let abandoned = recv_message(&raw).await;
    send_message(&raw, Message::response(abandoned.id(), json!("late"))).await;

    let p = peer.clone();
    let call = tokio::spawn(async move { p.call("svc", "m", vec![]).await });
    let request = loop {
        let msg = recv_message(&raw).await;
        if matches!(&msg, Message::Request { method, .. } if method == "m") {
            break msg;
        }
    };
    send_message(&raw, Message::response(request.id(), json!(1))).await;
    assert_eq!(call.await.unwrap().unwrap(), json!(1));
    assert!(!peer.is_closed());
    assert_eq!(peer.pending_count(), 0);
}

struct BrokenTransport;

#[async_trait::async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        Err(transport::Error::Io("disk gone".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_write_failure_rejects_only_that_call() {
    let peer = PeerBuilder::new("a").connect(BrokenTransport);

    let result = peer.call("svc", "m", vec![]).await;

    assert!(matches!(result, Err(Error::Transport(transport::Error::Io(_)))));
    assert_eq!(peer.pending_count(), 0);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_call_timeout() {
    let (a, _raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").call_timeout(Duration::from_millis(50)).connect(a);

    let result = peer.call("svc", "never", vec![]).await;

    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(peer.pending_count(), 0);
}

// ============================================================================
//  DISPATCH
// ============================================================================

#[tokio::test]
async fn test_call_between_peers() {
    let (host, _plugin, _) = connect_pair();
    let sum = host.call("calc", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, json!(5));
}

#[tokio::test]
async fn test_handler_failure_and_panic_become_errors() {
    let (host, plugin, _) = connect_pair();

    assert_eq!(remote_kind(host.call("calc", "fail", vec![]).await), ErrorKind::RemoteInvocation);
    assert_eq!(remote_kind(host.call("calc", "panic", vec![]).await), ErrorKind::RemoteInvocation);

    // the plugin survives both
    assert_eq!(host.call("calc", "add", vec![json!(1)]).await.unwrap(), json!(1));
    assert!(!plugin.is_closed());
}

#[tokio::test]
async fn test_unknown_target_and_method() {
    let (host, _plugin, _) = connect_pair();
    assert_eq!(remote_kind(host.call("nope", "add", vec![]).await), ErrorKind::TargetNotFound);
    assert_eq!(remote_kind(host.call("calc", "frobnicate", vec![]).await), ErrorKind::MethodNotFound);
    assert_eq!(remote_kind(host.call(77u64, "next", vec![]).await), ErrorKind::TargetNotFound);
}

#[test]
fn test_duplicate_capability_is_rejected() {
    let builder = PeerBuilder::new("a").capability("calc", Arc::new(Doubler)).unwrap();
    let result = builder.capability("calc", Arc::new(Doubler));
    assert!(matches!(result, Err(Error::DuplicateCapability(name)) if name == "calc"));
}

// ============================================================================
//  HANDLES
// ============================================================================

#[tokio::test]
async fn test_closed_stream_stops_production() {
    let (host, plugin, produced) = connect_pair();

    let mut stream = host
        .invoke("calc", "count", vec![json!(3).into()])
        .await
        .unwrap()
        .into_remote_stream()
        .expect("stream handle");
    let id = stream.id();
    assert_eq!(plugin.handle_count(), 1);

    assert_eq!(stream.next().await.unwrap(), Some(json!(0)));
    assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
    stream.close().await.unwrap();

    assert_eq!(produced.load(Ordering::SeqCst), 2);
    assert_eq!(plugin.handle_count(), 0);
    assert_eq!(remote_kind(host.call(Target::Handle(id), "next", vec![]).await), ErrorKind::TargetNotFound);
}

#[tokio::test]
async fn test_exhausted_stream_releases_handle() {
    let (host, plugin, _) = connect_pair();

    let stream = host
        .invoke("calc", "count", vec![json!(3).into()])
        .await
        .unwrap()
        .into_remote_stream()
        .expect("stream handle");

    let items: Vec<Value> = stream.into_stream().map(Result::unwrap).collect().await;

    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(plugin.handle_count(), 0);
}

#[tokio::test]
async fn test_callback_is_invoked_then_released() {
    let (host, _plugin, _) = connect_pair();

    let result = host
        .invoke("calc", "apply", vec![Local::object(Doubler)])
        .await
        .unwrap();

    assert_eq!(result.into_value(), Some(json!(42)));
    assert_eq!(host.handle_count(), 0);
}

#[tokio::test]
async fn test_reserved_shapes_are_not_plain_data() {
    let (a, _raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    let end = peer.call("svc", "m", vec![plugwire::end_of_stream()]).await;
    let handle = peer.call("svc", "m", vec![json!({ "__handle": { "id": 1, "kind": "object" } })]).await;

    assert!(matches!(end, Err(Error::ReservedValue)));
    assert!(matches!(handle, Err(Error::ReservedValue)));
    assert_eq!(peer.pending_count(), 0);
}

struct Impostor;

#[async_trait::async_trait]
impl Capability for Impostor {
    async fn call(&self, method: &str, _args: Vec<Local>) -> Result<Local, Fault> {
        match method {
            "marker" => Ok(Local::Value(plugwire::end_of_stream())),
            "items" => Ok(Local::stream(futures::stream::iter(vec![json!(1), plugwire::end_of_stream(), json!(2)]))),
            other => Err(Fault::method_not_found(other)),
        }
    }
}

#[tokio::test]
async fn test_marker_shaped_results_fail_instead_of_ending_streams() {
    let (a, b) = DuplexChannelTransport::pair();
    let _plugin = PeerBuilder::new("plugin")
        .capability("impostor", Arc::new(Impostor))
        .unwrap()
        .connect(b);
    let host = PeerBuilder::new("host").connect(a);

    assert_eq!(remote_kind(host.call("impostor", "marker", vec![]).await), ErrorKind::RemoteInvocation);

    let mut stream = host
        .invoke("impostor", "items", vec![])
        .await
        .unwrap()
        .into_remote_stream()
        .expect("stream handle");
    assert_eq!(stream.next().await.unwrap(), Some(json!(1)));
    match stream.next().await {
        Err(Error::Remote(body)) => assert_eq!(body.kind, ErrorKind::RemoteInvocation),
        other => panic!("Expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_handles_serialize_as_markers() {
    let (a, _raw) = DuplexChannelTransport::pair();
    let peer = PeerBuilder::new("a").connect(a);

    let first = peer.to_wire(Local::object(Doubler));
    let second = peer.to_wire(Local::stream(futures::stream::empty()));

    assert_eq!(first, json!({ "__handle": { "id": 1, "kind": "object" } }));
    assert_eq!(second, json!({ "__handle": { "id": 2, "kind": "stream" } }));
    assert_eq!(peer.handle_count(), 2);
    assert!(matches!(peer.from_wire(first), Local::RemoteObject(_)));
    assert!(matches!(peer.from_wire(json!({ "id": 1 })), Local::Value(_)));
}
