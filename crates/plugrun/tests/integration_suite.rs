//! Integration tests for plugrun over real byte streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use plugrun::Capability;
use plugrun::DeviceEvent;
use plugrun::Error;
use plugrun::Fault;
use plugrun::Local;
use plugrun::Peer;
use plugrun::PeerBuilder;
use plugrun::StateListener;
use plugrun::StateStore;
use plugrun::StreamTransport;
use plugrun::function;

/// Connects a host and a plugin through an in-memory byte pipe, so every
/// record goes through newline framing.
fn byte_pipe(plugin: PeerBuilder) -> (Peer, Peer) {
    let (host_io, plugin_io) = tokio::io::duplex(64 * 1024);
    let (host_read, host_write) = tokio::io::split(host_io);
    let (plugin_read, plugin_write) = tokio::io::split(plugin_io);

    let plugin = plugin.connect(StreamTransport::new(plugin_read, plugin_write));
    let host = PeerBuilder::new("host").connect(StreamTransport::new(host_read, host_write));
    (host, plugin)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DeviceEvent>>,
}

impl StateListener for Recorder {
    fn on_event(&self, event: &DeviceEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct Doubler;

#[async_trait::async_trait]
impl Capability for Doubler {
    async fn call(&self, _method: &str, args: Vec<Local>) -> Result<Local, Fault> {
        let n = args.first().and_then(Local::as_value).and_then(Value::as_i64).unwrap_or(0);
        Ok(Local::Value(json!(n * 2)))
    }
}

// --- State store driven by the host ---

#[tokio::test]
async fn test_state_store_over_rpc() {
    let recorder = Arc::new(Recorder::default());
    let store = Arc::new(StateStore::with_listener(recorder.clone()));
    let (host, _plugin) = byte_pipe(PeerBuilder::new("plugin").capability("stateStore", store.clone()).unwrap());

    host.call("stateStore", "setNativeId", vec![json!("lamp-1"), json!("17"), json!({ "token": "t" })])
        .await
        .unwrap();
    host.call("stateStore", "updateDeviceState", vec![json!("17"), json!({ "on": false, "level": 3 })])
        .await
        .unwrap();
    host.call(
        "stateStore",
        "notify",
        vec![json!("17"), json!(1700000000000u64), json!("OnOff"), json!("on"), json!(true), json!(true)],
    )
    .await
    .unwrap();

    // an event for a device with no state is accepted on the wire but ignored
    host.call(
        "stateStore",
        "notify",
        vec![json!("99"), json!(1), json!("OnOff"), json!("on"), json!(true), json!(true)],
    )
    .await
    .unwrap();

    let expected: HashMap<String, Value> = HashMap::from([("on".to_string(), json!(true)), ("level".to_string(), json!(3))]);
    assert_eq!(store.device_state("17"), Some(expected));
    assert_eq!(store.device_state("99"), None);
    assert_eq!(store.native_id_of("17").as_deref(), Some("lamp-1"));
    assert_eq!(recorder.events.lock().unwrap().len(), 1);

    let storage = host.call("stateStore", "getDeviceStorage", vec![json!("lamp-1")]).await.unwrap();
    assert_eq!(storage, json!({ "id": "17", "nativeId": "lamp-1", "storage": { "token": "t" } }));

    host.call("stateStore", "updateDeviceState", vec![json!("17"), Value::Null]).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_state_store_rejects_wrong_shapes() {
    let (host, _plugin) = byte_pipe(PeerBuilder::new("plugin").capability("stateStore", Arc::new(StateStore::new())).unwrap());

    let result = host.call("stateStore", "updateDeviceState", vec![json!(17), json!({})]).await;

    match result {
        Err(Error::Remote(body)) => assert_eq!(body.kind, plugwire::ErrorKind::BadArguments),
        other => panic!("Expected bad_arguments, got {:?}", other),
    }
}

// --- Values survive framing ---

#[tokio::test]
async fn test_embedded_newlines_survive_framing() {
    let echo = function(|mut args: Vec<Local>| async move { Ok::<Local, Fault>(args.remove(0)) });
    let (host, _plugin) = byte_pipe(PeerBuilder::new("plugin").capability("echo", echo).unwrap());

    let text = json!({ "text": "line one\nline two\r\n" });
    let back = host.call("echo", "call", vec![text.clone()]).await.unwrap();
    assert_eq!(back, text);
}

// --- A proxy passed back is re-exported as a forwarding handle ---

#[tokio::test]
async fn test_remote_object_round_trips_as_forwarder() {
    let echo = function(|mut args: Vec<Local>| async move { Ok::<Local, Fault>(args.remove(0)) });
    let (host, plugin) = byte_pipe(PeerBuilder::new("plugin").capability("echo", echo).unwrap());

    let returned = host
        .invoke("echo", "call", vec![Local::object(Doubler)])
        .await
        .unwrap()
        .into_remote_object()
        .expect("object handle");

    // host -> plugin forwarder -> host Doubler
    let result = returned.apply(vec![json!(8).into()]).await.unwrap();
    assert_eq!(result.into_value(), Some(json!(16)));
    assert_eq!(plugin.handle_count(), 1);

    returned.release().await.unwrap();
    assert_eq!(plugin.handle_count(), 0);
}

// --- Session loss ---

#[tokio::test]
async fn test_end_of_input_closes_the_peer() {
    let (host_io, plugin_io) = tokio::io::duplex(1024);
    let (host_read, host_write) = tokio::io::split(host_io);
    let host = PeerBuilder::new("host").connect(StreamTransport::new(host_read, host_write));

    let h = host.clone();
    let pending = tokio::spawn(async move { h.call("svc", "m", vec![]).await });

    // read the request off the pipe, then hang up
    let mut lines = BufReader::new(plugin_io).lines();
    let line = lines.next_line().await.unwrap().expect("request line");
    assert!(line.contains(r#""type":"request""#));
    drop(lines);

    assert!(matches!(pending.await.unwrap(), Err(Error::TransportClosed(_))));
    host.closed().await;
    assert_eq!(host.close_reason(), Some("End of input stream"));
}

#[tokio::test]
async fn test_shutdown_reaches_the_other_side() {
    let (host, plugin) = byte_pipe(PeerBuilder::new("plugin").capability("double", Arc::new(Doubler)).unwrap());
    assert_eq!(host.call("double", "call", vec![json!(4)]).await.unwrap(), json!(8));

    host.shutdown();

    tokio::time::timeout(std::time::Duration::from_secs(1), plugin.closed())
        .await
        .expect("plugin saw end of input");
    assert_eq!(plugin.close_reason(), Some("End of input stream"));
    assert_eq!(host.close_reason(), Some("Shut down by host"));
}
