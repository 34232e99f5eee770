//! In-process fake cluster pieces shared by the integration tests: a
//! scripted DCP node and a config-service endpoint speaking the
//! streaming HTTP protocol.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use riptide_client::{ChangeEvent, ChangeListener, ListenerResult};
use riptide_protocol::{opcode, read_frame, Frame, RequestBuilder, ResponseBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Installs the env-filtered fmt subscriber once per test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Forwards every event into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ChangeListener for ChannelListener {
    fn on_event(&self, event: ChangeEvent) -> ListenerResult {
        self.tx.send(event).map_err(|_| "listener channel closed".into())
    }
}

pub async fn expect_event(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ----------------------------------------------------------------------
// Fake DCP node
// ----------------------------------------------------------------------

pub async fn next_frame(socket: &mut TcpStream) -> Option<Frame> {
    read_frame(socket).await.expect("malformed frame from client")
}

pub async fn send(socket: &mut TcpStream, bytes: Bytes) {
    socket.write_all(&bytes).await.expect("write to client failed");
    socket.flush().await.expect("flush to client failed");
}

pub fn success(request: &Frame) -> Bytes {
    ResponseBuilder::response(request.opcode())
        .opaque(request.opaque())
        .build()
        .unwrap()
}

/// Stream-request response carrying a single-entry failover log.
pub fn stream_open_response(request: &Frame, uuid: u64, seqno: u64) -> Bytes {
    let mut value = BytesMut::new();
    value.put_u64(uuid);
    value.put_u64(seqno);
    ResponseBuilder::response(opcode::DCP_STREAM_REQUEST)
        .opaque(request.opaque())
        .value(value.freeze())
        .build()
        .unwrap()
}

pub fn rollback_response(request: &Frame, rollback_seqno: u64) -> Bytes {
    ResponseBuilder::response(opcode::DCP_STREAM_REQUEST)
        .opaque(request.opaque())
        .status(riptide_protocol::ResponseStatus::Rollback)
        .value(Bytes::copy_from_slice(&rollback_seqno.to_be_bytes()))
        .build()
        .unwrap()
}

pub fn snapshot_marker(vbucket: u16, start: u64, end: u64) -> Bytes {
    let mut extras = BytesMut::new();
    extras.put_u64(start);
    extras.put_u64(end);
    extras.put_u32(0);
    RequestBuilder::request(opcode::DCP_SNAPSHOT_MARKER)
        .vbucket(vbucket)
        .extras(extras.freeze())
        .build()
        .unwrap()
}

pub fn mutation(vbucket: u16, seqno: u64, key: &str, value: &[u8]) -> Bytes {
    let mut extras = BytesMut::new();
    extras.put_u64(seqno);
    extras.put_u64(seqno); // revision
    extras.put_u32(0); // flags
    extras.put_u32(0); // expiration
    extras.put_u32(0); // lock time
    extras.put_u16(0); // meta length
    extras.put_u8(0); // nru
    RequestBuilder::request(opcode::DCP_MUTATION)
        .vbucket(vbucket)
        .extras(extras.freeze())
        .key(key.to_string())
        .value(Bytes::copy_from_slice(value))
        .build()
        .unwrap()
}

/// Answers the SASL, open and control requests of a fresh connection
/// and returns the stream request that follows.
pub async fn serve_handshake(socket: &mut TcpStream) -> Frame {
    loop {
        let frame = next_frame(socket).await.expect("client closed during handshake");
        match frame.opcode() {
            opcode::SASL_AUTH | opcode::DCP_OPEN | opcode::DCP_CONTROL => {
                let response = success(&frame);
                send(socket, response).await;
            }
            opcode::DCP_STREAM_REQUEST => return frame,
            other => panic!("unexpected opcode during handshake: {other:#04x}"),
        }
    }
}

// ----------------------------------------------------------------------
// Fake config service
// ----------------------------------------------------------------------

/// A one-node, one-partition cluster config. `$HOST` placeholders are
/// left for the provider to substitute.
pub fn cluster_config_json(rev: i64, config_port: u16, kv_port: u16) -> String {
    format!(
        r#"{{"rev": {rev}, "name": "orders", "nodesExt": [{{"hostname": "$HOST", "services": {{"mgmt": {config_port}, "kv": {kv_port}}}}}], "vBucketServerMap": {{"serverList": ["$HOST:{kv_port}"], "vBucketMap": [[0]]}}}}"#
    )
}

/// Reads the HTTP request head (request line and headers).
pub async fn read_http_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await.expect("read request failed");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Serves one streaming-config connection: reads the request head and
/// writes an identity-encoded response whose body is the given
/// documents, then holds the socket open.
pub async fn serve_config_stream(listener: tokio::net::TcpListener, documents: Vec<String>) {
    let (mut socket, _) = listener.accept().await.expect("accept failed");
    read_http_head(&mut socket).await;
    let mut response = String::from("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n");
    for document in documents {
        response.push_str(&document);
        response.push_str("\n\n\n\n");
    }
    socket
        .write_all(response.as_bytes())
        .await
        .expect("write response failed");
    socket.flush().await.expect("flush failed");
    // Keep the stream open; the provider treats EOF as a reconnect cue.
    tokio::time::sleep(Duration::from_secs(600)).await;
    drop(socket);
}
