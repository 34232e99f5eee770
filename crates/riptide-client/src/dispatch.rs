//! One DCP connection: socket ownership, the request/response
//! dispatcher and the serial frame read loop.
//!
//! Requests are correlated by opaque: `send_request` parks a one-shot
//! slot under a fresh opaque and the read loop completes it when the
//! matching response arrives. Frames that match no slot are unsolicited
//! and go to the connection handler, as do all server-pushed request
//! frames. One read task per connection keeps handler invocation
//! serial.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::flow::FlowController;
use crate::host::HostAndPort;
use crate::lifecycle::{LifecycleState, StateMachine};
use crate::metrics::ClientMetrics;
use crate::transport::{self, ClientStream};
use bytes::Bytes;
use parking_lot::Mutex;
use riptide_protocol::{opcode, read_frame, Frame, RequestBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Receives everything a connection cannot resolve by itself:
/// server-pushed frames and teardown.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    fn on_control(&self, connection: &Arc<NodeConnection>, frame: Frame);
    fn on_data(&self, connection: &Arc<NodeConnection>, frame: Frame);
    /// A stream request succeeded. Invoked on the read task before the
    /// request future completes and before any frame of that stream is
    /// routed, so failover-log bookkeeping happens-before the first
    /// data event.
    fn on_stream_opened(&self, connection: &Arc<NodeConnection>, vbucket: u16, frame: &Frame);
    fn on_disconnect(&self, address: &HostAndPort, graceful: bool);
}

/// One-shot completion slots keyed by opaque. `None` once the
/// connection tore down; late registrations fail immediately.
struct Pending {
    slots: Mutex<Option<HashMap<u32, oneshot::Sender<Result<Frame>>>>>,
}

impl Pending {
    fn new() -> Self {
        Self {
            slots: Mutex::new(Some(HashMap::new())),
        }
    }

    fn insert(&self, opaque: u32, tx: oneshot::Sender<Result<Frame>>) -> bool {
        match self.slots.lock().as_mut() {
            Some(map) => {
                map.insert(opaque, tx);
                true
            }
            None => false,
        }
    }

    fn remove(&self, opaque: u32) -> Option<oneshot::Sender<Result<Frame>>> {
        self.slots.lock().as_mut().and_then(|map| map.remove(&opaque))
    }

    fn fail_all(&self) {
        if let Some(map) = self.slots.lock().take() {
            for (_, tx) in map {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }
}

/// Partitions of in-flight stream requests, keyed by opaque. The read
/// loop consults this to run stream-open bookkeeping inline.
type StreamOpens = Mutex<HashMap<u32, u16>>;

/// A live DCP connection to one node.
pub(crate) struct NodeConnection {
    address: HostAndPort,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    pending: Pending,
    stream_opens: StreamOpens,
    opaque: AtomicU32,
    flow: Arc<FlowController>,
    lifecycle: StateMachine,
    graceful: AtomicBool,
    closing_tx: watch::Sender<bool>,
}

impl NodeConnection {
    /// Connects, authenticates and negotiates the connection, then
    /// spawns the read and write loops.
    pub async fn connect(
        address: HostAndPort,
        config: &ClientConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>> {
        debug!("Connecting to node {}", address);
        let (mut stream, _peer) = transport::connect_stream(&address, config).await?;

        timeout(config.socket_connect_timeout, handshake(&mut stream, config))
            .await
            .map_err(|_| Error::Timeout(format!("handshake with {}", address)))??;

        let (reader, writer) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let flow = Arc::new(FlowController::new(
            writer_tx.clone(),
            config.flow_control_buffer_size,
            config.flow_control_ack_threshold,
        ));
        let (closing_tx, closing_rx) = watch::channel(false);

        let connection = Arc::new(NodeConnection {
            address,
            writer_tx,
            pending: Pending::new(),
            stream_opens: Mutex::new(HashMap::new()),
            opaque: AtomicU32::new(1),
            flow,
            lifecycle: StateMachine::new("dcp.connection", LifecycleState::Connected),
            graceful: AtomicBool::new(false),
            closing_tx,
        });

        tokio::spawn(write_loop(writer, writer_rx));
        tokio::spawn(read_loop(connection.clone(), reader, closing_rx, handler));

        Ok(connection)
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    fn graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }

    /// Sends a request and awaits its correlated response. A response
    /// with non-success status completes with
    /// [`Error::BadResponseStatus`]; the connection going away completes
    /// with [`Error::ConnectionClosed`]. Requests are not resubmitted
    /// automatically.
    pub async fn send_request(&self, builder: RequestBuilder) -> Result<Frame> {
        self.send_request_inner(builder, None).await
    }

    /// Like [`NodeConnection::send_request`], with the opaque registered
    /// as an in-flight stream open for the given partition so the read
    /// loop can run the open bookkeeping inline.
    pub async fn send_stream_request(
        &self,
        vbucket: u16,
        builder: RequestBuilder,
    ) -> Result<Frame> {
        self.send_request_inner(builder, Some(vbucket)).await
    }

    async fn send_request_inner(
        &self,
        builder: RequestBuilder,
        stream_vbucket: Option<u16>,
    ) -> Result<Frame> {
        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if !self.pending.insert(opaque, tx) {
            return Err(Error::ConnectionClosed);
        }
        if let Some(vbucket) = stream_vbucket {
            self.stream_opens.lock().insert(opaque, vbucket);
        }

        let mut builder = builder.opaque(opaque);
        let bytes = match builder.build() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.forget(opaque);
                return Err(e.into());
            }
        };
        if self.writer_tx.send(bytes).is_err() {
            self.forget(opaque);
            return Err(Error::ConnectionClosed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    fn forget(&self, opaque: u32) {
        self.pending.remove(opaque);
        self.stream_opens.lock().remove(&opaque);
    }

    /// Initiates teardown. A graceful close suppresses the failure
    /// event and the reconnect path.
    pub fn close(&self, graceful: bool) {
        if graceful {
            self.graceful.store(true, Ordering::Release);
        }
        self.lifecycle.transition(LifecycleState::Disconnecting);
        let _ = self.closing_tx.send(true);
    }

    fn route(self: &Arc<Self>, handler: &Arc<dyn ConnectionHandler>, frame: Frame) {
        if frame.is_response() {
            let stream_vbucket = self.stream_opens.lock().remove(&frame.opaque());
            match self.pending.remove(frame.opaque()) {
                Some(tx) => {
                    let result = if frame.status().is_success() {
                        if let Some(vbucket) = stream_vbucket {
                            handler.on_stream_opened(self, vbucket, &frame);
                        }
                        Ok(frame)
                    } else {
                        Err(Error::BadResponseStatus {
                            status: frame.status(),
                            value: frame.value(),
                        })
                    };
                    let _ = tx.send(result);
                }
                None => handler.on_control(self, frame),
            }
        } else {
            match frame.opcode() {
                opcode::DCP_MUTATION | opcode::DCP_DELETION | opcode::DCP_EXPIRATION => {
                    handler.on_data(self, frame)
                }
                _ => handler.on_control(self, frame),
            }
        }
    }
}

/// SASL PLAIN, then `DCP_OPEN`, then buffer-size negotiation, in order,
/// before the connection is handed to the read loop.
async fn handshake(stream: &mut ClientStream, config: &ClientConfig) -> Result<()> {
    if !config.credentials.username.is_empty() {
        let auth = RequestBuilder::sasl_auth_plain(
            &config.credentials.username,
            &config.credentials.password,
        );
        exchange(stream, auth).await.map_err(|e| match e {
            Error::BadResponseStatus { status, .. } => {
                Error::AuthenticationFailed(status.to_string())
            }
            other => other,
        })?;
    }

    exchange(stream, RequestBuilder::open_connection(&config.connection_name)).await?;

    if config.flow_control_buffer_size > 0 {
        let control = RequestBuilder::control(
            "connection_buffer_size",
            &config.flow_control_buffer_size.to_string(),
        );
        exchange(stream, control).await?;
    }
    Ok(())
}

async fn exchange(stream: &mut ClientStream, builder: RequestBuilder) -> Result<Frame> {
    let mut builder = builder;
    let bytes = builder.build()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    match read_frame(stream).await? {
        Some(frame) if frame.status().is_success() => Ok(frame),
        Some(frame) => Err(Error::BadResponseStatus {
            status: frame.status(),
            value: frame.value(),
        }),
        None => Err(Error::ConnectionClosed),
    }
}

async fn write_loop(mut writer: WriteHalf<ClientStream>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    connection: Arc<NodeConnection>,
    mut reader: ReadHalf<ClientStream>,
    mut closing_rx: watch::Receiver<bool>,
    handler: Arc<dyn ConnectionHandler>,
) {
    loop {
        tokio::select! {
            _ = closing_rx.changed() => break,
            result = read_frame(&mut reader) => match result {
                Ok(Some(frame)) => {
                    ClientMetrics::increment_frames_received();
                    connection.route(&handler, frame);
                }
                Ok(None) => {
                    debug!("Connection to {} closed by peer", connection.address);
                    break;
                }
                Err(e) => {
                    if !connection.graceful() {
                        warn!("Read error on connection to {}: {}", connection.address, e);
                    }
                    break;
                }
            }
        }
    }

    connection.pending.fail_all();
    connection.stream_opens.lock().clear();
    connection.lifecycle.transition(LifecycleState::Disconnected);
    handler.on_disconnect(&connection.address, connection.graceful());
}
