//! The conductor owns every partition stream.
//!
//! It reacts to topology updates from the config provider by opening,
//! moving and closing node connections, opens one DCP stream per
//! assigned partition at its last committed offset, and drives the
//! reconnect policy when connections drop. Stream-open outcomes fold
//! into the event taxonomy: a success feeds the response's failover log
//! through the adapter, a rollback status is re-framed as the synthetic
//! rollback control frame, and other failures surface as stream
//! failures.

use crate::adapter::EventAdapter;
use crate::config::ClientConfig;
use crate::dispatch::{ConnectionHandler, NodeConnection};
use crate::error::{Error, Result};
use crate::events::{StreamEndReason, StreamRestart};
use crate::host::HostAndPort;
use crate::lifecycle::{LifecycleState, StateMachine};
use crate::metrics::ClientMetrics;
use crate::partition::{
    FailoverLogEntry, PartitionStateTable, StreamOffset, StreamState, MAX_PARTITIONS,
};
use crate::provider::ConfigProvider;
use crate::retry::Retry;
use crate::topology::BucketConfig;
use parking_lot::Mutex;
use riptide_protocol::{Frame, RequestBuilder, ResponseStatus};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Answer to an observe-seqno request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSeqnoResult {
    pub vbuuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
}

enum Command {
    Reconnect(HostAndPort),
    Reopen(u16),
    Stop,
}

pub(crate) struct Conductor {
    inner: Arc<Inner>,
    channels: Mutex<Option<(mpsc::UnboundedReceiver<Command>, mpsc::UnboundedReceiver<StreamRestart>)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client_config: Arc<ClientConfig>,
    provider: ConfigProvider,
    adapter: Arc<EventAdapter>,
    partitions: PartitionStateTable,
    connections: Mutex<HashMap<HostAndPort, Arc<NodeConnection>>>,
    current: parking_lot::RwLock<Option<Arc<BucketConfig>>>,
    session: Mutex<HashMap<u16, StreamOffset>>,
    lifecycle: StateMachine,
    stopped: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Conductor {
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let adapter = Arc::new(EventAdapter::new(
            client_config.flow_control_mode,
            restart_tx,
        ));
        let provider = ConfigProvider::new(client_config.clone());
        let inner = Arc::new(Inner {
            provider,
            adapter,
            partitions: PartitionStateTable::new(),
            connections: Mutex::new(HashMap::new()),
            current: parking_lot::RwLock::new(None),
            session: Mutex::new(HashMap::new()),
            lifecycle: StateMachine::new("dcp.client", LifecycleState::Disconnected),
            stopped: Arc::new(AtomicBool::new(false)),
            cmd_tx,
            client_config,
        });
        Self {
            inner,
            channels: Mutex::new(Some((cmd_rx, restart_rx))),
            task: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<EventAdapter> {
        &self.inner.adapter
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn config_stream(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.inner.provider.config_stream()
    }

    /// Seeds the resume offset for one partition. Takes effect for the
    /// next stream open of that partition.
    pub fn seed_offset(&self, vbucket: u16, offset: StreamOffset) {
        self.inner.session.lock().insert(vbucket, offset);
    }

    /// Starts the provider, waits for the first topology and opens the
    /// partition streams.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        inner.lifecycle.transition(LifecycleState::Connecting);

        let mut config_rx = inner.provider.config_stream();
        inner.provider.start().await?;

        let first = timeout(inner.client_config.bootstrap_timeout, config_rx.recv())
            .await
            .map_err(|_| Error::Timeout("waiting for the first cluster config".into()))?
            .map_err(|_| Error::ConnectionClosed)?;
        inner.apply_config(first).await;

        let (cmd_rx, restart_rx) = self.channels.lock().take().ok_or(Error::Stopped)?;
        let task = tokio::spawn(run(inner.clone(), config_rx, cmd_rx, restart_rx));
        *self.task.lock() = Some(task);

        inner.lifecycle.transition(LifecycleState::Connected);
        Ok(())
    }

    /// Graceful shutdown: stops the provider, terminates the control
    /// loop and closes every connection. In-flight requests complete
    /// with [`Error::ConnectionClosed`].
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.lifecycle.transition(LifecycleState::Disconnecting);
        inner.provider.stop().await;
        let _ = inner.cmd_tx.send(Command::Stop);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let connections: Vec<_> = inner.connections.lock().drain().collect();
        for (_, connection) in connections {
            connection.close(true);
        }
        ClientMetrics::set_active_connections(0);
        inner.lifecycle.transition(LifecycleState::Disconnected);
        info!("Client shut down");
    }

    pub async fn observe_seqno(&self, partition: u16, vbuuid: u64) -> Result<ObserveSeqnoResult> {
        let connection = self.inner.connection_for_partition(partition)?;
        let frame = connection
            .send_request(RequestBuilder::observe_seqno(partition, vbuuid))
            .await?;
        parse_observe_seqno(&frame)
    }

    pub async fn failover_log(&self, partition: u16) -> Result<Vec<FailoverLogEntry>> {
        let connection = self.inner.connection_for_partition(partition)?;
        let frame = connection
            .send_request(RequestBuilder::failover_log(partition))
            .await?;
        let entries = frame.failover_log()?;
        if let Some(first) = entries.first() {
            self.inner.partitions.set_vbuuid(partition, first.uuid);
        }
        self.inner.adapter.on_failover_log(partition, entries.clone());
        Ok(entries)
    }

    /// Current stream state of one partition.
    pub fn stream_state(&self, partition: u16) -> StreamState {
        self.inner.partitions.state(partition)
    }
}

async fn run(
    inner: Arc<Inner>,
    mut config_rx: broadcast::Receiver<Arc<BucketConfig>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut restart_rx: mpsc::UnboundedReceiver<StreamRestart>,
) {
    loop {
        tokio::select! {
            result = config_rx.recv() => match result {
                Ok(config) => inner.apply_config(config).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Conductor lagged {} configs behind", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(command) = cmd_rx.recv() => match command {
                Command::Reconnect(address) => inner.reconnect(address).await,
                Command::Reopen(vbucket) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        sleep(inner.client_config.stream_reconnect_delay).await;
                        inner.open_stream(vbucket).await;
                    });
                }
                Command::Stop => break,
            },
            Some(restart) = restart_rx.recv() => {
                inner.session.lock().insert(restart.vbucket, restart.offset);
                inner.partitions.set_state(restart.vbucket, StreamState::Idle);
                inner.clone().spawn_open(restart.vbucket);
            }
        }
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }
    }
    debug!("Conductor control loop terminated");
}

impl Inner {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn current_config(&self) -> Option<Arc<BucketConfig>> {
        self.current.read().clone()
    }

    fn assigned_node(&self, vbucket: u16) -> Option<HostAndPort> {
        self.current_config()?
            .kv_node_for_partition(vbucket, self.client_config.ssl_enabled)
    }

    fn desired_nodes(&self, config: &BucketConfig) -> HashSet<HostAndPort> {
        let ssl = self.client_config.ssl_enabled;
        let partitions = config.num_partitions().min(MAX_PARTITIONS);
        (0..partitions as u16)
            .filter_map(|vb| config.kv_node_for_partition(vb, ssl))
            .collect()
    }

    fn connection_for_partition(&self, vbucket: u16) -> Result<Arc<NodeConnection>> {
        let address = self
            .assigned_node(vbucket)
            .ok_or(Error::NoNodeForPartition(vbucket))?;
        self.connections
            .lock()
            .get(&address)
            .cloned()
            .ok_or(Error::ConnectionClosed)
    }

    /// Applies one topology revision: connects to new nodes, drops
    /// connections outside the config, and (re)opens streams for every
    /// partition whose node changed or whose stream is not running.
    async fn apply_config(self: &Arc<Self>, config: Arc<BucketConfig>) {
        info!("Applying cluster config rev {}", config.rev);
        let ssl = self.client_config.ssl_enabled;
        let partitions = config.num_partitions().min(MAX_PARTITIONS);
        let desired = self.desired_nodes(&config);
        *self.current.write() = Some(config.clone());

        for address in &desired {
            if let Err(e) = self.ensure_connection(address).await {
                warn!("Could not connect to {}: {}", address, e);
                let _ = self.cmd_tx.send(Command::Reconnect(address.clone()));
            }
        }

        let stale: Vec<(HostAndPort, Arc<NodeConnection>)> = {
            let mut connections = self.connections.lock();
            let stale_keys: Vec<HostAndPort> = connections
                .keys()
                .filter(|address| !desired.contains(address))
                .cloned()
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| connections.remove_entry(&key))
                .collect()
        };
        for (address, connection) in stale {
            debug!("Closing connection to {}, no longer in the config", address);
            connection.close(true);
        }
        ClientMetrics::set_active_connections(self.connections.lock().len() as u64);

        for vbucket in 0..partitions as u16 {
            let Some(address) = config.kv_node_for_partition(vbucket, ssl) else {
                continue;
            };
            let moved = self.partitions.owner(vbucket).as_ref() != Some(&address);
            let state = self.partitions.state(vbucket);
            self.partitions.set_owner(vbucket, Some(address));

            let reopen = match state {
                StreamState::Idle | StreamState::Ended => true,
                StreamState::Streaming | StreamState::Opening | StreamState::Failed => moved,
            };
            if moved && matches!(state, StreamState::Streaming | StreamState::Opening) {
                self.partitions.set_state(vbucket, StreamState::Idle);
            }
            if reopen {
                self.clone().spawn_open(vbucket);
            }
        }
    }

    async fn ensure_connection(self: &Arc<Self>, address: &HostAndPort) -> Result<Arc<NodeConnection>> {
        if let Some(connection) = self.connections.lock().get(address) {
            return Ok(connection.clone());
        }
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        let connection =
            NodeConnection::connect(address.clone(), &self.client_config, handler).await?;

        let mut connections = self.connections.lock();
        match connections.get(address) {
            Some(existing) => {
                // Lost a connect race; keep the established one.
                connection.close(true);
                Ok(existing.clone())
            }
            None => {
                connections.insert(address.clone(), connection.clone());
                ClientMetrics::set_active_connections(connections.len() as u64);
                Ok(connection)
            }
        }
    }

    fn spawn_open(self: Arc<Self>, vbucket: u16) {
        tokio::spawn(async move { self.open_stream(vbucket).await });
    }

    async fn open_stream(self: &Arc<Self>, vbucket: u16) {
        if self.stopped() {
            return;
        }
        if self.partitions.state(vbucket) == StreamState::Opening {
            return;
        }

        let address = match self.assigned_node(vbucket) {
            Some(address) => address,
            None => {
                self.partitions.set_state(vbucket, StreamState::Failed);
                self.adapter
                    .on_stream_failure(vbucket as i32, Error::NoNodeForPartition(vbucket));
                return;
            }
        };
        let connection = match self.ensure_connection(&address).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Cannot open stream for partition {}: {}", vbucket, e);
                self.partitions.set_state(vbucket, StreamState::Idle);
                let _ = self.cmd_tx.send(Command::Reconnect(address));
                return;
            }
        };

        let offset = self
            .session
            .lock()
            .get(&vbucket)
            .copied()
            .unwrap_or_default();
        self.partitions.set_state(vbucket, StreamState::Opening);
        debug!("Opening stream for partition {} at {}", vbucket, offset);

        let request = RequestBuilder::stream_request(
            vbucket,
            0,
            offset.seqno,
            u64::MAX,
            offset.vbuuid,
            offset.snapshot.start_seqno,
            offset.snapshot.end_seqno,
        );
        match connection.send_stream_request(vbucket, request).await {
            // Failover-log bookkeeping already ran on the read task via
            // on_stream_opened.
            Ok(_frame) => {
                self.partitions.set_state(vbucket, StreamState::Streaming);
                ClientMetrics::increment_streams_opened();
            }

            Err(Error::BadResponseStatus {
                status: ResponseStatus::Rollback,
                value,
            }) => {
                self.partitions.set_state(vbucket, StreamState::Idle);
                let seqno = value
                    .get(0..8)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                debug!("Server demands rollback of partition {} to {}", vbucket, seqno);
                let synthetic = RequestBuilder::internal_rollback(vbucket, seqno)
                    .build()
                    .map_err(Error::from)
                    .and_then(|bytes| Frame::parse(bytes).map_err(Error::from));
                match synthetic {
                    Ok(frame) => self.adapter.on_control(connection.flow(), frame),
                    Err(e) => self.adapter.on_stream_failure(vbucket as i32, e),
                }
            }

            Err(Error::BadResponseStatus {
                status: ResponseStatus::NotMyVbucket,
                ..
            }) => {
                debug!(
                    "Partition {} is not hosted by {}, awaiting config refresh",
                    vbucket, address
                );
                self.partitions.set_state(vbucket, StreamState::Idle);
                let _ = self.cmd_tx.send(Command::Reopen(vbucket));
            }

            Err(Error::ConnectionClosed) => {
                // The disconnect path re-opens the partition.
                self.partitions.set_state(vbucket, StreamState::Idle);
            }

            Err(e) => {
                error!("Stream open failed for partition {}: {}", vbucket, e);
                self.partitions.set_state(vbucket, StreamState::Failed);
                self.adapter.on_stream_failure(vbucket as i32, e);
            }
        }
    }

    /// Re-establishes a node connection with bounded retries, then
    /// reopens the idle partitions it hosts.
    async fn reconnect(self: &Arc<Self>, address: HostAndPort) {
        if self.stopped() {
            return;
        }
        let still_referenced = self
            .current_config()
            .map(|config| self.desired_nodes(&config).contains(&address))
            .unwrap_or(false);
        if !still_referenced {
            debug!("Not reconnecting to {}, no longer in the config", address);
            return;
        }

        let inner = self.clone();
        let target = address.clone();
        let log_target = address.clone();
        let result = Retry::any()
            .delay(self.client_config.stream_reconnect_delay)
            .max(self.client_config.stream_reconnect_max_attempts)
            .until_stopped(self.stopped.clone())
            .do_on_retry(move |attempt, cause, delay| {
                ClientMetrics::increment_reconnect_attempts(&log_target.format());
                warn!(
                    "Reconnect attempt {} to {} failed ({}); retrying in {:?}",
                    attempt, log_target, cause, delay
                );
            })
            .run(move || {
                let inner = inner.clone();
                let address = target.clone();
                async move { inner.ensure_connection(&address).await.map(|_| ()) }
            })
            .await;

        match result {
            Ok(()) => {
                for vbucket in self.partitions.partitions_owned_by(&address) {
                    if self.partitions.state(vbucket) == StreamState::Idle {
                        self.clone().spawn_open(vbucket);
                    }
                }
            }
            Err(e) => {
                if !self.stopped() {
                    error!("Giving up reconnecting to {}: {}", address, e);
                    self.adapter.on_stream_failure(-1, e);
                }
            }
        }
    }

    fn handle_stream_end(&self, frame: &Frame) {
        let vbucket = frame.vbucket();
        let reason = match frame.stream_end_reason() {
            Ok(code) => StreamEndReason::from(code),
            Err(e) => {
                warn!("Stream end for partition {} with unreadable reason: {}", vbucket, e);
                StreamEndReason::Unknown(u32::MAX)
            }
        };
        debug!("Stream for partition {} ended: {:?}", vbucket, reason);
        self.partitions.set_state(vbucket, StreamState::Ended);
        self.adapter.on_stream_end(vbucket, reason);
    }
}

impl ConnectionHandler for Inner {
    fn on_control(&self, connection: &Arc<NodeConnection>, frame: Frame) {
        if frame.is_request() && frame.opcode() == riptide_protocol::opcode::DCP_STREAM_END {
            self.handle_stream_end(&frame);
            return;
        }
        self.adapter.on_control(connection.flow(), frame);
    }

    fn on_data(&self, connection: &Arc<NodeConnection>, frame: Frame) {
        let vbucket = frame.vbucket();
        if let Some(offset) = self.adapter.on_data(connection.flow(), frame) {
            self.partitions.set_last_seqno(vbucket, offset.seqno);
            self.session.lock().insert(vbucket, offset);
        }
    }

    fn on_stream_opened(&self, _connection: &Arc<NodeConnection>, vbucket: u16, frame: &Frame) {
        match frame.failover_log() {
            Ok(entries) => {
                if let Some(first) = entries.first() {
                    self.partitions.set_vbuuid(vbucket, first.uuid);
                }
                self.adapter.on_failover_log(vbucket, entries);
            }
            Err(e) => warn!(
                "Unreadable failover log in stream open response for partition {}: {}",
                vbucket, e
            ),
        }
    }

    fn on_disconnect(&self, address: &HostAndPort, graceful: bool) {
        self.connections.lock().remove(address);
        ClientMetrics::set_active_connections(self.connections.lock().len() as u64);

        for vbucket in self.partitions.partitions_owned_by(address) {
            if matches!(
                self.partitions.state(vbucket),
                StreamState::Streaming | StreamState::Opening
            ) {
                self.partitions.set_state(vbucket, StreamState::Idle);
            }
        }

        if !graceful && !self.stopped() {
            warn!("Connection to {} was lost", address);
            self.adapter.on_stream_failure(-1, Error::ConnectionClosed);
            let _ = self.cmd_tx.send(Command::Reconnect(address.clone()));
        }
    }
}

fn parse_observe_seqno(frame: &Frame) -> Result<ObserveSeqnoResult> {
    // Body: format type (1), vbucket (2), vbuuid (8), last persisted
    // seqno (8), current seqno (8).
    let value = frame.value();
    let read_u64 = |offset: usize| -> Result<u64> {
        value
            .get(offset..offset + 8)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| Error::Dispatch("truncated observe-seqno response".into()))
    };
    Ok(ObserveSeqnoResult {
        vbuuid: read_u64(3)?,
        persisted_seqno: read_u64(11)?,
        current_seqno: read_u64(19)?,
    })
}
