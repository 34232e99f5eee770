//! Streaming config provider.
//!
//! Keeps one HTTP connection to any cluster node's config service and
//! republishes every new topology revision. The response body is an
//! unbounded sequence of JSON documents separated by the literal
//! `"\n\n\n\n"`; the provider accumulates chunks, splits out complete
//! documents, substitutes `$HOST` with the remote peer's IP, and emits
//! each config whose revision is strictly greater than the last.
//!
//! When the connection drops, the provider sweeps the current host list
//! (refreshed from every applied config) and retries the sweep with a
//! bounded delay until stopped.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::host::HostAndPort;
use crate::lifecycle::{LifecycleState, StateMachine};
use crate::metrics::ClientMetrics;
use crate::retry::Retry;
use crate::topology::{select_network, BucketConfig};
use crate::transport::{self, ClientStream};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const DOCUMENT_SEPARATOR: &[u8] = b"\n\n\n\n";

/// A source of cluster configs. Implementations keep new configs coming
/// in a resilient manner for as long as they are started.
#[async_trait::async_trait]
pub trait ConfigStream: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    fn configs(&self) -> broadcast::Receiver<Arc<BucketConfig>>;
}

/// Streams cluster configs from the config service of any reachable
/// node.
pub struct ConfigProvider {
    inner: Arc<ProviderInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum NetworkChoice {
    Undecided,
    Decided(Option<String>),
}

struct ProviderInner {
    client_config: Arc<ClientConfig>,
    hosts: RwLock<Vec<HostAndPort>>,
    seed_hosts: HashSet<String>,
    rev: AtomicI64,
    network: Mutex<NetworkChoice>,
    tx: broadcast::Sender<Arc<BucketConfig>>,
    stopped: Arc<AtomicBool>,
    lifecycle: StateMachine,
}

impl ConfigProvider {
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        let (tx, _) = broadcast::channel(16);
        let seed_hosts = client_config
            .seed_nodes
            .iter()
            .map(|h| h.host().to_string())
            .collect();
        let inner = Arc::new(ProviderInner {
            hosts: RwLock::new(client_config.seed_nodes.clone()),
            seed_hosts,
            rev: AtomicI64::new(-1),
            network: Mutex::new(NetworkChoice::Undecided),
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
            lifecycle: StateMachine::new("config.provider", LifecycleState::Disconnected),
            client_config,
        });
        Self {
            inner,
            task: Mutex::new(None),
        }
    }

    /// Subscription to every config this provider will publish.
    pub fn config_stream(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.inner.tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Connects to the first reachable seed host and starts streaming
    /// configs in the background. Fails when no host in the list is
    /// reachable; reconnects after that are retried per the configured
    /// policy.
    pub async fn start(&self) -> Result<()> {
        if self.inner.client_config.seed_nodes.is_empty() {
            return Err(Error::NoSeedNodes);
        }
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }

        let connection = self.inner.connect_any_host().await?;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run(connection).await });
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Stops streaming. Retry loops observe the stop flag and terminate
    /// without further attempts.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.lifecycle.transition(LifecycleState::Disconnecting);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.lifecycle.transition(LifecycleState::Disconnected);
        debug!("Streaming config provider shut down");
    }
}

#[async_trait::async_trait]
impl ConfigStream for ConfigProvider {
    async fn start(&self) -> Result<()> {
        ConfigProvider::start(self).await
    }

    async fn stop(&self) {
        ConfigProvider::stop(self).await
    }

    fn configs(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.config_stream()
    }
}

impl ProviderInner {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>, mut connection: ConfigConnection) {
        let mut scratch: Vec<u8> = Vec::new();
        loop {
            loop {
                match connection.next_chunk().await {
                    Ok(Some(chunk)) => {
                        scratch.extend_from_slice(&chunk);
                        self.drain_documents(&mut scratch, connection.peer);
                    }
                    Ok(None) => {
                        debug!("Config stream from {} ended", connection.peer);
                        break;
                    }
                    Err(e) => {
                        if !self.stopped() {
                            warn!("Config stream error: {}", e);
                        }
                        break;
                    }
                }
            }
            scratch.clear();
            self.lifecycle.transition(LifecycleState::Disconnected);
            if self.stopped() {
                return;
            }

            let inner = self.clone();
            let reconnect = Retry::any()
                .delay(self.client_config.config_provider_reconnect_delay)
                .max(self.client_config.config_provider_reconnect_max_attempts)
                .until_stopped(self.stopped.clone())
                .do_on_retry(|attempt, cause, delay| {
                    info!(
                        "No host usable to fetch a config from (attempt {}): {}; retrying in {:?}",
                        attempt, cause, delay
                    );
                })
                .run(move || {
                    let inner = inner.clone();
                    async move { inner.connect_any_host().await }
                })
                .await;

            match reconnect {
                Ok(conn) => connection = conn,
                Err(e) => {
                    if !self.stopped() {
                        warn!("Config provider giving up after exhausting retries: {}", e);
                    }
                    self.lifecycle.transition(LifecycleState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Tries every host in the current list once, in order.
    async fn connect_any_host(self: &Arc<Self>) -> Result<ConfigConnection> {
        self.lifecycle.transition(LifecycleState::Connecting);
        let hosts = self.hosts.read().clone();
        let mut last_error = Error::NoSeedNodes;
        for host in hosts {
            if self.stopped() {
                return Err(Error::Stopped);
            }
            match self.connect_host(&host).await {
                Ok(connection) => {
                    debug!("Established config connection to {}", host);
                    self.lifecycle.transition(LifecycleState::Connected);
                    return Ok(connection);
                }
                Err(e) => {
                    warn!("Could not get config from {}, trying next in list: {}", host, e);
                    last_error = e;
                }
            }
        }
        self.lifecycle.transition(LifecycleState::Disconnected);
        Err(last_error)
    }

    async fn connect_host(&self, host: &HostAndPort) -> Result<ConfigConnection> {
        let (stream, peer) = transport::connect_stream(host, &self.client_config).await?;
        let mut reader = BufReader::new(stream);

        let credentials = &self.client_config.credentials;
        let auth = BASE64.encode(format!("{}:{}", credentials.username, credentials.password));
        let request = format!(
            "GET /pools/default/bs/{} HTTP/1.1\r\n\
             Host: {}\r\n\
             Authorization: Basic {}\r\n\
             Accept: application/json\r\n\
             User-Agent: riptide\r\n\r\n",
            self.client_config.bucket,
            host.format(),
            auth,
        );
        reader.get_mut().write_all(request.as_bytes()).await?;
        reader.get_mut().flush().await?;

        // Status line, then headers up to the empty line.
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let code: u16 = line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::ConfigParse(format!("bad HTTP status line: {}", line.trim())))?;
        if code != 200 {
            return Err(Error::ConfigEndpoint(code));
        }

        let mut chunked = false;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("transfer-encoding")
                    && value.to_ascii_lowercase().contains("chunked")
                {
                    chunked = true;
                }
            }
        }

        Ok(ConfigConnection {
            reader,
            chunked,
            peer: peer.ip(),
        })
    }

    /// Splits every complete document out of the scratch buffer and
    /// processes it. The buffer is truncated past each separator
    /// regardless of parse outcome, so a bad document is consumed once
    /// and the stream resynchronizes on the next one.
    fn drain_documents(&self, scratch: &mut Vec<u8>, peer: IpAddr) {
        while let Some(index) = find_separator(scratch) {
            let document: Vec<u8> = scratch[..index].to_vec();
            scratch.drain(..index + DOCUMENT_SEPARATOR.len());
            self.process_document(&document, peer);
        }
    }

    fn process_document(&self, document: &[u8], peer: IpAddr) {
        let text = String::from_utf8_lossy(document);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let raw = text.replace("$HOST", &peer.to_string());

        let mut config = match BucketConfig::parse(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse streamed config: {}", e);
                ClientMetrics::increment_config_parse_failures();
                return;
            }
        };

        let previous = self.rev.fetch_max(config.rev, Ordering::SeqCst);
        if config.rev <= previous {
            trace!("Ignoring config, rev {} has not advanced past {}", config.rev, previous);
            return;
        }

        config.set_network(self.selected_network(&config));

        let hosts = config.config_hosts(self.client_config.ssl_enabled);
        if !hosts.is_empty() {
            trace!("Updated config stream node list to {:?}", hosts);
            *self.hosts.write() = hosts;
        }

        info!("Publishing bucket config rev {}", config.rev);
        ClientMetrics::increment_configs_published();
        ClientMetrics::set_config_revision(config.rev);
        let _ = self.tx.send(Arc::new(config));
    }

    /// The alternate-network decision is made once per provider
    /// lifetime, on the first received config.
    fn selected_network(&self, config: &BucketConfig) -> Option<String> {
        let mut choice = self.network.lock();
        match &*choice {
            NetworkChoice::Decided(network) => network.clone(),
            NetworkChoice::Undecided => {
                let selected = select_network(
                    config,
                    &self.client_config.network_resolution,
                    &self.seed_hosts,
                );
                info!(
                    "Selected network: {}",
                    selected.as_deref().unwrap_or("<default>")
                );
                *choice = NetworkChoice::Decided(selected.clone());
                selected
            }
        }
    }
}

struct ConfigConnection {
    reader: BufReader<ClientStream>,
    chunked: bool,
    peer: IpAddr,
}

impl ConfigConnection {
    /// Next slice of body bytes, transparently de-chunking. `None` on a
    /// clean end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.chunked {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let size_field = line.trim().split(';').next().unwrap_or("");
            let size = usize::from_str_radix(size_field, 16)
                .map_err(|_| Error::ConfigParse(format!("bad chunk size: {:?}", line.trim())))?;
            if size == 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; size + 2]; // data plus trailing CRLF
            self.reader.read_exact(&mut buf).await?;
            buf.truncate(size);
            Ok(Some(buf))
        } else {
            let mut buf = vec![0u8; 8192];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some(buf))
        }
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(DOCUMENT_SEPARATOR.len())
        .position(|window| window == DOCUMENT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkResolution;

    fn provider_with(config: ClientConfig) -> ConfigProvider {
        ConfigProvider::new(Arc::new(config))
    }

    fn doc(rev: i64) -> String {
        format!(
            r#"{{"rev": {}, "nodesExt": [{{"hostname": "$HOST", "services": {{"mgmt": 8091, "kv": 11210}}}}]}}"#,
            rev
        )
    }

    #[test]
    fn test_drain_splits_all_complete_documents() {
        let provider = provider_with(
            ClientConfig::builder().seed("127.0.0.1", 8091).build(),
        );
        let mut rx = provider.config_stream();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let mut scratch = format!("{}\n\n\n\n{}\n\n\n\npartial", doc(1), doc(2)).into_bytes();
        provider.inner.drain_documents(&mut scratch, peer);

        assert_eq!(rx.try_recv().unwrap().rev, 1);
        assert_eq!(rx.try_recv().unwrap().rev, 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(scratch, b"partial");
    }

    #[test]
    fn test_revision_is_monotone() {
        let provider = provider_with(
            ClientConfig::builder().seed("127.0.0.1", 8091).build(),
        );
        let mut rx = provider.config_stream();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        provider.inner.process_document(doc(5).as_bytes(), peer);
        provider.inner.process_document(doc(5).as_bytes(), peer);
        provider.inner.process_document(doc(3).as_bytes(), peer);
        provider.inner.process_document(doc(6).as_bytes(), peer);

        assert_eq!(rx.try_recv().unwrap().rev, 5);
        assert_eq!(rx.try_recv().unwrap().rev, 6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_host_substitution_uses_peer_ip() {
        let provider = provider_with(
            ClientConfig::builder().seed("127.0.0.1", 8091).build(),
        );
        let mut rx = provider.config_stream();
        let peer: IpAddr = "10.1.2.3".parse().unwrap();

        provider.inner.process_document(doc(1).as_bytes(), peer);

        let config = rx.try_recv().unwrap();
        assert_eq!(config.nodes[0].hostname.as_deref(), Some("10.1.2.3"));
        // The provider host list follows the published config.
        assert_eq!(
            *provider.inner.hosts.read(),
            vec![HostAndPort::new("10.1.2.3", 8091)]
        );
    }

    #[test]
    fn test_parse_failure_is_not_fatal_and_consumes_document() {
        let provider = provider_with(
            ClientConfig::builder().seed("127.0.0.1", 8091).build(),
        );
        let mut rx = provider.config_stream();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let mut scratch = format!("this is not json\n\n\n\n{}\n\n\n\n", doc(2)).into_bytes();
        provider.inner.drain_documents(&mut scratch, peer);

        assert_eq!(rx.try_recv().unwrap().rev, 2);
        assert!(scratch.is_empty());
    }

    #[test]
    fn test_network_selection_happens_once() {
        let config = ClientConfig::builder()
            .seed("ext.example.com", 8091)
            .network_resolution(NetworkResolution::Auto)
            .build();
        let provider = provider_with(config);
        let mut rx = provider.config_stream();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let with_alternate = r#"{
            "rev": 1,
            "nodesExt": [{
                "hostname": "10.0.0.1",
                "services": {"mgmt": 8091, "kv": 11210},
                "alternateAddresses": {
                    "external": {"hostname": "ext.example.com", "services": {"mgmt": 38091}}
                }
            }]
        }"#;
        provider.inner.process_document(with_alternate.as_bytes(), peer);
        assert_eq!(rx.try_recv().unwrap().network(), Some("external"));

        // A later config without any matching alternate keeps the
        // decision made on the first config.
        provider.inner.process_document(doc(2).as_bytes(), peer);
        assert_eq!(rx.try_recv().unwrap().network(), Some("external"));
    }

    #[test]
    fn test_find_separator() {
        assert_eq!(find_separator(b"abc\n\n\n\ndef"), Some(3));
        assert_eq!(find_separator(b"abc\n\n\ndef"), None);
    }
}
