//! Client configuration surface.

use crate::host::HostAndPort;
use std::time::Duration;

/// Opaque username and password, used for both the HTTP config stream
/// (Basic auth) and SASL on the DCP sockets.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Which address view of the cluster to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkResolution {
    /// Primary addresses.
    Default,
    /// Pick per the seed-host heuristic on the first received config.
    Auto,
    /// A named alternate-address map, e.g. `external`.
    Named(String),
}

/// When flow-control receipts are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// Receipts are acknowledged on dispatch entry.
    Automatic,
    /// The listener must call `flow_control_ack()` on each data event.
    Manual,
}

/// Configuration for the streaming client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed hosts for the config stream (config service ports).
    pub seed_nodes: Vec<HostAndPort>,
    /// Credentials for HTTP Basic auth and SASL.
    pub credentials: Credentials,
    /// Bucket whose changes are streamed.
    pub bucket: String,
    /// Name announced in `DCP_OPEN`; shows up in server-side stats.
    pub connection_name: String,
    /// Use TLS transports and the SSL service ports.
    pub ssl_enabled: bool,
    /// Address view selection, see [`NetworkResolution`].
    pub network_resolution: NetworkResolution,
    /// Prefer pooled buffers for inbound frames. Advisory: frame
    /// buffers are refcounted `bytes` allocations either way.
    pub pool_buffers: bool,
    /// Per-attempt TCP connect timeout.
    pub socket_connect_timeout: Duration,
    /// Cap on waiting for the first config after `start()`.
    pub bootstrap_timeout: Duration,
    /// Delay between config-provider reconnect sweeps.
    pub config_provider_reconnect_delay: Duration,
    /// Cap on config-provider reconnect sweeps.
    pub config_provider_reconnect_max_attempts: u32,
    /// Delay between stream/connection re-open attempts.
    pub stream_reconnect_delay: Duration,
    /// Cap on stream/connection re-open attempts.
    pub stream_reconnect_max_attempts: u32,
    /// Per-connection flow control buffer size in bytes. Zero disables
    /// flow control.
    pub flow_control_buffer_size: u32,
    /// Fraction of the buffer that triggers a buffer-ack.
    pub flow_control_ack_threshold: f64,
    /// Automatic or manual receipt acknowledgement.
    pub flow_control_mode: FlowControlMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            credentials: Credentials::new("", ""),
            bucket: "default".to_string(),
            connection_name: "riptide".to_string(),
            ssl_enabled: false,
            network_resolution: NetworkResolution::Default,
            pool_buffers: true,
            socket_connect_timeout: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(30),
            config_provider_reconnect_delay: Duration::from_secs(1),
            config_provider_reconnect_max_attempts: u32::MAX,
            stream_reconnect_delay: Duration::from_secs(1),
            stream_reconnect_max_attempts: 16,
            flow_control_buffer_size: 20 * 1024 * 1024,
            flow_control_ack_threshold: 0.5,
            flow_control_mode: FlowControlMode::Automatic,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the seed host list (config service addresses).
    pub fn cluster_at(mut self, seeds: Vec<HostAndPort>) -> Self {
        self.config.seed_nodes = seeds;
        self
    }

    /// Add one seed host.
    pub fn seed(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.seed_nodes.push(HostAndPort::new(host, port));
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Credentials::new(username, password);
        self
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = name.into();
        self
    }

    pub fn ssl_enabled(mut self, enabled: bool) -> Self {
        self.config.ssl_enabled = enabled;
        self
    }

    pub fn network_resolution(mut self, resolution: NetworkResolution) -> Self {
        self.config.network_resolution = resolution;
        self
    }

    pub fn pool_buffers(mut self, enabled: bool) -> Self {
        self.config.pool_buffers = enabled;
        self
    }

    pub fn socket_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_connect_timeout = timeout;
        self
    }

    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.config.bootstrap_timeout = timeout;
        self
    }

    pub fn config_provider_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.config_provider_reconnect_delay = delay;
        self
    }

    pub fn config_provider_reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.config.config_provider_reconnect_max_attempts = attempts;
        self
    }

    pub fn stream_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.stream_reconnect_delay = delay;
        self
    }

    pub fn stream_reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.config.stream_reconnect_max_attempts = attempts;
        self
    }

    pub fn flow_control_buffer_size(mut self, bytes: u32) -> Self {
        self.config.flow_control_buffer_size = bytes;
        self
    }

    pub fn flow_control_ack_threshold(mut self, fraction: f64) -> Self {
        self.config.flow_control_ack_threshold = fraction;
        self
    }

    pub fn flow_control_mode(mut self, mode: FlowControlMode) -> Self {
        self.config.flow_control_mode = mode;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
