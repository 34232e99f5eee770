//! Public client facade.

use crate::conductor::{Conductor, ObserveSeqnoResult};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::events::ChangeListener;
use crate::lifecycle::LifecycleState;
use crate::partition::{FailoverLogEntry, StreamOffset, StreamState};
use crate::topology::BucketConfig;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Streaming client for a partitioned document store's change protocol.
///
/// ```rust,ignore
/// use riptide_client::{ChangeEvent, ChangeListener, Client, ClientConfig};
///
/// struct Printer;
/// impl ChangeListener for Printer {
///     fn on_event(&self, event: ChangeEvent) -> riptide_client::ListenerResult {
///         println!("{event:?}");
///         Ok(())
///     }
/// }
///
/// let config = ClientConfig::builder()
///     .seed("db1.example.com", 8091)
///     .credentials("reader", "secret")
///     .bucket("orders")
///     .build();
/// let client = Client::new(config);
/// client.listener(Arc::new(Printer));
/// client.start().await?;
/// ```
pub struct Client {
    config: Arc<ClientConfig>,
    conductor: Conductor,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let config = Arc::new(config);
        Self {
            conductor: Conductor::new(config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers the change listener. Must be set before `start()` for
    /// the listener to observe the initial stream opens.
    pub fn listener(&self, listener: Arc<dyn ChangeListener>) {
        self.conductor.adapter().set_listener(listener);
    }

    /// Seeds the resume position of one partition, typically from the
    /// application's checkpoint store. Zero offsets stream from the
    /// beginning.
    pub fn resume_at(&self, partition: u16, offset: StreamOffset) {
        self.conductor.seed_offset(partition, offset);
    }

    /// Connects and starts streaming changes to the listener.
    pub async fn start(&self) -> Result<()> {
        self.conductor.start().await
    }

    /// Graceful shutdown.
    pub async fn stop(&self) {
        self.conductor.stop().await
    }

    pub fn state(&self) -> LifecycleState {
        self.conductor.state()
    }

    pub fn stream_state(&self, partition: u16) -> StreamState {
        self.conductor.stream_state(partition)
    }

    /// Subscription to the cluster configs as they are applied.
    pub fn config_stream(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.conductor.config_stream()
    }

    /// Reads the current and persisted seqnos of one partition.
    pub async fn observe_seqno(&self, partition: u16, vbuuid: u64) -> Result<ObserveSeqnoResult> {
        self.conductor.observe_seqno(partition, vbuuid).await
    }

    /// Reads the failover log of one partition. The result is also fed
    /// through the event dispatcher, updating the branch uuid used for
    /// subsequent change offsets.
    pub async fn failover_log(&self, partition: u16) -> Result<Vec<FailoverLogEntry>> {
        self.conductor.failover_log(partition).await
    }
}
