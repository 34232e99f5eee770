//! Streaming client for the Database Change Protocol (DCP) of a
//! partitioned document store.
//!
//! The client opens one long-lived stream per partition ("vbucket"),
//! maintains resumable stream offsets, applies server-directed flow
//! control, follows cluster topology changes streamed over a separate
//! HTTP channel, and surfaces an ordered sequence of typed change
//! events to a [`ChangeListener`].
//!
//! # Architecture
//!
//! - [`provider::ConfigProvider`] streams cluster configs over HTTP and
//!   publishes every new revision.
//! - The conductor (internal) owns one DCP connection per node, opens
//!   partition streams at their last committed offsets and drives
//!   reconnection and topology moves.
//! - The event dispatcher (internal) demultiplexes raw frames into the
//!   [`ChangeEvent`] taxonomy and hands each data event a
//!   flow-control receipt.
//!
//! Within one partition, events arrive in wire order: a
//! [`SnapshotDetails`] always precedes the mutations of its snapshot,
//! and each change's [`StreamOffset`] combines the partition's current
//! branch uuid, the change seqno and the enclosing snapshot. Across
//! partitions there is no ordering guarantee.

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod partition;
pub mod provider;
pub mod retry;
pub mod topology;

mod adapter;
mod client;
mod conductor;
mod dispatch;
#[cfg(feature = "tls")]
mod tls;
mod transport;

pub use client::Client;
pub use conductor::ObserveSeqnoResult;
pub use config::{
    ClientConfig, ClientConfigBuilder, Credentials, FlowControlMode, NetworkResolution,
};
pub use error::{Error, Result};
pub use events::{
    ChangeEvent, ChangeListener, DocumentChange, FailoverLogEvent, ListenerResult, Rollback,
    SnapshotDetails, StreamEnd, StreamEndReason, StreamFailure,
};
pub use host::HostAndPort;
pub use lifecycle::LifecycleState;
pub use partition::{
    FailoverLogEntry, SnapshotMarker, StreamOffset, StreamState, MAX_PARTITIONS,
};
pub use topology::BucketConfig;
