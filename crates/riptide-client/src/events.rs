//! The typed change-event taxonomy delivered to listeners.
//!
//! Events carry already-copied payloads; raw frame buffers never escape
//! the dispatcher. Listener callbacks run on the dispatch task of the
//! connection that received the frame, so listeners that may block must
//! offload to their own executor.

use crate::error::Error;
use crate::flow::FlowControlReceipt;
use crate::partition::{FailoverLogEntry, SnapshotMarker, StreamOffset};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of a listener callback. A returned error is folded into a
/// [`ChangeEvent::StreamFailure`] on the best-known partition.
pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives the demultiplexed change events of all partition streams.
pub trait ChangeListener: Send + Sync + 'static {
    fn on_event(&self, event: ChangeEvent) -> ListenerResult;
}

/// A demultiplexed, semantically typed change event.
#[derive(Debug)]
pub enum ChangeEvent {
    Mutation(DocumentChange),
    Deletion(DocumentChange),
    SnapshotDetails(SnapshotDetails),
    Rollback(Rollback),
    FailoverLog(FailoverLogEvent),
    StreamEnd(StreamEnd),
    StreamFailure(StreamFailure),
}

/// A document mutation, deletion or expiration.
pub struct DocumentChange {
    pub vbucket: u16,
    /// Resumable position of this change: the partition's current
    /// branch uuid, this change's seqno, and the enclosing snapshot.
    pub offset: StreamOffset,
    pub key: String,
    pub content: Bytes,
    pub cas: u64,
    pub revision: u64,
    /// For deletions, whether the document expired rather than being
    /// deleted explicitly. Always false for mutations.
    pub expiration: bool,
    pub(crate) receipt: FlowControlReceipt,
}

impl DocumentChange {
    /// Removes the backpressure generated by this event so the server
    /// can send more data.
    ///
    /// With flow control enabled, manual-mode listeners MUST call this
    /// once the event is processed, otherwise the server eventually
    /// stops sending. Idempotent: calls after the first are ignored.
    pub fn flow_control_ack(&self) {
        self.receipt.acknowledge();
    }
}

impl fmt::Debug for DocumentChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}={}",
            if self.expiration { "EXP" } else { "DOC" },
            self.vbucket,
            self.offset,
            self.key
        )
    }
}

/// A snapshot marker announcing the next by-seqno window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotDetails {
    pub vbucket: u16,
    pub flags: u32,
    pub marker: SnapshotMarker,
}

/// The server rejected a stream open and demands a rollback.
///
/// The listener decides the new offset and calls [`Rollback::resume_at`].
/// If it does neither, a [`StreamFailure`] for the partition follows.
pub struct Rollback {
    pub vbucket: u16,
    /// Highest seqno the server can resume from.
    pub seqno: u64,
    handle: RollbackHandle,
}

impl Rollback {
    pub(crate) fn new(vbucket: u16, seqno: u64, handle: RollbackHandle) -> Self {
        Self {
            vbucket,
            seqno,
            handle,
        }
    }

    /// Restarts the stream at the given offset.
    pub fn resume_at(&self, offset: StreamOffset) {
        self.handle.resume(self.vbucket, offset);
    }
}

impl fmt::Debug for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rollback")
            .field("vbucket", &self.vbucket)
            .field("seqno", &self.seqno)
            .finish()
    }
}

/// Resumes a rolled-back stream through the conductor.
pub(crate) struct RollbackHandle {
    acted: Arc<AtomicBool>,
    restart_tx: mpsc::UnboundedSender<StreamRestart>,
}

impl RollbackHandle {
    pub(crate) fn new(
        acted: Arc<AtomicBool>,
        restart_tx: mpsc::UnboundedSender<StreamRestart>,
    ) -> Self {
        Self { acted, restart_tx }
    }

    fn resume(&self, vbucket: u16, offset: StreamOffset) {
        self.acted.store(true, Ordering::Release);
        let _ = self.restart_tx.send(StreamRestart { vbucket, offset });
    }
}

/// Conductor-bound request to reopen one partition stream.
pub(crate) struct StreamRestart {
    pub vbucket: u16,
    pub offset: StreamOffset,
}

/// Failover log of one partition; entry 0 is the newest branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverLogEvent {
    pub vbucket: u16,
    pub entries: Vec<FailoverLogEntry>,
}

/// Why a stream ended, decoded from the stream-end flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// The stream reached its requested end seqno.
    Ok,
    /// The stream was closed by request.
    Closed,
    /// The partition moved; the stream must be reopened elsewhere.
    StateChanged,
    Disconnected,
    /// The client consumed too slowly.
    TooSlow,
    Unknown(u32),
}

impl From<u32> for StreamEndReason {
    fn from(code: u32) -> Self {
        match code {
            0 => StreamEndReason::Ok,
            1 => StreamEndReason::Closed,
            2 => StreamEndReason::StateChanged,
            3 => StreamEndReason::Disconnected,
            4 => StreamEndReason::TooSlow,
            other => StreamEndReason::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub vbucket: u16,
    pub reason: StreamEndReason,
}

/// A partition stream (or the whole client, partition -1) failed.
#[derive(Debug, Clone)]
pub struct StreamFailure {
    /// Affected partition, or -1 when no partition is identifiable.
    pub partition: i32,
    pub cause: Arc<Error>,
}
