//! Bridges raw protocol frames to the typed change-event taxonomy.
//!
//! The adapter keeps its own partition-indexed bookkeeping, separate
//! from the conductor's table, so the event path can be reasoned about
//! in isolation: the current branch uuid (updated by every failover-log
//! response) and the current snapshot marker (updated by every snapshot
//! marker frame). Every emitted document change carries an offset
//! assembled from those two tables plus the frame's seqno.

use crate::config::FlowControlMode;
use crate::error::Error;
use crate::events::{
    ChangeEvent, ChangeListener, DocumentChange, FailoverLogEvent, Rollback, RollbackHandle,
    SnapshotDetails, StreamEnd, StreamEndReason, StreamFailure, StreamRestart,
};
use crate::flow::{FlowControlReceipt, FlowController};
use crate::metrics::ClientMetrics;
use crate::partition::{FailoverLogEntry, SnapshotMarker, StreamOffset, MAX_PARTITIONS};
use parking_lot::RwLock;
use riptide_protocol::{opcode, Frame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

pub(crate) struct EventAdapter {
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
    vbucket_to_uuid: Box<[AtomicU64]>,
    vbucket_to_current_snapshot: Box<[RwLock<SnapshotMarker>]>,
    mode: FlowControlMode,
    restart_tx: mpsc::UnboundedSender<StreamRestart>,
}

impl EventAdapter {
    pub fn new(mode: FlowControlMode, restart_tx: mpsc::UnboundedSender<StreamRestart>) -> Self {
        let uuids: Vec<AtomicU64> = (0..MAX_PARTITIONS).map(|_| AtomicU64::new(0)).collect();
        let snapshots: Vec<RwLock<SnapshotMarker>> = (0..MAX_PARTITIONS)
            .map(|_| RwLock::new(SnapshotMarker::default()))
            .collect();
        Self {
            listener: RwLock::new(None),
            vbucket_to_uuid: uuids.into_boxed_slice(),
            vbucket_to_current_snapshot: snapshots.into_boxed_slice(),
            mode,
            restart_tx,
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write() = Some(listener);
    }

    fn uuid(&self, vbucket: u16) -> u64 {
        self.vbucket_to_uuid
            .get(vbucket as usize)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn snapshot(&self, vbucket: u16) -> SnapshotMarker {
        self.vbucket_to_current_snapshot
            .get(vbucket as usize)
            .map(|slot| *slot.read())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Dispatch plumbing
    // ------------------------------------------------------------------

    fn dispatch(&self, event: ChangeEvent) -> Result<(), Error> {
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener
                .on_event(event)
                .map_err(|e| Error::Dispatch(e.to_string())),
            None => Ok(()),
        }
    }

    /// Reports a stream failure. An error raised while dispatching the
    /// failure itself cannot be reported anywhere; it is only logged.
    pub fn on_stream_failure(&self, partition: i32, cause: Error) {
        ClientMetrics::increment_stream_failures();
        let event = ChangeEvent::StreamFailure(StreamFailure {
            partition,
            cause: Arc::new(cause),
        });
        if let Err(e) = self.dispatch(event) {
            error!("Error occurred during stream failure event dispatch: {}", e);
        }
    }

    pub fn on_stream_end(&self, vbucket: u16, reason: StreamEndReason) {
        if let Err(e) = self.dispatch(ChangeEvent::StreamEnd(StreamEnd { vbucket, reason })) {
            error!("Failed to dispatch stream end event: {}", e);
            self.on_stream_failure(vbucket as i32, e);
        }
    }

    /// Records the newest branch uuid and emits the failover log. Fed
    /// both by failover-log responses and by stream-open responses,
    /// which carry the log in their body.
    pub fn on_failover_log(&self, vbucket: u16, entries: Vec<FailoverLogEntry>) {
        if let Some(first) = entries.first() {
            if let Some(slot) = self.vbucket_to_uuid.get(vbucket as usize) {
                slot.store(first.uuid, Ordering::Release);
            }
        }
        let event = ChangeEvent::FailoverLog(FailoverLogEvent { vbucket, entries });
        if let Err(e) = self.dispatch(event) {
            error!("Failed to dispatch failover log event: {}", e);
            self.on_stream_failure(vbucket as i32, e);
        }
    }

    // ------------------------------------------------------------------
    // Control frames
    // ------------------------------------------------------------------

    pub fn on_control(&self, flow: &Arc<FlowController>, frame: Frame) {
        let vbucket = frame.vbucket();
        if let Err(e) = self.handle_control(flow, &frame) {
            error!("Failed to dispatch control event: {}", e);
            self.on_stream_failure(vbucket as i32, e);
        }
    }

    fn handle_control(&self, flow: &Arc<FlowController>, frame: &Frame) -> Result<(), Error> {
        match frame.opcode() {
            opcode::DCP_SNAPSHOT_MARKER => {
                // Immediately ACK snapshot markers. Nothing else that
                // arrives here is ACK-able.
                flow.ack(frame.frame_len() as u32);
                let (start, end, flags) = frame.snapshot_marker()?;
                let vbucket = frame.vbucket();
                let marker = SnapshotMarker::new(start, end, flags);
                if let Some(slot) = self.vbucket_to_current_snapshot.get(vbucket as usize) {
                    *slot.write() = marker;
                }
                self.dispatch(ChangeEvent::SnapshotDetails(SnapshotDetails {
                    vbucket,
                    flags,
                    marker,
                }))
            }

            opcode::INTERNAL_ROLLBACK => {
                let vbucket = frame.vbucket();
                let seqno = frame.rollback_seqno()?;
                ClientMetrics::increment_rollbacks();
                let acted = Arc::new(AtomicBool::new(false));
                let handle = RollbackHandle::new(acted.clone(), self.restart_tx.clone());
                self.dispatch(ChangeEvent::Rollback(Rollback::new(vbucket, seqno, handle)))?;
                if !acted.load(Ordering::Acquire) {
                    self.on_stream_failure(vbucket as i32, Error::RollbackUnhandled(vbucket));
                }
                Ok(())
            }

            opcode::DCP_FAILOVER_LOG => {
                let vbucket = frame.vbucket();
                let entries = frame.failover_log()?;
                self.on_failover_log(vbucket, entries);
                Ok(())
            }

            other => {
                warn!("Unexpected control event type: {}", opcode::name(other));
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Data frames
    // ------------------------------------------------------------------

    /// Handles one data frame and returns the offset carried by the
    /// emitted event, or `None` when the frame was dropped.
    pub fn on_data(&self, flow: &Arc<FlowController>, frame: Frame) -> Option<StreamOffset> {
        let receipt = FlowControlReceipt::new(flow.clone(), frame.frame_len() as u32);
        if self.mode == FlowControlMode::Automatic {
            receipt.acknowledge();
        }

        let vbucket = frame.vbucket();
        let op = frame.opcode();
        match op {
            opcode::DCP_MUTATION | opcode::DCP_DELETION | opcode::DCP_EXPIRATION => {
                let fields = frame.by_seqno().and_then(|s| Ok((s, frame.revision_seqno()?)));
                let (seqno, revision) = match fields {
                    Ok(fields) => fields,
                    Err(e) => {
                        receipt.acknowledge();
                        error!("Failed to dispatch data event: {}", e);
                        self.on_stream_failure(vbucket as i32, e.into());
                        return None;
                    }
                };

                let offset = StreamOffset::new(self.uuid(vbucket), seqno, self.snapshot(vbucket));
                let change = DocumentChange {
                    vbucket,
                    offset,
                    key: frame.key_string(),
                    content: frame.value(),
                    cas: frame.cas(),
                    revision,
                    expiration: op == opcode::DCP_EXPIRATION,
                    receipt,
                };
                let event = if op == opcode::DCP_MUTATION {
                    ChangeEvent::Mutation(change)
                } else {
                    ChangeEvent::Deletion(change)
                };
                if let Err(e) = self.dispatch(event) {
                    error!("Failed to dispatch data event: {}", e);
                    self.on_stream_failure(vbucket as i32, e);
                }
                Some(offset)
            }

            other => {
                receipt.acknowledge();
                warn!("Unexpected data event type: {}", opcode::name(other));
                None
            }
        }
    }
}
