//! Server-driven flow control.
//!
//! Each connection tracks how many bytes it has consumed but not yet
//! acknowledged. Once the acknowledged total crosses a configured
//! fraction of the negotiated buffer size, a `DCP_BUFFER_ACK` is sent
//! and the counter resets. A server whose buffer fills up stops
//! transmitting, so unacknowledged receipts are backpressure.

use crate::metrics::ClientMetrics;
use bytes::Bytes;
use riptide_protocol::RequestBuilder;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Per-connection flow control accounting.
pub struct FlowController {
    buffer_size: u32,
    threshold: u32,
    acked: AtomicU32,
    writer: mpsc::UnboundedSender<Bytes>,
}

impl FlowController {
    /// `buffer_size` of zero disables flow control entirely.
    pub fn new(
        writer: mpsc::UnboundedSender<Bytes>,
        buffer_size: u32,
        ack_threshold: f64,
    ) -> Self {
        let threshold = ((buffer_size as f64) * ack_threshold).max(1.0) as u32;
        Self {
            buffer_size,
            threshold,
            acked: AtomicU32::new(0),
            writer,
        }
    }

    pub fn enabled(&self) -> bool {
        self.buffer_size > 0
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Credits `size` consumed bytes and emits a buffer-ack once the
    /// threshold is crossed.
    pub fn ack(&self, size: u32) {
        if !self.enabled() {
            return;
        }
        let total = self.acked.fetch_add(size, Ordering::AcqRel) + size;
        if total >= self.threshold {
            let to_ack = self.acked.swap(0, Ordering::AcqRel);
            if to_ack == 0 {
                return; // another acker already flushed
            }
            trace!("Sending buffer ack for {} bytes", to_ack);
            if let Ok(frame) = RequestBuilder::buffer_ack(to_ack).build() {
                let _ = self.writer.send(frame);
                ClientMetrics::increment_buffer_acks();
                ClientMetrics::add_bytes_acked(to_ack as u64);
            }
        }
    }
}

impl fmt::Debug for FlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowController")
            .field("buffer_size", &self.buffer_size)
            .field("threshold", &self.threshold)
            .field("acked", &self.acked.load(Ordering::Relaxed))
            .finish()
    }
}

/// One data event's contribution to flow control.
///
/// Every receipt is acknowledged exactly once, either explicitly by the
/// listener or implicitly by the dispatcher. Further calls are no-ops.
pub struct FlowControlReceipt {
    controller: Arc<FlowController>,
    size: u32,
    acknowledged: AtomicBool,
}

impl FlowControlReceipt {
    pub fn new(controller: Arc<FlowController>, size: u32) -> Self {
        Self {
            controller,
            size,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Credits this receipt's bytes. Idempotent.
    pub fn acknowledge(&self) {
        if !self.acknowledged.swap(true, Ordering::AcqRel) {
            self.controller.ack(self.size);
        }
    }
}

impl fmt::Debug for FlowControlReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowControlReceipt")
            .field("size", &self.size)
            .field("acknowledged", &self.acknowledged.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_protocol::Frame;

    fn controller(buffer: u32, threshold: f64) -> (Arc<FlowController>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(FlowController::new(tx, buffer, threshold)), rx)
    }

    #[test]
    fn test_threshold_triggers_single_ack() {
        let (flow, mut rx) = controller(1024, 0.5);

        flow.ack(300);
        assert!(rx.try_recv().is_err());

        flow.ack(300); // total 600 >= 512
        let frame = Frame::parse(rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.opcode(), riptide_protocol::opcode::DCP_BUFFER_ACK);
        assert_eq!(frame.ack_bytes().unwrap(), 600);

        // Counter reset: nothing further pending.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_receipt_is_idempotent() {
        let (flow, mut rx) = controller(1024, 0.5);
        let receipt = FlowControlReceipt::new(flow, 600);

        receipt.acknowledge();
        let frame = Frame::parse(rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.ack_bytes().unwrap(), 600);

        receipt.acknowledge();
        receipt.acknowledge();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_controller_sends_nothing() {
        let (flow, mut rx) = controller(0, 0.5);
        flow.ack(10_000);
        assert!(rx.try_recv().is_err());
    }
}
