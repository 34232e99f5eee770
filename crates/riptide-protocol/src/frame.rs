//! Frame parsing and typed field accessors.
//!
//! A [`Frame`] is a validated, zero-copy view over one complete wire
//! message. The header layout is fixed:
//!
//! ```text
//! magic(1) | opcode(1) | key_len(2) | extras_len(1) | data_type(1) |
//! vbucket(2) | total_body_len(4) | opaque(4) | cas(8)
//! ```
//!
//! followed by `extras || key || value`. Response frames reuse the
//! vbucket field as the status code.

use crate::error::{ProtocolError, Result};
use crate::opcode::{self, magic, ResponseStatus};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 24;

// Caps a single frame body so a misbehaving peer cannot exhaust memory.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// One entry of a partition's failover log. Entry 0 is the most recent
/// branch; uuids within one log are distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverLogEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// A parsed view over one complete request or response frame.
///
/// Cloning a frame clones the underlying refcounted buffer handle, not
/// the bytes. Accessors return slices into that buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    buf: Bytes,
}

impl Frame {
    /// Validates and wraps a complete frame buffer.
    pub fn parse(buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedFrame(format!(
                "buffer of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if buf[0] != magic::REQUEST && buf[0] != magic::RESPONSE {
            return Err(ProtocolError::MalformedFrame(format!(
                "unknown magic 0x{:02x}",
                buf[0]
            )));
        }

        let frame = Frame { buf };
        let declared = frame.total_body_len();
        let actual = frame.buf.len() - HEADER_SIZE;
        if declared != actual {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared body length {} disagrees with buffer length {}",
                declared, actual
            )));
        }
        if frame.extras_len() + frame.key_len() > declared {
            return Err(ProtocolError::MalformedFrame(format!(
                "extras ({}) and key ({}) exceed body length {}",
                frame.extras_len(),
                frame.key_len(),
                declared
            )));
        }
        Ok(frame)
    }

    // ------------------------------------------------------------------
    // Header fields
    // ------------------------------------------------------------------

    pub fn magic(&self) -> u8 {
        self.buf[0]
    }

    pub fn is_request(&self) -> bool {
        self.buf[0] == magic::REQUEST
    }

    pub fn is_response(&self) -> bool {
        self.buf[0] == magic::RESPONSE
    }

    pub fn opcode(&self) -> u8 {
        self.buf[1]
    }

    pub fn key_len(&self) -> usize {
        u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
    }

    pub fn extras_len(&self) -> usize {
        self.buf[4] as usize
    }

    pub fn data_type(&self) -> u8 {
        self.buf[5]
    }

    /// Partition id of a request frame. Response frames store the status
    /// code in the same slot; use [`Frame::status`] for those.
    pub fn vbucket(&self) -> u16 {
        u16::from_be_bytes([self.buf[6], self.buf[7]])
    }

    /// Status of a response frame.
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_code(u16::from_be_bytes([self.buf[6], self.buf[7]]))
    }

    pub fn total_body_len(&self) -> usize {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize
    }

    pub fn opaque(&self) -> u32 {
        u32::from_be_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]])
    }

    pub fn cas(&self) -> u64 {
        read_u64(&self.buf, 16).unwrap_or(0)
    }

    /// Total size of the frame on the wire, header included. This is the
    /// byte count a frame contributes to flow-control accounting.
    pub fn frame_len(&self) -> usize {
        self.buf.len()
    }

    // ------------------------------------------------------------------
    // Body sections
    // ------------------------------------------------------------------

    pub fn extras(&self) -> Bytes {
        let start = HEADER_SIZE;
        self.buf.slice(start..start + self.extras_len())
    }

    pub fn key(&self) -> Bytes {
        let start = HEADER_SIZE + self.extras_len();
        self.buf.slice(start..start + self.key_len())
    }

    pub fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.key()).into_owned()
    }

    pub fn value(&self) -> Bytes {
        let start = HEADER_SIZE + self.extras_len() + self.key_len();
        self.buf.slice(start..)
    }

    // ------------------------------------------------------------------
    // Typed accessors for known opcodes
    // ------------------------------------------------------------------

    /// By-sequence-number of a mutation, deletion or expiration
    /// (extras bytes 0..8).
    pub fn by_seqno(&self) -> Result<u64> {
        read_u64(&self.extras(), 0)
            .ok_or_else(|| self.malformed("missing by_seqno in extras"))
    }

    /// Revision seqno of a mutation, deletion or expiration
    /// (extras bytes 8..16).
    pub fn revision_seqno(&self) -> Result<u64> {
        read_u64(&self.extras(), 8)
            .ok_or_else(|| self.malformed("missing revision_seqno in extras"))
    }

    /// Snapshot marker fields `(start_seqno, end_seqno, flags)`.
    pub fn snapshot_marker(&self) -> Result<(u64, u64, u32)> {
        let extras = self.extras();
        let start = read_u64(&extras, 0);
        let end = read_u64(&extras, 8);
        let flags = read_u32(&extras, 16);
        match (start, end, flags) {
            (Some(start), Some(end), Some(flags)) if start <= end => Ok((start, end, flags)),
            (Some(start), Some(end), Some(_)) => Err(self.malformed(&format!(
                "snapshot start {} exceeds end {}",
                start, end
            ))),
            _ => Err(self.malformed("truncated snapshot marker extras")),
        }
    }

    /// Failover log entries from the value of a failover-log response or
    /// a stream-request response.
    pub fn failover_log(&self) -> Result<Vec<FailoverLogEntry>> {
        let value = self.value();
        if value.len() % 16 != 0 {
            return Err(self.malformed(&format!(
                "failover log length {} is not a multiple of 16",
                value.len()
            )));
        }
        let mut entries = Vec::with_capacity(value.len() / 16);
        for chunk in value.chunks_exact(16) {
            let uuid = read_u64(chunk, 0).ok_or_else(|| self.malformed("short failover entry"))?;
            let seqno = read_u64(chunk, 8).ok_or_else(|| self.malformed("short failover entry"))?;
            entries.push(FailoverLogEntry { uuid, seqno });
        }
        Ok(entries)
    }

    /// Rollback point carried in the value of a rollback response or the
    /// client's synthetic rollback frame.
    pub fn rollback_seqno(&self) -> Result<u64> {
        read_u64(&self.value(), 0)
            .ok_or_else(|| self.malformed("missing rollback seqno in value"))
    }

    /// Reason code from a stream-end frame (extras bytes 0..4).
    pub fn stream_end_reason(&self) -> Result<u32> {
        read_u32(&self.extras(), 0)
            .ok_or_else(|| self.malformed("missing stream end reason in extras"))
    }

    /// Acknowledged byte count from a buffer-ack frame.
    pub fn ack_bytes(&self) -> Result<u32> {
        read_u32(&self.extras(), 0)
            .ok_or_else(|| self.malformed("missing ack count in extras"))
    }

    fn malformed(&self, reason: &str) -> ProtocolError {
        ProtocolError::MalformedFrame(format!(
            "{} frame: {}",
            opcode::name(self.opcode()),
            reason
        ))
    }
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Reads exactly one frame from the stream.
///
/// Returns `Ok(None)` on a clean connection close at a frame boundary.
/// An EOF in the middle of a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len =
        u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_BODY_SIZE));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&header);
    buf.resize(HEADER_SIZE + body_len, 0);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;

    Frame::parse(buf.freeze()).map(Some)
}
