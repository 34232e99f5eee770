//! Single-use frame builders.
//!
//! Builders assemble one frame and then refuse further use: calling
//! `build()` twice fails with [`ProtocolError::BuilderReused`]. Callers
//! that need to resubmit a request build a fresh one.

use crate::error::{ProtocolError, Result};
use crate::opcode::{self, magic, ResponseStatus};
use bytes::{BufMut, Bytes, BytesMut};

/// Builder for request frames, including the typed DCP requests the
/// client sends.
pub struct RequestBuilder {
    opcode: u8,
    data_type: u8,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
    used: bool,
}

impl RequestBuilder {
    pub fn request(opcode: u8) -> Self {
        Self {
            opcode,
            data_type: 0,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
            used: false,
        }
    }

    pub fn vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Encodes the frame. Single-use: a second call fails with
    /// [`ProtocolError::BuilderReused`].
    pub fn build(&mut self) -> Result<Bytes> {
        if self.used {
            return Err(ProtocolError::BuilderReused);
        }
        self.used = true;
        Ok(encode(
            magic::REQUEST,
            self.opcode,
            self.data_type,
            self.vbucket,
            self.opaque,
            self.cas,
            &self.extras,
            &self.key,
            &self.value,
        ))
    }

    // ------------------------------------------------------------------
    // Typed requests
    // ------------------------------------------------------------------

    /// `DCP_OPEN` naming this connection as a change consumer.
    pub fn open_connection(name: &str) -> Self {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(0); // reserved seqno
        extras.put_u32(1); // producer flag: the server sends, we consume
        Self::request(opcode::DCP_OPEN)
            .extras(extras.freeze())
            .key(Bytes::copy_from_slice(name.as_bytes()))
    }

    /// SASL PLAIN authentication with the given credentials.
    pub fn sasl_auth_plain(username: &str, password: &str) -> Self {
        let mut value = BytesMut::with_capacity(username.len() + password.len() + 2);
        value.put_u8(0);
        value.put_slice(username.as_bytes());
        value.put_u8(0);
        value.put_slice(password.as_bytes());
        Self::request(opcode::SASL_AUTH)
            .key(Bytes::from_static(b"PLAIN"))
            .value(value.freeze())
    }

    /// `DCP_CONTROL` negotiating one named connection setting.
    pub fn control(name: &str, value: &str) -> Self {
        Self::request(opcode::DCP_CONTROL)
            .key(Bytes::copy_from_slice(name.as_bytes()))
            .value(Bytes::copy_from_slice(value.as_bytes()))
    }

    /// `DCP_STREAM_REQUEST` opening one partition stream at the given
    /// resume position. Extras layout: flags, reserved, start seqno,
    /// end seqno, vbuuid, snapshot start, snapshot end.
    #[allow(clippy::too_many_arguments)]
    pub fn stream_request(
        vbucket: u16,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        vbuuid: u64,
        snapshot_start: u64,
        snapshot_end: u64,
    ) -> Self {
        let mut extras = BytesMut::with_capacity(48);
        extras.put_u32(flags);
        extras.put_u32(0); // reserved
        extras.put_u64(start_seqno);
        extras.put_u64(end_seqno);
        extras.put_u64(vbuuid);
        extras.put_u64(snapshot_start);
        extras.put_u64(snapshot_end);
        Self::request(opcode::DCP_STREAM_REQUEST)
            .vbucket(vbucket)
            .extras(extras.freeze())
    }

    /// `OBSERVE_SEQNO` for one partition; the body is the 8-byte vbuuid.
    pub fn observe_seqno(vbucket: u16, vbuuid: u64) -> Self {
        Self::request(opcode::OBSERVE_SEQNO)
            .vbucket(vbucket)
            .value(Bytes::copy_from_slice(&vbuuid.to_be_bytes()))
    }

    /// `DCP_FAILOVER_LOG` read for one partition. No body.
    pub fn failover_log(vbucket: u16) -> Self {
        Self::request(opcode::DCP_FAILOVER_LOG).vbucket(vbucket)
    }

    /// `DCP_BUFFER_ACK` reporting consumed bytes back to the server.
    pub fn buffer_ack(bytes: u32) -> Self {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(bytes);
        Self::request(opcode::DCP_BUFFER_ACK).extras(extras.freeze())
    }

    /// The client-internal rollback frame synthesized when a stream
    /// request is answered with a rollback status.
    pub fn internal_rollback(vbucket: u16, seqno: u64) -> Self {
        Self::request(opcode::INTERNAL_ROLLBACK)
            .vbucket(vbucket)
            .value(Bytes::copy_from_slice(&seqno.to_be_bytes()))
    }
}

/// Builder for response frames. The client itself never sends responses;
/// this exists for server fakes in tests and tooling.
pub struct ResponseBuilder {
    opcode: u8,
    status: ResponseStatus,
    opaque: u32,
    cas: u64,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
    used: bool,
}

impl ResponseBuilder {
    pub fn response(opcode: u8) -> Self {
        Self {
            opcode,
            status: ResponseStatus::Success,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
            used: false,
        }
    }

    pub fn status(mut self, status: ResponseStatus) -> Self {
        self.status = status;
        self
    }

    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Encodes the frame. Single-use, like [`RequestBuilder::build`].
    pub fn build(&mut self) -> Result<Bytes> {
        if self.used {
            return Err(ProtocolError::BuilderReused);
        }
        self.used = true;
        Ok(encode(
            magic::RESPONSE,
            self.opcode,
            0,
            self.status.code(),
            self.opaque,
            self.cas,
            &self.extras,
            &self.key,
            &self.value,
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn encode(
    magic: u8,
    opcode: u8,
    data_type: u8,
    vbucket_or_status: u16,
    opaque: u32,
    cas: u64,
    extras: &Bytes,
    key: &Bytes,
    value: &Bytes,
) -> Bytes {
    let body_len = extras.len() + key.len() + value.len();
    let mut buf = BytesMut::with_capacity(crate::frame::HEADER_SIZE + body_len);
    buf.put_u8(magic);
    buf.put_u8(opcode);
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(data_type);
    buf.put_u16(vbucket_or_status);
    buf.put_u32(body_len as u32);
    buf.put_u32(opaque);
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn test_builder_is_single_use() {
        let mut builder = RequestBuilder::failover_log(2);
        assert!(builder.build().is_ok());
        assert!(matches!(
            builder.build().unwrap_err(),
            ProtocolError::BuilderReused
        ));
    }

    #[test]
    fn test_response_builder_is_single_use() {
        let mut builder = ResponseBuilder::response(opcode::DCP_STREAM_REQUEST);
        assert!(builder.build().is_ok());
        assert!(matches!(
            builder.build().unwrap_err(),
            ProtocolError::BuilderReused
        ));
    }

    #[test]
    fn test_observe_seqno_encoding() {
        let bytes = RequestBuilder::observe_seqno(3, 0x0102030405060708)
            .build()
            .unwrap();

        // 24 byte header plus the 8 byte vbuuid body.
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], magic::REQUEST);
        assert_eq!(bytes[1], opcode::OBSERVE_SEQNO);
        assert_eq!(&bytes[6..8], &[0x00, 0x03]);
        assert_eq!(&bytes[8..12], &8u32.to_be_bytes());
        assert_eq!(
            &bytes[24..32],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_stream_request_round_trip() {
        let bytes = RequestBuilder::stream_request(42, 0, 500, u64::MAX, 0xCAFE, 400, 600)
            .opaque(9)
            .build()
            .unwrap();
        let frame = Frame::parse(bytes).unwrap();

        assert_eq!(frame.opcode(), opcode::DCP_STREAM_REQUEST);
        assert_eq!(frame.vbucket(), 42);
        assert_eq!(frame.opaque(), 9);

        let extras = frame.extras();
        assert_eq!(extras.len(), 48);
        let field = |offset: usize| {
            u64::from_be_bytes(extras[offset..offset + 8].try_into().unwrap())
        };
        assert_eq!(field(8), 500); // start seqno
        assert_eq!(field(16), u64::MAX); // end seqno
        assert_eq!(field(24), 0xCAFE); // vbuuid
        assert_eq!(field(32), 400); // snapshot start
        assert_eq!(field(40), 600); // snapshot end
    }

    #[test]
    fn test_sasl_auth_plain_body() {
        let bytes = RequestBuilder::sasl_auth_plain("user", "pass").build().unwrap();
        let frame = Frame::parse(bytes).unwrap();
        assert_eq!(frame.key_string(), "PLAIN");
        assert_eq!(&frame.value()[..], b"\0user\0pass");
    }

    #[test]
    fn test_buffer_ack_extras() {
        let bytes = RequestBuilder::buffer_ack(600).build().unwrap();
        let frame = Frame::parse(bytes).unwrap();
        assert_eq!(frame.ack_bytes().unwrap(), 600);
    }

    #[test]
    fn test_internal_rollback_round_trip() {
        let bytes = RequestBuilder::internal_rollback(7, 400).build().unwrap();
        let frame = Frame::parse(bytes).unwrap();
        assert_eq!(frame.opcode(), opcode::INTERNAL_ROLLBACK);
        assert_eq!(frame.vbucket(), 7);
        assert_eq!(frame.rollback_seqno().unwrap(), 400);
    }
}
