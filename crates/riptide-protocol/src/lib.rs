//! Wire codec for the Database Change Protocol (DCP).
//!
//! DCP is the binary streaming protocol a partitioned document store uses
//! to push mutations, deletions and expirations to external subscribers.
//! Every message shares a fixed 24-byte header followed by
//! `extras || key || value`, with all integers big-endian.
//!
//! This crate provides:
//! - [`Frame`]: a zero-copy view over one complete request or response
//! - [`RequestBuilder`] / [`ResponseBuilder`]: single-use frame assembly
//! - [`read_frame`]: async reader yielding one frame at a time
//! - opcode and status constants under [`opcode`] and [`ResponseStatus`]

mod error;
mod frame;
mod request;

pub mod opcode;

pub use error::{ProtocolError, Result};
pub use frame::{read_frame, FailoverLogEntry, Frame, HEADER_SIZE, MAX_BODY_SIZE};
pub use opcode::{magic, ResponseStatus};
pub use request::{RequestBuilder, ResponseBuilder};
