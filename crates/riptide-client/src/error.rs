use bytes::Bytes;
use riptide_protocol::{ProtocolError, ResponseStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Bad response status: {status}")]
    BadResponseStatus {
        status: ResponseStatus,
        /// Value bytes of the response, available for inspection. A
        /// rollback response carries the rollback seqno here.
        value: Bytes,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Config endpoint returned HTTP {0}")]
    ConfigEndpoint(u16),

    #[error("TLS requested but the 'tls' feature is not enabled")]
    TlsUnavailable,

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Client is stopped")]
    Stopped,

    #[error("No seed nodes configured")]
    NoSeedNodes,

    #[error("No node hosts partition {0}")]
    NoNodeForPartition(u16),

    #[error("Rollback of partition {0} was not handled by the listener")]
    RollbackUnhandled(u16),

    #[error("All {attempts} attempts exhausted: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the failure is transient enough for the retry paths
    /// (reconnect sweeps, stream re-opens) to try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::IoError(_) | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::Timeout("connect".into()).is_retryable());
        assert!(!Error::Stopped.is_retryable());
        assert!(!Error::RollbackUnhandled(3).is_retryable());
    }
}
