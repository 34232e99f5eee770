//! Socket transport shared by the config provider and the DCP
//! connections.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::host::HostAndPort;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Wrapper for either plaintext or TLS streams.
///
/// The TLS variant is significantly larger, but boxing would add
/// indirection on every I/O operation.
#[allow(clippy::large_enum_variant)]
pub(crate) enum ClientStream {
    Plaintext(TcpStream),
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plaintext(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connects to the given address within the configured timeout, wrapping
/// the socket in TLS when `ssl_enabled` is set. Returns the stream and
/// the remote peer address.
pub(crate) async fn connect_stream(
    address: &HostAndPort,
    config: &ClientConfig,
) -> Result<(ClientStream, SocketAddr)> {
    let tcp = timeout(
        config.socket_connect_timeout,
        TcpStream::connect((address.host(), address.port())),
    )
    .await
    .map_err(|_| Error::Timeout(format!("connecting to {}", address)))??;
    let peer = tcp.peer_addr()?;

    if !config.ssl_enabled {
        return Ok((ClientStream::Plaintext(tcp), peer));
    }

    #[cfg(feature = "tls")]
    {
        let tls = crate::tls::wrap(tcp, address.host()).await?;
        Ok((ClientStream::Tls(tls), peer))
    }
    #[cfg(not(feature = "tls"))]
    {
        Err(Error::TlsUnavailable)
    }
}
