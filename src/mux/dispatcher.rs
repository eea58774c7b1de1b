//! Upstream dispatchers for the server side.
//!
//! A [`Dispatcher`] turns the [`Destination`] of a New frame into a real
//! connection. [`DirectDispatcher`] dials TCP or UDP; [`EchoDispatcher`]
//! loops every byte back and is meant for tests and smoke checks.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mux::frame::{Destination, TargetNetwork};

/// Any bidirectional byte stream usable as a session endpoint.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed upstream connection.
pub type BoxedConn = Box<dyn AsyncStream>;

/// Opens upstream connections for peer-originated sessions.
pub trait Dispatcher: Send + Sync + 'static {
    /// Connect to `destination`.
    ///
    /// Errors are reported to the peer as End(Error) for that session only.
    fn dispatch(&self, destination: &Destination)
        -> impl Future<Output = Result<BoxedConn>> + Send;
}

/// Dials destinations directly.
#[derive(Debug, Clone)]
pub struct DirectDispatcher {
    connect_timeout: Duration,
}

impl DirectDispatcher {
    /// Create a dispatcher with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, destination: &Destination) -> io::Result<BoxedConn> {
        match destination.network {
            TargetNetwork::Tcp => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect(destination.address.as_str()),
                )
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            TargetNetwork::Udp => {
                let peer = tokio::net::lookup_host(destination.address.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")
                    })?;
                Ok(Box::new(UdpConn::connect(peer).await?))
            }
            TargetNetwork::Unknown => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination network unknown",
            )),
        }
    }
}

impl Default for DirectDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, destination: &Destination) -> Result<BoxedConn> {
        let conn = self
            .connect(destination)
            .await
            .map_err(|e| Error::dispatch(destination, e))?;
        debug!(%destination, "upstream connected");
        Ok(conn)
    }
}

/// A connected UDP socket exposed as a stream.
///
/// Each read returns one datagram (truncated to the read buffer), each write
/// sends one datagram.
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
}

impl UdpConn {
    /// Bind an ephemeral local port and connect it to `peer`.
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self { socket })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Returns every byte written, for any destination.
#[derive(Debug, Clone)]
pub struct EchoDispatcher {
    buffer_size: usize,
}

impl EchoDispatcher {
    /// Create an echo dispatcher whose pipes buffer `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl Default for EchoDispatcher {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Dispatcher for EchoDispatcher {
    async fn dispatch(&self, destination: &Destination) -> Result<BoxedConn> {
        let (conn, sink) = tokio::io::duplex(self.buffer_size);
        let destination = destination.to_string();
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(sink);
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(n) => debug!(destination, bytes = n, "echo finished"),
                Err(e) => debug!(destination, error = %e, "echo failed"),
            }
            let _ = writer.shutdown().await;
        });
        Ok(Box::new(conn))
    }
}
