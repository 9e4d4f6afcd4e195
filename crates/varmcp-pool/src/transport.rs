//! Transport handles and the dialer seam used to create them.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::trace;

use crate::config::Protocol;

/// A live byte stream owned by a pooled connection
///
/// Implemented for every `AsyncRead + AsyncWrite` stream, so `TcpStream`,
/// `UnixStream` and in-memory duplex streams can all be pooled.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + fmt::Debug {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + fmt::Debug {}

/// Boxed transport as stored inside a [`Connection`](crate::Connection)
pub type BoxedTransport = Box<dyn Transport>;

/// Establishes new transports for a pool
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Open a transport to `address` using `protocol`
    ///
    /// The pool applies its own dial timeout and the caller's cancellation
    /// around this future.
    async fn dial(&self, protocol: Protocol, address: &str) -> io::Result<BoxedTransport>;
}

/// Dialer backed by tokio TCP and Unix domain sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, protocol: Protocol, address: &str) -> io::Result<BoxedTransport> {
        trace!("Dialing {} {}", protocol, address);
        match protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Protocol::Unix => Ok(Box::new(UnixStream::connect(address).await?)),
            #[cfg(not(unix))]
            Protocol::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )),
        }
    }
}

/// Shut a transport down and release it
///
/// A peer that already went away is not an error.
pub(crate) async fn shutdown(mut transport: BoxedTransport) -> io::Result<()> {
    match transport.shutdown().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e),
    }
}
