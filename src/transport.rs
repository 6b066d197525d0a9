use crate::address::Address;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// StreamId identifies a stream within a transport session; used for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RemoteStream is a duplex byte-stream handed out by a Transport.
/// Dropping it closes the stream.
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// id returns the stream's identifier for log lines
    fn id(&self) -> StreamId;
}

/// Transport opens streams to target addresses, typically over a
/// multiplexed session to a remote peer
pub trait Transport: Send + Sync + 'static {
    type Stream: RemoteStream;

    /// open_stream opens a stream to `target`
    fn open_stream(
        &self,
        target: &Address,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// DirectTransport dials every target over its own TCP connection
#[derive(Debug, Default)]
pub struct DirectTransport {
    next_id: AtomicU32,
}

impl DirectTransport {
    /// new creates a transport whose stream ids start at 1
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for DirectTransport {
    type Stream = DirectStream;

    fn open_stream(
        &self,
        target: &Address,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let target = target.clone();

        async move {
            let inner = match &target {
                Address::Socket(addr) => TcpStream::connect(addr).await?,
                Address::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await?,
            };
            inner.set_nodelay(true)?;

            Ok(DirectStream { id, inner })
        }
    }
}

/// DirectStream is a TCP connection opened by DirectTransport
#[derive(Debug)]
pub struct DirectStream {
    id: StreamId,
    inner: TcpStream,
}

impl RemoteStream for DirectStream {
    fn id(&self) -> StreamId {
        self.id
    }
}

impl AsyncRead for DirectStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DirectStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
