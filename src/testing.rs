//! In-memory transport and loopback helpers shared by unit tests.

use crate::address::Address;
use crate::transport::{RemoteStream, StreamId, Transport};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// MockStream is one end of an in-memory duplex that counts its drops
pub(crate) struct MockStream {
    id: StreamId,
    inner: DuplexStream,
    drops: Arc<AtomicUsize>,
}

impl RemoteStream for MockStream {
    fn id(&self) -> StreamId {
        self.id
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for MockStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// MockTransport hands out queued streams (or errors) and records targets
#[derive(Default)]
pub(crate) struct MockTransport {
    streams: Mutex<VecDeque<io::Result<MockStream>>>,
    pub(crate) opened: Mutex<Vec<Address>>,
    pub(crate) drops: Arc<AtomicUsize>,
}

impl MockTransport {
    /// with_stream queues a stream and returns the far end of it
    pub(crate) fn with_stream(&self) -> DuplexStream {
        let (near, far) = tokio::io::duplex(8192);
        let id = StreamId(self.streams.lock().unwrap().len() as u32 + 1);
        self.streams.lock().unwrap().push_back(Ok(MockStream {
            id,
            inner: near,
            drops: self.drops.clone(),
        }));
        far
    }

    pub(crate) fn with_error(&self, kind: io::ErrorKind) {
        self.streams.lock().unwrap().push_back(Err(kind.into()));
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    type Stream = MockStream;

    fn open_stream(&self, target: &Address) -> impl Future<Output = io::Result<MockStream>> + Send {
        self.opened.lock().unwrap().push(target.clone());
        let next = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(io::ErrorKind::NotConnected.into()));
        std::future::ready(next)
    }
}

/// tcp_pair returns (client, server) ends of a loopback TCP connection
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}
