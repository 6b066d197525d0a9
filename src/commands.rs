use crate::bridge;
use crate::conn::{LocalConnection, describe_peer};
use crate::pool::BufferPool;
use crate::protocol::Command;
use crate::request::Request;
use crate::transport::Transport;
use crate::udp;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handler routes parsed SOCKS5 requests. It owns the transport streams are
/// opened through, the reply buffer pool and the process-wide shutdown token,
/// and is shared by every connection task.
pub struct Handler<T> {
    transport: T,
    pool: BufferPool,
    shutdown: CancellationToken,
}

impl<T: Transport> Handler<T> {
    /// new creates a handler with a default sized buffer pool
    pub fn new(transport: T, shutdown: CancellationToken) -> Self {
        Self {
            transport,
            pool: BufferPool::default(),
            shutdown,
        }
    }

    /// transport returns the transport CONNECT streams are opened through
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// handle_command dispatches a request on its command. Commands other
    /// than CONNECT and UDP ASSOCIATE are logged and dropped without failing
    /// the caller.
    pub async fn handle_command<C>(&self, conn: C, request: &Request) -> Result<()>
    where
        C: LocalConnection,
    {
        let peer = describe_peer(&conn);

        match request.kind() {
            Some(Command::UdpAssociate) => {
                debug!("SOCKS5 UDP_ASSOCIATE from {peer}");
                udp::associate(conn, &self.pool, &self.shutdown).await
            }
            Some(Command::Connect) => {
                debug!("SOCKS5 CONNECT from {peer} to {}", request.target);
                bridge::connect(conn, request, &self.transport, &self.pool, &self.shutdown).await
            }
            Some(Command::Bind) | None => {
                debug!(
                    "unsupported SOCKS5 command {} from {peer}",
                    request.command
                );
                Ok(())
            }
        }
    }
}
