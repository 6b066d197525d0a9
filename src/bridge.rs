//! CONNECT bridging between a local client connection and a transport stream.

use crate::conn::{LocalConnection, describe_peer};
use crate::pool::BufferPool;
use crate::protocol::ReplyCode;
use crate::reply::send_reply;
use crate::request::Request;
use crate::transport::{RemoteStream, Transport};
use anyhow::Result;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Direction of a relay loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> remote stream
    Upstream,
    /// remote stream -> client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// RelayOutcome is what a finished relay loop reports: bytes copied or the
/// error that ended it
type RelayOutcome = (Direction, io::Result<u64>);

/// connect bridges a CONNECT request.
///
/// The success reply is written before the remote stream is opened, and the
/// stream is opened before any byte is relayed. A failure in either of those
/// steps is returned. Once relaying starts the result is always `Ok`:
/// relay errors and shutdown are logged, not reported.
///
/// The bridge returns as soon as one direction finishes or `shutdown` fires.
/// The other relay task is not awaited and its result is dropped; leaving
/// the function closes the stream, which ends that task. Awaiting both
/// directions would let a blocked peer hold shutdown hostage.
pub async fn connect<C, T>(
    mut conn: C,
    request: &Request,
    transport: &T,
    pool: &BufferPool,
    shutdown: &CancellationToken,
) -> Result<()>
where
    C: LocalConnection,
    T: Transport,
{
    let peer = describe_peer(&conn);
    let target = &request.target;

    info!("SOCKS5 accepted TCP connection {peer} -> {target}");

    // Reply first, the client must not see relayed bytes before it
    let bound = conn.local_addr()?;
    send_reply(&mut conn, ReplyCode::Succeeded, &bound, pool).await?;

    let stream = match transport.open_stream(target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("SOCKS5 failed to establish stream for {peer} -> {target}: {e}");
            return Err(e.into());
        }
    };
    let sid = stream.id();

    debug!("SOCKS5 stream {sid} established for {peer} -> {target}");

    // Closes the stream on every way out of this function
    let close = CancellationToken::new();
    let _close_on_exit = close.clone().drop_guard();

    let (results_tx, mut results_rx) = mpsc::channel::<RelayOutcome>(2);
    let (local_rd, local_wr) = tokio::io::split(conn);
    let (remote_rd, remote_wr) = tokio::io::split(stream);

    tokio::spawn(relay(
        Direction::Upstream,
        local_rd,
        remote_wr,
        close.clone(),
        results_tx.clone(),
    ));
    tokio::spawn(relay(
        Direction::Downstream,
        remote_rd,
        local_wr,
        close.clone(),
        results_tx,
    ));

    tokio::select! {
        outcome = results_rx.recv() => match outcome {
            Some((direction, Ok(bytes))) => {
                debug!("SOCKS5 stream {sid} {direction} finished after {bytes} bytes for {peer} -> {target}");
            }
            Some((direction, Err(e))) => {
                error!("SOCKS5 stream {sid} failed {direction} for {peer} -> {target}: {e}");
            }
            None => {}
        },
        _ = shutdown.cancelled() => {
            debug!("SOCKS5 connection {peer} -> {target} closed due to shutdown");
        }
    }

    debug!("SOCKS5 connection {peer} -> {target} closed");
    Ok(())
}

/// relay copies from `reader` to `writer` until EOF, an I/O error, or the
/// bridge closing the stream, then reports once on `results`
async fn relay<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    close: CancellationToken,
    results: mpsc::Sender<RelayOutcome>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        copied = tokio::io::copy(&mut reader, &mut writer) => copied,
        _ = close.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stream closed")),
    };

    // Capacity covers both loops; if the bridge is gone the result is discarded
    let _ = results.try_send((direction, result));
}
