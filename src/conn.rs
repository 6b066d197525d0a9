use crate::address::Address;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// LocalConnection is the client side of a bridged connection: a duplex
/// byte-stream whose local (bound) address is reported in the SOCKS5 reply
pub trait LocalConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// local_addr is the address this end of the connection is bound to
    fn local_addr(&self) -> io::Result<Address>;

    /// peer_addr is the client's address
    fn peer_addr(&self) -> io::Result<Address>;
}

impl LocalConnection for TcpStream {
    fn local_addr(&self) -> io::Result<Address> {
        TcpStream::local_addr(self).map(Address::from)
    }

    fn peer_addr(&self) -> io::Result<Address> {
        TcpStream::peer_addr(self).map(Address::from)
    }
}

// Unix sockets have no IP representation, so they are reported by path
// with port 0 (empty for unnamed sockets).
#[cfg(unix)]
impl LocalConnection for tokio::net::UnixStream {
    fn local_addr(&self) -> io::Result<Address> {
        tokio::net::UnixStream::local_addr(self).map(|addr| unix_address(&addr))
    }

    fn peer_addr(&self) -> io::Result<Address> {
        tokio::net::UnixStream::peer_addr(self).map(|addr| unix_address(&addr))
    }
}

#[cfg(unix)]
fn unix_address(addr: &tokio::net::unix::SocketAddr) -> Address {
    let path = addr
        .as_pathname()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    Address::Domain(path, 0)
}

/// describe_peer renders the client's address for log lines
pub fn describe_peer<C: LocalConnection>(conn: &C) -> String {
    match conn.peer_addr() {
        Ok(Address::Domain(path, _)) if path.is_empty() => "unix:unnamed".to_string(),
        Ok(addr) => addr.to_string(),
        Err(_) => "unknown".to_string(),
    }
}
