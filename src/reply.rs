use crate::address::Address;
use crate::pool::BufferPool;
use crate::protocol::{AddressType, RSV, ReplyCode, Version};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// encode_reply appends a SOCKS5 reply frame for `bound` to `buf`
pub fn encode_reply(buf: &mut Vec<u8>, reply_code: ReplyCode, bound: &Address) -> io::Result<()> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    buf.extend_from_slice(&[Version::SOCKS5 as u8, reply_code as u8, RSV]);
    put_address(buf, bound)
}

/// put_address appends ATYP, address and big-endian port.
///
/// IPv4 is tried first (an IPv4-mapped IPv6 address counts as IPv4), then
/// IPv6. Anything that is not an IP, such as a unix socket path, falls back
/// to the length-prefixed domain form.
pub fn put_address(buf: &mut Vec<u8>, addr: &Address) -> io::Result<()> {
    match addr {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&v4.ip().octets());
        }
        Address::Socket(SocketAddr::V6(v6)) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => {
                buf.push(AddressType::IPv4 as u8);
                buf.extend_from_slice(&v4.octets());
            }
            None => {
                buf.push(AddressType::IPv6 as u8);
                buf.extend_from_slice(&v6.ip().octets());
            }
        },
        Address::Domain(host, _) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("domain too long for SOCKS5: {} bytes", host.len()),
                )
            })?;
            buf.push(AddressType::DomainName as u8);
            buf.push(len);
            buf.extend_from_slice(host.as_bytes());
        }
    }

    buf.extend_from_slice(&addr.port().to_be_bytes());
    Ok(())
}

/// send_reply encodes a reply into a pooled buffer and writes it to the client.
/// The buffer goes back to the pool whether or not the write succeeds.
pub async fn send_reply<W>(
    writer: &mut W,
    reply_code: ReplyCode,
    bound: &Address,
    pool: &BufferPool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    encode_reply(&mut buf, reply_code, bound)?;
    writer.write_all(&buf).await
}
