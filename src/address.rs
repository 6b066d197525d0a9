use crate::protocol::AddressType;
use anyhow::{Result, anyhow, bail};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address is a SOCKS5 endpoint: either a resolved socket address or
/// a domain name and port left for the transport to resolve
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// port returns the port component of the address
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// parse_address_from_stream contains logic to parse the network address
/// from an incoming client connection request: IPv4, IPv6, or domain name
pub async fn parse_address_from_stream<R>(stream: &mut R) -> Result<Address>
where
    R: AsyncRead + Unpin,
{
    // Read address type byte from stream
    let mut atype = [0u8; 1];
    stream.read_exact(&mut atype).await?;

    let addr_type =
        AddressType::from_byte(atype[0]).ok_or_else(|| anyhow!("[ERR] unknown address type"))?;

    // Match type and extract address or domain name
    let dest_addr = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;

            Address::Socket(SocketAddr::from((Ipv4Addr::from(addr), port)))
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;

            if len[0] == 0 {
                bail!("[ERR] domain length cannot be 0");
            }

            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain_str = String::from_utf8(domain)?;
            let port = read_port(stream).await?;

            Address::Domain(domain_str, port)
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;

            Address::Socket(SocketAddr::from((Ipv6Addr::from(addr), port)))
        }
    };

    Ok(dest_addr)
}

/// read_port reads a big-endian (network order) port
async fn read_port<R>(stream: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

/// parse_address_from_packet contains logic to parse the network address
/// from an incoming UDP datagram packet: IPv4, IPv6, or domain name
/// and returns the address and number of bytes consumed in the operation
pub fn parse_address_from_packet(
    packet: &[u8],
    start_offset: usize,
    atyp: u8,
) -> Result<(Address, usize)> {
    // Set offset to maintain start
    let mut offset = start_offset;

    let address = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => parse_ipv4_address(packet, &mut offset)?,
        Some(AddressType::DomainName) => parse_domain_address(packet, &mut offset)?,
        Some(AddressType::IPv6) => parse_ipv6_address(packet, &mut offset)?,
        None => bail!("unknown address type: {atyp}"),
    };

    Ok((address, offset - start_offset))
}

/// parse_ipv4_address parses an IPv4 address and port from a byte slice
pub fn parse_ipv4_address(data: &[u8], offset: &mut usize) -> Result<Address> {
    // IPv4 address + port -> 6 bytes
    if *offset + 6 > data.len() {
        bail!("not enough data for IPv4 address and port");
    }

    let ip_bytes: [u8; 4] = data[*offset..*offset + 4]
        .try_into()
        .map_err(|_| anyhow!("invalid IPv4 bytes"))?;
    *offset += 4;

    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;

    Ok(Address::Socket(SocketAddr::from((
        Ipv4Addr::from(ip_bytes),
        port,
    ))))
}

/// parse_ipv6_address parses an IPv6 address and port from a byte slice
pub fn parse_ipv6_address(data: &[u8], offset: &mut usize) -> Result<Address> {
    // IPv6 address + port -> 18 bytes
    if *offset + 18 > data.len() {
        bail!("not enough data for IPv6 address and port");
    }

    let ip_bytes: [u8; 16] = data[*offset..*offset + 16]
        .try_into()
        .map_err(|_| anyhow!("invalid IPv6 bytes"))?;
    *offset += 16;

    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;

    Ok(Address::Socket(SocketAddr::from((
        Ipv6Addr::from(ip_bytes),
        port,
    ))))
}

/// parse_domain_address parses a length-prefixed domain and port from a byte slice
pub fn parse_domain_address(data: &[u8], offset: &mut usize) -> Result<Address> {
    if *offset + 1 > data.len() {
        bail!("not enough data to read domain length");
    }

    // First byte of domain contains number of octets
    let domain_len = data[*offset] as usize;

    if domain_len == 0 {
        bail!("domain length cannot be 0");
    }

    if *offset + 1 + domain_len + 2 > data.len() {
        bail!("not enough data for domain and port");
    }

    // Push offset to start of domain
    *offset += 1;

    let domain = String::from_utf8(data[*offset..*offset + domain_len].to_vec())
        .map_err(|e| anyhow!("invalid domain: {e}"))?;
    *offset += domain_len;

    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;

    Ok(Address::Domain(domain, port))
}
