use crate::address::{Address, parse_address_from_stream};
use crate::protocol::{Command, Version};
use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Request is a parsed SOCKS5 request: the raw command byte and the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: Address,
}

impl Request {
    /// kind interprets the command byte; `None` for commands SOCKS5 does not define
    pub fn kind(&self) -> Option<Command> {
        Command::from_byte(self.command)
    }
}

/// read_request reads a SOCKS5 request after method negotiation
pub async fn read_request<R>(stream: &mut R) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    // Not checking RSV (RESERVED) -> 0x00
    let version = reqbuf[0];
    let command = reqbuf[1];

    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    let target = parse_address_from_stream(stream).await?;

    Ok(Request { command, target })
}
