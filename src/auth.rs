use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// negotiate_auth handles authentication negotiation between the SOCKS server and client
pub async fn negotiate_auth<S>(stream: &mut S, auth_config: Option<&UserPass>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    let method = select_auth_method(&methods, auth_config.is_some());

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

    match method {
        AuthMethod::UserPass => {
            let creds = auth_config
                .ok_or_else(|| anyhow!("[ERR] username/password required but not configured"))?;
            authenticate_userpass(stream, creds).await
        }
        AuthMethod::NoAuth => Ok(()),
        AuthMethod::NoAcceptable => bail!("[ERR] no acceptable authentication method"),
    }
}

/// authenticate_userpass handles username/password authentication according to RFC 1929
async fn authenticate_userpass<S>(stream: &mut S, server_creds: &UserPass) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;

    if ver[0] != USERPASS_VERSION {
        bail!("[ERR] invalid username/password subnegotiation version");
    }

    let username = read_field(stream).await?;
    let password = read_field(stream).await?;

    let status = if username != server_creds.username.as_bytes()
        || password != server_creds.password.as_bytes()
    {
        AuthStatus::Failure
    } else {
        AuthStatus::Success
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;

    match status {
        AuthStatus::Success => Ok(()),
        AuthStatus::Failure => bail!("[ERR] authentication failed"),
    }
}

/// read_field reads a one-byte length followed by that many bytes
async fn read_field<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;

    let mut field = vec![0u8; len[0] as usize];
    stream.read_exact(&mut field).await?;
    Ok(field)
}

/// select_auth_method picks the method to use from those offered by the client.
/// With credentials configured only username/password is acceptable.
fn select_auth_method(client_methods: &[u8], credentials_configured: bool) -> AuthMethod {
    let wanted = if credentials_configured {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };

    if client_methods.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    }
}
