use crate::{
    auth::{self, UserPass},
    commands::Handler,
    request,
    transport::Transport,
};
use anyhow::{Result, anyhow, bail};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server<T> {
    pub listen_addr: String,
    pub auth_config: Option<Arc<UserPass>>,
    transport: T,
    shutdown: CancellationToken,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl<T: Transport> Socks5Server<T> {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>, transport: T) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            auth_config: None,
            transport,
            shutdown: CancellationToken::new(),
            listener: None,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        // Arc allows shared ownership of UserPass
        self.auth_config = auth.map(Arc::new);
        self
    }

    /// with_shutdown sets the token that stops the server and every
    /// connection it is bridging
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// bind to the listen address; may only be called once
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections until shutdown, serving each on its own task
    pub async fn run(mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener not bound"))?;

        let shutdown = self.shutdown.clone();
        let handler = Arc::new(Handler::new(self.transport, self.shutdown));

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => {
                    info!("SOCKS5 proxy shutting down");
                    break;
                }
            };

            // A failed accept never stops the listener. Errors such as EMFILE
            // leave the socket readable, so wait before trying again.
            let (inbound, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                        _ = shutdown.cancelled() => {
                            info!("SOCKS5 proxy shutting down");
                            break;
                        }
                    }
                }
            };

            let auth_config = self.auth_config.clone();
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                info!("new client: {}", peer_addr);

                if let Err(e) = handle_connection(inbound, auth_config, handler).await {
                    error!("connection error: {}", e);
                }

                debug!("client {} done", peer_addr);
            });
        }

        Ok(())
    }
}

/// handle_connection runs the SOCKS5 handshake and hands the request to the handler
async fn handle_connection<T: Transport>(
    mut stream: TcpStream,
    auth_config: Option<Arc<UserPass>>,
    handler: Arc<Handler<T>>,
) -> Result<()> {
    auth::negotiate_auth(&mut stream, auth_config.as_deref()).await?;

    let request = request::read_request(&mut stream).await?;

    handler.handle_command(stream, &request).await
}
