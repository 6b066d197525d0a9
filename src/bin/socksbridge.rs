use anyhow::{Result, bail};
use clap::Parser;
use socksbridge::{DirectTransport, Socks5Server, auth::UserPass};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 command bridge", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass {
                username: u,
                password: p,
            })
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    // Ctrl-C stops the accept loop and every in-flight bridge
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        });
    }

    let server = Socks5Server::new(args.listen, DirectTransport::new())
        .with_auth(auth)
        .with_shutdown(shutdown);

    info!("Starting SOCKS5 bridge: {}", server.listen_addr);
    server.run().await
}
