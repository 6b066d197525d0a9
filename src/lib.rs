//! A SOCKS5 command bridge
//!
//! Accepts SOCKS5 requests on local connections and bridges CONNECT requests
//! to byte-streams opened through a [`Transport`], typically a multiplexed
//! session to a remote peer.
//!
//! - Features:
//!     - CONNECT bridged over any [`Transport`] (direct TCP included)
//!     - UDP ASSOCIATE relayed locally
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Graceful shutdown through a cancellation token
//!     - Transient-error classification for retry logic ([`errors::is_retryable`])
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksbridge::{DirectTransport, Socks5Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Socks5Server::new("127.0.0.1:1080", DirectTransport::new());
//!     server.run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod bridge;
pub mod commands;
pub mod conn;
pub mod errors;
pub mod pool;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod server;
pub mod transport;
pub mod udp;

#[cfg(test)]
mod testing;

// Re-export main types at crate root for convenience
pub use address::Address;
pub use auth::UserPass;
pub use commands::Handler;
pub use conn::LocalConnection;
pub use errors::{is_retryable, should_retry};
pub use pool::BufferPool;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use request::Request;
pub use server::Socks5Server;
pub use transport::{DirectTransport, RemoteStream, StreamId, Transport};
