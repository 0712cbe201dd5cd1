//! Network module - Handles mutual-TLS exchanges between build clients and deploy servers
//!
//! Provides:
//! - Server for accepting connections and replacing executables
//! - Client for pushing builds and querying remote packages
//! - The one-exchange connection wrapper both sides speak through

mod client;
mod connection;
mod handler;
mod hook;
mod registry;
mod server;
mod tls;

pub use client::*;
pub use connection::*;
pub use handler::*;
pub use hook::*;
pub use registry::*;
pub use server::*;
pub use tls::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bound on the client's TCP connect plus TLS handshake
    pub connect_timeout: Duration,
    /// Bound on the server waiting for a connection's stream and operation byte
    pub stream_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stream_timeout: Duration::from_secs(15),
        }
    }
}

/// Resolve a deploy target, adding the default port when none is given
pub async fn resolve_target(target: &str) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = if target.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        target.to_string()
    } else {
        format!("{}:{}", target, crate::protocol::DEFAULT_PORT)
    };
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", target),
        )
    })
}
