//! Deploy server
//!
//! The server accepts connections from build clients and hands each one to
//! a fixed pool of handlers. Admission never blocks the accept loop: when
//! every handler is busy and the queue is full, the connection is dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsAcceptor;

use super::connection::{Connection, ConnectionError};
use super::handler::Dispatcher;
use super::registry::{PackageRegistry, RegistryHandle};
use super::tls::TlsError;
use super::NetworkConfig;
use crate::config::{ConfigError, ServerConfig};
use crate::pool::WorkerPool;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Pause before accepting again after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Deploy server
pub struct Server {
    address: String,
    handler_count: usize,
    acceptor: TlsAcceptor,
    dispatcher: Dispatcher,
    network: NetworkConfig,
}

impl Server {
    /// Create a new server from its configuration and TLS identity
    pub fn new(config: &ServerConfig, acceptor: TlsAcceptor) -> Self {
        let registry = RegistryHandle::new(PackageRegistry::new(config.packages.clone()));

        Self {
            address: config.address.clone(),
            handler_count: config.handler_count(),
            acceptor,
            dispatcher: Dispatcher::new(registry),
            network: NetworkConfig::default(),
        }
    }

    pub fn with_network_config(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        self.dispatcher.registry()
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", self.address, e))
        })?;

        tracing::info!("Server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until `shutdown` completes, then drain the handler pool
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let pool = WorkerPool::new("handler", self.handler_count, self.handler_count);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.admit(&pool, stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            // Errors like EMFILE persist until a connection closes
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Server shutdown requested");
                    break;
                }
            }
        }

        drop(listener);
        pool.shutdown().await;
        tracing::info!("Server stopped");
        Ok(())
    }

    fn admit(&self, pool: &WorkerPool, stream: TcpStream, addr: SocketAddr) {
        tracing::debug!("New connection from {}", addr);

        let job = serve_connection(
            self.acceptor.accept(stream),
            addr.to_string(),
            self.dispatcher.clone(),
            self.network.stream_timeout,
        );

        if let Err(e) = pool.try_submit(job) {
            tracing::warn!("Dropping connection from {}, pool may overflow: {}", addr, e);
        }
    }
}

/// Run one exchange on a connection whose stream comes from `handshake`.
///
/// The handshake and the operation byte must both arrive before
/// `stream_timeout` elapses, otherwise the connection is abandoned.
pub async fn serve_connection<H, S>(
    handshake: H,
    peer: String,
    dispatcher: Dispatcher,
    stream_timeout: Duration,
) where
    H: Future<Output = std::io::Result<S>>,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let deadline = Instant::now() + stream_timeout;
    let opened = timeout_at(deadline, async {
        let stream = handshake.await?;
        let mut conn = Connection::new(stream, peer.clone());
        let raw_op = conn.read_operation().await?;
        Ok::<_, ConnectionError>((conn, raw_op))
    })
    .await;

    let (mut conn, raw_op) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            tracing::warn!("Connection from {} failed before a request arrived: {}", peer, e);
            return;
        }
        Err(_) => {
            tracing::warn!("No request from {} within {:?}, abandoning", peer, stream_timeout);
            return;
        }
    };

    if let Err(e) = dispatcher.dispatch(raw_op, &mut conn).await {
        tracing::error!("Handle incoming connection from {} failed: {}", peer, e);
        return;
    }

    if let Err(e) = conn.close().await {
        tracing::debug!("Closing connection from {} failed: {}", peer, e);
    }
}

/// Re-read the server config and swap in its package table.
///
/// Everything else in the file is ignored until restart.
pub async fn reload_packages(path: &Path, registry: &RegistryHandle) -> ServerResult<usize> {
    let config = ServerConfig::load(path)?;
    let count = config.packages.len();
    registry.replace(PackageRegistry::new(config.packages)).await;
    Ok(count)
}

/// Reload the package table every time the process receives SIGUSR2
#[cfg(unix)]
pub fn spawn_reload_watcher(
    path: PathBuf,
    registry: RegistryHandle,
) -> ServerResult<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signals = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        while signals.recv().await.is_some() {
            match reload_packages(&path, &registry).await {
                Ok(count) => tracing::info!(
                    "Reloaded {} packages from {}",
                    count,
                    path.display()
                ),
                Err(e) => tracing::error!("Reload of {} failed: {}", path.display(), e),
            }
        }
    }))
}
