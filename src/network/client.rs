//! Deploy client
//!
//! Pushes freshly built binaries to deploy servers and queries the packages
//! they hold. Every call opens its own connection and performs one exchange.

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::connection::{Connection, ConnectionError};
use super::tls::{client_connector, server_name, TlsError};
use super::{resolve_target, NetworkConfig};
use crate::config::{BuildPackage, TlsConfig};
use crate::digest::{digest_bytes, read_and_hash};
use crate::protocol::{
    CodecError, ErrorCode, Operation, Package, PackageInfo, PackageName, PackageReplace,
    PackageReplaceResponse, Request, Response,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Package `{0}` has no deploy target")]
    NoTarget(String),

    #[error("Server error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Signature mismatch for package `{0}`")]
    SignatureMismatch(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Opens mutually authenticated connections to deploy servers
#[derive(Clone)]
pub struct DeployClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    config: NetworkConfig,
}

impl DeployClient {
    /// Create a client from its TLS identity
    pub fn new(tls: &TlsConfig) -> ClientResult<Self> {
        Ok(Self {
            connector: client_connector(tls)?,
            server_name: server_name(&tls.server_name)?,
            config: NetworkConfig::default(),
        })
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect and complete the TLS handshake within the connect timeout
    pub async fn connect(&self, target: &str) -> ClientResult<Connection<TlsStream<TcpStream>>> {
        let addr = resolve_target(target).await?;

        let connecting = async {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            self.connector.connect(self.server_name.clone(), tcp).await
        };

        let stream = tokio::time::timeout(self.config.connect_timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(target.to_string()))??;

        tracing::debug!("Connected to {} ({})", target, addr);
        Ok(Connection::new(stream, target))
    }

    /// Upload a built package to its configured deploy target
    pub async fn deploy(&self, name: &str, package: &BuildPackage) -> ClientResult<PackageReplaceResponse> {
        let target = package
            .deploy
            .as_deref()
            .ok_or_else(|| ClientError::NoTarget(name.to_string()))?;

        deploy_on(self.connect(target).await?, name, package).await
    }

    /// Size and digest of a package on a server
    pub async fn info(&self, target: &str, name: &str) -> ClientResult<PackageInfo> {
        let mut conn = self.connect(target).await?;
        let info = fetch_info(&mut conn, name).await?;
        Ok(finish(conn, info).await)
    }

    /// Download a package from a server
    pub async fn get(&self, target: &str, name: &str) -> ClientResult<Package> {
        let mut conn = self.connect(target).await?;
        let package = fetch_package(&mut conn, name).await?;
        Ok(finish(conn, package).await)
    }
}

/// Deploy over `conn`, then close it.
///
/// Once the server has answered, the replacement has happened; a failing
/// shutdown afterwards does not turn the deploy into a failure.
pub async fn deploy_on<S>(
    mut conn: Connection<S>,
    name: &str,
    package: &BuildPackage,
) -> ClientResult<PackageReplaceResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let response = deploy_over(&mut conn, name, package).await?;
    Ok(finish(conn, response).await)
}

async fn finish<S, T>(mut conn: Connection<S>, value: T) -> T
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = conn.close().await {
        tracing::debug!("Closing connection to {} failed: {}", conn.peer(), e);
    }
    value
}

/// Send the built binary of `name` over an open connection.
///
/// On success the hook output is logged and, when the package asks for it,
/// the local binary is removed.
pub async fn deploy_over<S>(
    conn: &mut Connection<S>,
    name: &str,
    package: &BuildPackage,
) -> ClientResult<PackageReplaceResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let binary = package.binary_path(name);
    let (contents, digest) = read_and_hash(&binary).await?;
    tracing::debug!("Uploading `{}` ({} bytes, sha256 {})", name, digest.size, digest.hex());

    let request = Request::Replace(PackageReplace::new(name, digest.digest, contents)?);
    conn.send_request(&request).await?;

    let response = match conn.read_response(Operation::Replace).await? {
        Response::Replace(response) => response,
        other => return Err(remote_error(other)),
    };

    tracing::info!("Deployed `{}` to {}", name, conn.peer());
    for (stage, output) in [
        ("before", response.before_stdout.data()),
        ("after", response.after_stdout.data()),
    ] {
        if !output.is_empty() {
            tracing::info!("`{}` {} action output:\n{}", name, stage, output.trim_end());
        }
    }

    if package.clean_after_deploy {
        tokio::fs::remove_file(&binary).await?;
        tracing::debug!("Removed {}", binary.display());
    }

    Ok(response)
}

pub async fn fetch_info<S>(conn: &mut Connection<S>, name: &str) -> ClientResult<PackageInfo>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.send_request(&Request::Info(PackageName::new(name)?)).await?;
    match conn.read_response(Operation::Info).await? {
        Response::Info(info) => Ok(info),
        other => Err(remote_error(other)),
    }
}

/// Download a package and check its contents against the sent digest
pub async fn fetch_package<S>(conn: &mut Connection<S>, name: &str) -> ClientResult<Package>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.send_request(&Request::Get(PackageName::new(name)?)).await?;
    let package = match conn.read_response(Operation::Get).await? {
        Response::Get(package) => package,
        other => return Err(remote_error(other)),
    };

    if digest_bytes(package.payload.data()) != *package.signature.data() {
        return Err(ClientError::SignatureMismatch(name.to_string()));
    }
    Ok(package)
}

fn remote_error(response: Response) -> ClientError {
    match response {
        Response::Error(error) => ClientError::Remote {
            code: error.code,
            message: error.message().to_string(),
        },
        other => ClientError::Connection(ConnectionError::UnexpectedOperation {
            expected: Operation::Error,
            got: other.operation().as_byte(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorResponse;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, ReadBuf};

    /// A stream whose shutdown always fails, like a lost close_notify
    struct BrokenShutdown(DuplexStream);

    impl AsyncRead for BrokenShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "close_notify not sent",
            )))
        }
    }

    fn built_package(dir: &TempDir, name: &str, contents: &[u8]) -> BuildPackage {
        let mut package = BuildPackage::new(format!("./cmd/{}", name));
        package.dest = dir.path().to_path_buf();
        std::fs::write(package.binary_path(name), contents).unwrap();
        package
    }

    /// Reads one request and answers it with `reply`
    async fn answer(mut server: Connection<tokio::io::DuplexStream>, reply: Response) -> PackageReplace {
        assert_eq!(server.read_operation().await.unwrap(), Operation::Replace.as_byte());
        let request: PackageReplace = server.recv().await.unwrap();
        server.send_response(&reply).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_deploy_sends_binary_and_digest() {
        let dir = TempDir::new().unwrap();
        let package = built_package(&dir, "foo", b"foo binary");

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = Connection::new(a, "server");
        let server = tokio::spawn(answer(
            Connection::new(b, "client"),
            Response::Replace(PackageReplaceResponse::default()),
        ));

        let response = deploy_over(&mut client, "foo", &package).await.unwrap();
        assert_eq!(response, PackageReplaceResponse::default());

        let request = server.await.unwrap();
        assert_eq!(request.name.as_str(), "foo");
        assert_eq!(request.package.payload.data(), b"foo binary");
        assert_eq!(*request.package.signature.data(), digest_bytes(b"foo binary"));
        // Cleanup was not requested
        assert!(package.binary_path("foo").exists());
    }

    #[tokio::test]
    async fn test_clean_only_after_success() {
        let dir = TempDir::new().unwrap();
        let mut package = built_package(&dir, "foo", b"foo binary");
        package.clean_after_deploy = true;

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = Connection::new(a, "server");
        let server = tokio::spawn(answer(
            Connection::new(b, "client"),
            Response::Error(ErrorResponse::system("disk full")),
        ));

        let result = deploy_over(&mut client, "foo", &package).await;
        server.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Remote { code: ErrorCode::System, ref message }) if message == "disk full"
        ));
        assert!(package.binary_path("foo").exists());

        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = Connection::new(a, "server");
        let server = tokio::spawn(answer(
            Connection::new(b, "client"),
            Response::Replace(PackageReplaceResponse::default()),
        ));
        deploy_over(&mut client, "foo", &package).await.unwrap();
        server.await.unwrap();
        assert!(!package.binary_path("foo").exists());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = TempDir::new().unwrap();
        let mut package = BuildPackage::new("./cmd/foo");
        package.dest = dir.path().to_path_buf();

        let (a, _b) = tokio::io::duplex(64);
        let mut client = Connection::new(a, "server");
        assert!(matches!(
            deploy_over(&mut client, "foo", &package).await,
            Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_package_checks_signature() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        let server_task = tokio::spawn(async move {
            assert_eq!(server.read_operation().await.unwrap(), Operation::Get.as_byte());
            let name: PackageName = server.recv().await.unwrap();
            assert_eq!(name.as_str(), "foo");
            let forged = Package::new(digest_bytes(b"other"), b"payload".to_vec()).unwrap();
            server.send_response(&Response::Get(forged)).await.unwrap();
        });

        let result = fetch_package(&mut client, "foo").await;
        server_task.await.unwrap();
        assert!(matches!(result, Err(ClientError::SignatureMismatch(name)) if name == "foo"));
    }

    #[tokio::test]
    async fn test_fetch_info_reports_remote_error() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        let server_task = tokio::spawn(async move {
            assert_eq!(server.read_operation().await.unwrap(), Operation::Info.as_byte());
            let name: PackageName = server.recv().await.unwrap();
            let reply = ErrorResponse::not_found(name.as_str()).unwrap();
            server.send_response(&Response::Error(reply)).await.unwrap();
        });

        let result = fetch_info(&mut client, "bar").await;
        server_task.await.unwrap();
        match result {
            Err(ClientError::Remote { code, message }) => {
                assert_eq!(code, ErrorCode::NotFoundPackage);
                assert_eq!(message, "package `bar` invalid");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_close_after_deploy_is_not_a_failure() {
        let dir = TempDir::new().unwrap();
        let mut package = built_package(&dir, "foo", b"foo binary");
        package.clean_after_deploy = true;

        let (a, b) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(answer(
            Connection::new(b, "client"),
            Response::Replace(PackageReplaceResponse::default()),
        ));

        let result = deploy_on(Connection::new(BrokenShutdown(a), "server"), "foo", &package).await;
        server.await.unwrap();
        assert_eq!(result.unwrap(), PackageReplaceResponse::default());
        assert!(!package.binary_path("foo").exists());
    }
}
