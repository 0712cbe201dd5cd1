//! Request dispatch for the deploy server
//!
//! Every connection carries one exchange: the operation byte selects a
//! handler, the handler reads its request body and writes exactly one
//! response. Handler failures are turned into a System error reply on the
//! same stream.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::connection::{Connection, ConnectionError};
use super::hook::{run_action, HookContext, HookError};
use super::registry::{PackageLease, RegistryHandle};
use crate::config::ServerPackage;
use crate::digest::{hash_file, read_and_hash};
use crate::protocol::{
    CodecError, ErrorResponse, Operation, Package, PackageInfo, PackageName, PackageReplace,
    PackageReplaceResponse, Response,
};

/// Handler errors
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Hook(#[from] HookError),

    #[error("data corrupt: expected {expected} bytes, wrote {written}")]
    DataCorrupt { expected: u64, written: u64 },

    #[error("unsupported operation `{0}`")]
    UnsupportedOperation(u8),
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Routes one exchange to its handler
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
}

impl Dispatcher {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Read the operation byte and handle the exchange
    pub async fn serve<S>(&self, conn: &mut Connection<S>) -> HandlerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let raw_op = conn.read_operation().await?;
        self.dispatch(raw_op, conn).await
    }

    /// Handle the exchange for an operation byte already read from `conn`.
    ///
    /// Only a failure to deliver the error reply itself is returned.
    pub async fn dispatch<S>(&self, raw_op: u8, conn: &mut Connection<S>) -> HandlerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let operation = Operation::from_byte(raw_op);
        let result = match operation {
            Some(Operation::Info) => self.handle_info(conn).await,
            Some(Operation::Get) => self.handle_get(conn).await,
            Some(Operation::Replace) => self.handle_replace(conn).await,
            Some(Operation::Error) | None => Err(HandlerError::UnsupportedOperation(raw_op)),
        };

        if let Err(e) = result {
            let label = operation.map_or_else(|| "Unknown".to_string(), |op| op.to_string());
            tracing::error!("Handle `{}` from {} failed: {}", label, conn.peer(), e);

            let reply = Response::Error(ErrorResponse::system(&e.to_string()));
            conn.send_response(&reply).await?;
        }

        Ok(())
    }

    async fn handle_info<S>(&self, conn: &mut Connection<S>) -> HandlerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: PackageName = conn.recv().await?;
        let Some(lease) = self.checkout(conn, request.as_str()).await? else {
            return Ok(());
        };

        let digest = hash_file(&lease.package.executable).await?;
        let info = PackageInfo::new(digest.size, digest.digest)?;
        drop(lease);

        conn.send_response(&Response::Info(info)).await?;
        Ok(())
    }

    async fn handle_get<S>(&self, conn: &mut Connection<S>) -> HandlerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: PackageName = conn.recv().await?;
        let Some(lease) = self.checkout(conn, request.as_str()).await? else {
            return Ok(());
        };

        let (contents, digest) = read_and_hash(&lease.package.executable).await?;
        let package = Package::new(digest.digest, contents)?;
        drop(lease);

        conn.send_response(&Response::Get(package)).await?;
        Ok(())
    }

    async fn handle_replace<S>(&self, conn: &mut Connection<S>) -> HandlerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: PackageReplace = conn.recv().await?;
        let Some(lease) = self.checkout(conn, request.name.as_str()).await? else {
            return Ok(());
        };

        let ctx = HookContext {
            name: &lease.name,
            signature: request.package.signature.data(),
            executable: &lease.package.executable,
            env: &lease.package.env,
        };

        let before = run_action(lease.package.before_action.as_deref(), ctx).await?;
        write_executable(&lease.package, request.package.payload.data()).await?;
        let after = run_action(lease.package.after_action.as_deref(), ctx).await?;

        tracing::info!(
            "Replaced `{}` ({} bytes) for {}",
            lease.name,
            request.package.payload.size(),
            conn.peer()
        );
        drop(lease);

        let response = PackageReplaceResponse::new(before, after)?;
        conn.send_response(&Response::Replace(response)).await?;
        Ok(())
    }

    /// Lock the named package, or answer NotFoundPackage when it is not configured
    async fn checkout<S>(
        &self,
        conn: &mut Connection<S>,
        name: &str,
    ) -> HandlerResult<Option<PackageLease>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Some(lease) = self.registry.checkout(name).await {
            return Ok(Some(lease));
        }

        tracing::warn!("{} requested unknown package `{}`", conn.peer(), name);
        let reply = Response::Error(ErrorResponse::not_found(name)?);
        conn.send_response(&reply).await?;
        Ok(None)
    }
}

/// Truncate and rewrite the package's executable
async fn write_executable(package: &ServerPackage, payload: &[u8]) -> HandlerResult<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(package.file_mode());

    let mut file = options.open(&package.executable).await?;
    write_counted(&mut file, payload).await?;
    file.flush().await?;
    Ok(())
}

/// Write `data`, failing with DataCorrupt if the writer stops short
async fn write_counted<W>(writer: &mut W, data: &[u8]) -> HandlerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        let n = writer.write(&data[written..]).await?;
        if n == 0 {
            break;
        }
        written += n;
    }

    if written != data.len() {
        return Err(HandlerError::DataCorrupt {
            expected: data.len() as u64,
            written: written as u64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use crate::network::registry::PackageRegistry;
    use crate::protocol::{ErrorCode, Request};
    use std::collections::BTreeMap;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    fn dispatcher(packages: &[(&str, ServerPackage)]) -> Dispatcher {
        let packages: BTreeMap<_, _> = packages
            .iter()
            .map(|(name, package)| (name.to_string(), package.clone()))
            .collect();
        Dispatcher::new(RegistryHandle::new(PackageRegistry::new(packages)))
    }

    async fn exchange(dispatcher: &Dispatcher, request: Request) -> Response {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut client: Connection<DuplexStream> = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        let expected = request.operation();
        client.send_request(&request).await.unwrap();
        dispatcher.serve(&mut server).await.unwrap();
        client.read_response(expected).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_package_for_every_operation() {
        let dispatcher = dispatcher(&[]);

        let requests = vec![
            Request::Info(PackageName::new("bar").unwrap()),
            Request::Get(PackageName::new("bar").unwrap()),
            Request::Replace(PackageReplace::new("bar", vec![0; 32], b"bin".to_vec()).unwrap()),
        ];

        for request in requests {
            match exchange(&dispatcher, request).await {
                Response::Error(error) => {
                    assert_eq!(error.code, ErrorCode::NotFoundPackage);
                    assert_eq!(error.message(), "package `bar` invalid");
                }
                other => panic!("expected error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_info_and_get() {
        let dir = TempDir::new().unwrap();
        let executable = dir.path().join("foo");
        std::fs::write(&executable, b"#!/bin/true\n").unwrap();
        let dispatcher = dispatcher(&[("foo", ServerPackage::new(&executable))]);

        let info = exchange(&dispatcher, Request::Info(PackageName::new("foo").unwrap())).await;
        let expected = digest_bytes(b"#!/bin/true\n");
        assert_eq!(info, Response::Info(PackageInfo::new(12, expected.clone()).unwrap()));

        let get = exchange(&dispatcher, Request::Get(PackageName::new("foo").unwrap())).await;
        assert_eq!(
            get,
            Response::Get(Package::new(expected, b"#!/bin/true\n".to_vec()).unwrap())
        );
    }

    #[tokio::test]
    async fn test_replace_without_actions() {
        let dir = TempDir::new().unwrap();
        let executable = dir.path().join("foo");
        std::fs::write(&executable, b"old contents that are longer").unwrap();
        let dispatcher = dispatcher(&[("foo", ServerPackage::new(&executable))]);

        let payload = b"new".to_vec();
        let request = PackageReplace::new("foo", digest_bytes(&payload), payload.clone()).unwrap();
        let response = exchange(&dispatcher, Request::Replace(request)).await;

        assert_eq!(response, Response::Replace(PackageReplaceResponse::default()));
        assert_eq!(std::fs::read(&executable).unwrap(), payload);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replace_creates_with_mode_and_runs_actions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let executable = dir.path().join("foo");
        let mut package = ServerPackage::new(&executable);
        package.perm = 0o700;
        package.before_action = Some("echo stop $PACKAGE_NAME".to_string());
        package.after_action = Some("echo start $PACKAGE_HASH".to_string());
        let dispatcher = dispatcher(&[("foo", package)]);

        let request = PackageReplace::new("foo", vec![0xab], b"bin".to_vec()).unwrap();
        let response = exchange(&dispatcher, Request::Replace(request)).await;

        assert_eq!(
            response,
            Response::Replace(
                PackageReplaceResponse::new("stop foo\n".to_string(), "start ab\n".to_string())
                    .unwrap()
            )
        );
        let mode = std::fs::metadata(&executable).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_before_action_leaves_executable() {
        let dir = TempDir::new().unwrap();
        let executable = dir.path().join("foo");
        std::fs::write(&executable, b"old").unwrap();
        let mut package = ServerPackage::new(&executable);
        package.before_action = Some("echo busy; exit 1".to_string());
        let dispatcher = dispatcher(&[("foo", package)]);

        let request = PackageReplace::new("foo", vec![1], b"new".to_vec()).unwrap();
        match exchange(&dispatcher, Request::Replace(request)).await {
            Response::Error(error) => {
                assert_eq!(error.code, ErrorCode::System);
                assert!(error.message().contains("busy"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(std::fs::read(&executable).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let dispatcher = dispatcher(&[]);

        for raw_op in [0u8, 9] {
            let (a, b) = tokio::io::duplex(1024);
            let mut client = Connection::new(a, "server");
            let mut server = Connection::new(b, "client");

            dispatcher.dispatch(raw_op, &mut server).await.unwrap();
            match client.read_response(Operation::Info).await.unwrap() {
                Response::Error(error) => {
                    assert_eq!(error.code, ErrorCode::System);
                    assert_eq!(error.message(), format!("unsupported operation `{}`", raw_op));
                }
                other => panic!("expected error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_request_gets_system_error() {
        let dispatcher = dispatcher(&[]);
        let (mut a, b) = tokio::io::duplex(1024);
        let mut server = Connection::new(b, "client");

        // Name frame declares 10 bytes but only 3 follow
        let mut buf = bytes::BytesMut::new();
        Request::Info(PackageName::new("foo").unwrap()).encode(&mut buf);
        buf[2] = 10;
        a.write_all(&buf).await.unwrap();
        a.shutdown().await.unwrap();

        dispatcher.serve(&mut server).await.unwrap();
        let mut client = Connection::new(a, "server");
        match client.read_response(Operation::Info).await.unwrap() {
            Response::Error(error) => assert_eq!(error.code, ErrorCode::System),
            other => panic!("expected error, got {:?}", other),
        }
    }

    /// Accepts `limit` bytes, then reports a zero-length write
    struct CappedWriter {
        limit: usize,
        written: Vec<u8>,
    }

    impl AsyncWrite for CappedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let room = self.limit - self.written.len();
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_short_write_is_data_corrupt() {
        let mut writer = CappedWriter {
            limit: 4,
            written: Vec::new(),
        };
        let result = write_counted(&mut writer, b"executable").await;
        assert!(matches!(
            result,
            Err(HandlerError::DataCorrupt { expected: 10, written: 4 })
        ));

        let mut writer = CappedWriter {
            limit: 64,
            written: Vec::new(),
        };
        write_counted(&mut writer, b"executable").await.unwrap();
        assert_eq!(writer.written, b"executable");
    }
}
