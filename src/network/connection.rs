//! Connection handling for deploy exchanges
//!
//! A connection carries exactly one exchange: one request, one response.
//! The wrapper is generic over the stream so the same code runs over TLS,
//! plain TCP or an in-memory duplex in tests.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    read_scalar, write_fully, CodecError, Operation, Packet, Request, Response,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Unexpected operation: expected {expected}, got {got}")]
    UnexpectedOperation { expected: Operation, got: u8 },
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One end of a single request/response exchange
pub struct Connection<S> {
    stream: S,
    peer: String,
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            stats: ConnectionStats::default(),
        }
    }

    /// Remote peer, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Read the operation byte that opens every message
    pub async fn read_operation(&mut self) -> ConnectionResult<u8> {
        match read_scalar::<u8, _>(&mut self.stream).await {
            Ok(op) => {
                self.stats.bytes_received += 1;
                Ok(op)
            }
            Err(CodecError::FrameCorrupt { actual: 0, .. }) => Err(ConnectionError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a message body; the operation byte must already be consumed
    pub async fn recv<P: Packet>(&mut self) -> ConnectionResult<P> {
        Ok(P::read(&mut self.stream).await?)
    }

    pub async fn send_request(&mut self, request: &Request) -> ConnectionResult<()> {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        self.send_bytes(&buf).await
    }

    pub async fn send_response(&mut self, response: &Response) -> ConnectionResult<()> {
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        self.send_bytes(&buf).await
    }

    /// Read a full response, accepting either the expected operation or an error
    pub async fn read_response(&mut self, expected: Operation) -> ConnectionResult<Response> {
        let raw = self.read_operation().await?;
        let operation = match Operation::from_byte(raw) {
            Some(op) if op == expected || op == Operation::Error => op,
            _ => return Err(ConnectionError::UnexpectedOperation { expected, got: raw }),
        };
        Ok(Response::read_body(operation, &mut self.stream).await?)
    }

    /// Flush and shut down the write side
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        tracing::trace!(
            "Closed connection to {} ({} bytes sent, {} received)",
            self.peer,
            self.stats.bytes_sent,
            self.stats.bytes_received
        );
        Ok(())
    }

    async fn send_bytes(&mut self, buf: &[u8]) -> ConnectionResult<()> {
        write_fully(&mut self.stream, buf).await?;
        self.stream.flush().await?;
        self.stats.bytes_sent += buf.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorResponse, PackageInfo, PackageName};

    #[tokio::test]
    async fn test_request_reaches_peer() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        client
            .send_request(&Request::Info(PackageName::new("foo").unwrap()))
            .await
            .unwrap();

        assert_eq!(server.read_operation().await.unwrap(), Operation::Info.as_byte());
        let name: PackageName = server.recv().await.unwrap();
        assert_eq!(name.as_str(), "foo");
        assert_eq!(client.stats().bytes_sent, 6);
    }

    #[tokio::test]
    async fn test_read_response_accepts_error() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        let reply = Response::Error(ErrorResponse::not_found("foo").unwrap());
        server.send_response(&reply).await.unwrap();

        let response = client.read_response(Operation::Replace).await.unwrap();
        assert_eq!(response, reply);
    }

    #[tokio::test]
    async fn test_read_response_rejects_other_operation() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Connection::new(a, "server");
        let mut server = Connection::new(b, "client");

        let reply = Response::Info(PackageInfo::new(1, vec![0; 32]).unwrap());
        server.send_response(&reply).await.unwrap();

        let result = client.read_response(Operation::Replace).await;
        assert!(matches!(
            result,
            Err(ConnectionError::UnexpectedOperation { expected: Operation::Replace, got: 1 })
        ));
    }

    #[tokio::test]
    async fn test_closed_before_operation() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut server = Connection::new(b, "client");
        assert!(matches!(server.read_operation().await, Err(ConnectionError::Closed)));
    }
}
