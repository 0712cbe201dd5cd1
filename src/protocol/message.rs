//! Protocol message definitions
//!
//! Each body type knows how to encode and decode itself without the leading
//! operation byte. [`Request`] and [`Response`] pair a body with its
//! operation code and are what actually goes over the wire.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use super::codec::{
    put_scalar, read_scalar, write_fully, CodecResult, Data, W16, W32, W64, W8,
};

/// Package name field
pub type NameField = Data<W16, String>;
/// SHA-256 digest field
pub type SignatureField = Data<W8, Vec<u8>>;
/// Executable contents field
pub type PayloadField = Data<W64, Vec<u8>>;
/// Captured hook output field
pub type OutputField = Data<W32, String>;
/// Error message field
pub type MessageField = Data<W16, String>;

/// Operation code, the first byte of every exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Error = 0,
    Info = 1,
    Get = 2,
    Replace = 3,
}

impl Operation {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Operation::Error),
            1 => Some(Operation::Info),
            2 => Some(Operation::Get),
            3 => Some(Operation::Replace),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Error => "OperationError",
            Operation::Info => "PackageInfo",
            Operation::Get => "Package",
            Operation::Replace => "PackageReplace",
        };
        f.write_str(name)
    }
}

/// Error codes carried by [`ErrorResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFoundPackage,
    System,
    /// A code this build does not know about
    Unknown(u8),
}

impl ErrorCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => ErrorCode::NotFoundPackage,
            2 => ErrorCode::System,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ErrorCode::NotFoundPackage => 1,
            ErrorCode::System => 2,
            ErrorCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte())
    }
}

/// A message body
#[async_trait]
pub trait Packet: Sized + Send + Sync {
    /// Append the body (no operation byte) to a buffer
    fn encode(&self, buf: &mut BytesMut);

    /// Read the body; the operation byte has already been consumed
    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send;

    /// Write the body (no operation byte) to a stream
    async fn write<S>(&self, stream: &mut S) -> CodecResult<()>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        write_fully(stream, &buf).await
    }
}

/// Error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: MessageField,
}

impl ErrorResponse {
    /// Build an error reply, failing if the message does not fit its 16-bit frame
    pub fn new(code: ErrorCode, message: impl Into<String>) -> CodecResult<Self> {
        Ok(Self {
            code,
            message: Data::new(message.into())?,
        })
    }

    /// Reply for a name missing from the registry
    pub fn not_found(name: &str) -> CodecResult<Self> {
        Self::new(
            ErrorCode::NotFoundPackage,
            format!("package `{}` invalid", name),
        )
    }

    /// System error reply; messages beyond the frame limit are cut at a char boundary
    pub fn system(message: &str) -> Self {
        let mut end = message.len().min(u16::MAX as usize);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            code: ErrorCode::System,
            message: Data::new(message[..end].to_string()).unwrap_or_default(),
        }
    }

    pub fn message(&self) -> &str {
        self.message.data()
    }
}

#[async_trait]
impl Packet for ErrorResponse {
    fn encode(&self, buf: &mut BytesMut) {
        put_scalar(buf, self.code.as_byte());
        self.message.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        let code = ErrorCode::from_byte(read_scalar::<u8, _>(stream).await?);
        let message = Data::read_from(stream).await?;
        Ok(Self { code, message })
    }
}

/// Request body naming a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageName {
    pub name: NameField,
}

impl PackageName {
    pub fn new(name: impl Into<String>) -> CodecResult<Self> {
        Ok(Self {
            name: Data::new(name.into())?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.name.data()
    }
}

#[async_trait]
impl Packet for PackageName {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        Ok(Self {
            name: Data::read_from(stream).await?,
        })
    }
}

/// Size and digest of a remote executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub binary_size: u64,
    pub signature: SignatureField,
}

impl PackageInfo {
    pub fn new(binary_size: u64, signature: Vec<u8>) -> CodecResult<Self> {
        Ok(Self {
            binary_size,
            signature: Data::new(signature)?,
        })
    }
}

#[async_trait]
impl Packet for PackageInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.binary_size);
        self.signature.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        let binary_size = read_scalar::<u64, _>(stream).await?;
        let signature = Data::read_from(stream).await?;
        Ok(Self {
            binary_size,
            signature,
        })
    }
}

/// Executable contents with their digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub signature: SignatureField,
    pub payload: PayloadField,
}

impl Package {
    pub fn new(signature: Vec<u8>, payload: Vec<u8>) -> CodecResult<Self> {
        Ok(Self {
            signature: Data::new(signature)?,
            payload: Data::new(payload)?,
        })
    }
}

#[async_trait]
impl Packet for Package {
    fn encode(&self, buf: &mut BytesMut) {
        self.signature.encode(buf);
        self.payload.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        let signature = Data::read_from(stream).await?;
        let payload = Data::read_from(stream).await?;
        Ok(Self { signature, payload })
    }
}

/// Upload request: a [`PackageName`] followed by a [`Package`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReplace {
    pub name: PackageName,
    pub package: Package,
}

impl PackageReplace {
    pub fn new(name: impl Into<String>, signature: Vec<u8>, payload: Vec<u8>) -> CodecResult<Self> {
        Ok(Self {
            name: PackageName::new(name)?,
            package: Package::new(signature, payload)?,
        })
    }
}

#[async_trait]
impl Packet for PackageReplace {
    fn encode(&self, buf: &mut BytesMut) {
        self.name.encode(buf);
        self.package.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        let name = PackageName::read(stream).await?;
        let package = Package::read(stream).await?;
        Ok(Self { name, package })
    }
}

/// Output captured from the before/after hooks of a replace
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageReplaceResponse {
    pub before_stdout: OutputField,
    pub after_stdout: OutputField,
}

impl PackageReplaceResponse {
    pub fn new(before: String, after: String) -> CodecResult<Self> {
        Ok(Self {
            before_stdout: Data::new(before)?,
            after_stdout: Data::new(after)?,
        })
    }
}

#[async_trait]
impl Packet for PackageReplaceResponse {
    fn encode(&self, buf: &mut BytesMut) {
        self.before_stdout.encode(buf);
        self.after_stdout.encode(buf);
    }

    async fn read<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        let before_stdout = Data::read_from(stream).await?;
        let after_stdout = Data::read_from(stream).await?;
        Ok(Self {
            before_stdout,
            after_stdout,
        })
    }
}

/// A request as sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Info(PackageName),
    Get(PackageName),
    Replace(PackageReplace),
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Info(_) => Operation::Info,
            Request::Get(_) => Operation::Get,
            Request::Replace(_) => Operation::Replace,
        }
    }

    /// Operation byte followed by the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.operation().as_byte());
        match self {
            Request::Info(body) | Request::Get(body) => body.encode(buf),
            Request::Replace(body) => body.encode(buf),
        }
    }
}

/// A reply as sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ErrorResponse),
    Info(PackageInfo),
    Get(Package),
    Replace(PackageReplaceResponse),
}

impl Response {
    pub fn operation(&self) -> Operation {
        match self {
            Response::Error(_) => Operation::Error,
            Response::Info(_) => Operation::Info,
            Response::Get(_) => Operation::Get,
            Response::Replace(_) => Operation::Replace,
        }
    }

    /// Operation byte followed by the body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.operation().as_byte());
        match self {
            Response::Error(body) => body.encode(buf),
            Response::Info(body) => body.encode(buf),
            Response::Get(body) => body.encode(buf),
            Response::Replace(body) => body.encode(buf),
        }
    }

    /// Read the body for an operation byte the caller has already consumed
    pub async fn read_body<S>(operation: Operation, stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + Send,
    {
        Ok(match operation {
            Operation::Error => Response::Error(ErrorResponse::read(stream).await?),
            Operation::Info => Response::Info(PackageInfo::read(stream).await?),
            Operation::Get => Response::Get(Package::read(stream).await?),
            Operation::Replace => Response::Replace(PackageReplaceResponse::read(stream).await?),
        })
    }
}
