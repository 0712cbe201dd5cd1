//! Frame codec for length-prefixed fields
//!
//! A frame is a big-endian size field of a fixed width followed by exactly
//! that many payload bytes. Widths are chosen per field (see [`SizeWidth`]),
//! so a digest only spends one byte on its length and cannot announce more
//! than 255 bytes, while the binary payload gets the full 64-bit range.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Initial buffer reservation when reading a frame payload
const READ_RESERVE: usize = 64 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Field too large: {len} bytes (max: {max})")]
    FieldTooLarge { len: usize, max: u64 },

    #[error("Frame overflow: declared {declared} bytes, wrote {written}")]
    FrameOverflow { declared: u64, written: u64 },

    #[error("Frame corrupt: expected {expected} bytes, read {actual}")]
    FrameCorrupt { expected: u64, actual: u64 },

    #[error("Invalid text frame: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Width of a frame's size field
pub trait SizeWidth {
    /// Number of bytes the size field occupies on the wire
    const BYTES: usize;
    /// Largest payload length the size field can express
    const MAX: u64;
}

/// 8-bit size field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct W8;

/// 16-bit size field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct W16;

/// 32-bit size field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct W32;

/// 64-bit size field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct W64;

impl SizeWidth for W8 {
    const BYTES: usize = 1;
    const MAX: u64 = u8::MAX as u64;
}

impl SizeWidth for W16 {
    const BYTES: usize = 2;
    const MAX: u64 = u16::MAX as u64;
}

impl SizeWidth for W32 {
    const BYTES: usize = 4;
    const MAX: u64 = u32::MAX as u64;
}

impl SizeWidth for W64 {
    const BYTES: usize = 8;
    const MAX: u64 = u64::MAX;
}

/// Payload carried by a frame: raw bytes or UTF-8 text
pub trait Payload: Sized {
    fn as_bytes(&self) -> &[u8];
    fn from_bytes(bytes: Vec<u8>) -> CodecResult<Self>;
}

impl Payload for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }

    fn from_bytes(bytes: Vec<u8>) -> CodecResult<Self> {
        Ok(bytes)
    }
}

impl Payload for String {
    fn as_bytes(&self) -> &[u8] {
        str::as_bytes(self)
    }

    fn from_bytes(bytes: Vec<u8>) -> CodecResult<Self> {
        Ok(String::from_utf8(bytes)?)
    }
}

/// A length-prefixed field.
///
/// The size is always derived from the payload, so a constructed value can
/// never disagree with its own length prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Data<W, T> {
    data: T,
    _width: PhantomData<W>,
}

impl<W: SizeWidth, T: Payload> Data<W, T> {
    /// Wrap a payload, rejecting it if the size field cannot express its length
    pub fn new(data: T) -> CodecResult<Self> {
        let len = data.as_bytes().len();
        if len as u64 > W::MAX {
            return Err(CodecError::FieldTooLarge { len, max: W::MAX });
        }
        Ok(Self {
            data,
            _width: PhantomData,
        })
    }

    /// Value of the size field
    pub fn size(&self) -> u64 {
        self.data.as_bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_inner(self) -> T {
        self.data
    }

    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        W::BYTES + self.data.as_bytes().len()
    }

    /// Append the size field and payload to a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        let size = self.size().to_be_bytes();
        buf.reserve(self.encoded_len());
        buf.put_slice(&size[size.len() - W::BYTES..]);
        buf.put_slice(self.data.as_bytes());
    }

    /// Write the frame straight to a stream
    pub async fn write_to<S>(&self, stream: &mut S) -> CodecResult<()>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        let size = self.size().to_be_bytes();
        write_fully(stream, &size[size.len() - W::BYTES..]).await?;
        write_fully(stream, self.data.as_bytes()).await
    }

    /// Read a frame, failing with [`CodecError::FrameCorrupt`] on a short read
    pub async fn read_from<S>(stream: &mut S) -> CodecResult<Self>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let mut raw = [0u8; 8];
        read_full(stream, &mut raw[8 - W::BYTES..]).await?;
        let size = u64::from_be_bytes(raw);

        // Grow with the bytes that actually arrive instead of trusting the prefix up front
        let mut data = Vec::with_capacity(size.min(READ_RESERVE as u64) as usize);
        let read = (&mut *stream).take(size).read_to_end(&mut data).await?;
        if read as u64 != size {
            return Err(CodecError::FrameCorrupt {
                expected: size,
                actual: read as u64,
            });
        }

        Ok(Self {
            data: T::from_bytes(data)?,
            _width: PhantomData,
        })
    }
}

impl<W: SizeWidth, T: Payload + Default> Data<W, T> {
    /// A zero-length frame
    pub fn empty() -> Self {
        Self {
            data: T::default(),
            _width: PhantomData,
        }
    }
}

impl<W: SizeWidth, T: Payload + Default> Default for Data<W, T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<W: SizeWidth, T: Payload> fmt::Debug for Data<W, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("width", &(W::BYTES * 8))
            .field("size", &self.size())
            .finish()
    }
}

/// Fixed-width big-endian scalars
pub trait Scalar: Sized + Copy {
    const SIZE: usize;

    fn put(self, buf: &mut BytesMut);

    /// Decode from exactly `SIZE` big-endian bytes
    fn from_be_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put(self, buf: &mut BytesMut) {
                    buf.put_slice(&self.to_be_bytes());
                }

                fn from_be_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Scalar for bool {
    const SIZE: usize = 1;

    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(self as u8);
    }

    fn from_be_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Append a scalar to a buffer
pub fn put_scalar<T: Scalar>(buf: &mut BytesMut, value: T) {
    value.put(buf);
}

/// Read a scalar from a stream
pub async fn read_scalar<T, S>(stream: &mut S) -> CodecResult<T>
where
    T: Scalar,
    S: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; 8];
    read_full(stream, &mut raw[..T::SIZE]).await?;
    Ok(T::from_be_slice(&raw[..T::SIZE]))
}

/// Fill `buf` completely, reporting how far a short read got
pub async fn read_full<S>(stream: &mut S, buf: &mut [u8]) -> CodecResult<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(CodecError::FrameCorrupt {
                expected: buf.len() as u64,
                actual: filled as u64,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Write all of `buf`, failing with [`CodecError::FrameOverflow`] if the
/// stream stops accepting bytes early
pub async fn write_fully<S>(stream: &mut S, buf: &[u8]) -> CodecResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        let n = stream.write(&buf[written..]).await?;
        if n == 0 {
            return Err(CodecError::FrameOverflow {
                declared: buf.len() as u64,
                written: written as u64,
            });
        }
        written += n;
    }
    Ok(())
}
