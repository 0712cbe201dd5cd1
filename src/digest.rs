//! Chunked SHA-256 over executables
//!
//! Files are read in fixed-size chunks; each chunk feeds the digest and,
//! when requested, an in-memory copy of the contents.

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Read size used while hashing
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Size and digest of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub digest: Vec<u8>,
}

impl FileDigest {
    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Hash a file without keeping its contents
pub async fn hash_file(path: &Path) -> io::Result<FileDigest> {
    stream_file(path, None).await
}

/// Hash a file while collecting its full contents
pub async fn read_and_hash(path: &Path) -> io::Result<(Vec<u8>, FileDigest)> {
    let mut contents = Vec::new();
    let digest = stream_file(path, Some(&mut contents)).await?;
    Ok((contents, digest))
}

/// SHA-256 of an in-memory buffer
pub fn digest_bytes(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

async fn stream_file(path: &Path, mut sink: Option<&mut Vec<u8>>) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    if let Some(sink) = sink.as_deref_mut() {
        let len = file.metadata().await?.len();
        sink.reserve(len as usize);
    }

    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        if let Some(sink) = sink.as_deref_mut() {
            sink.extend_from_slice(&chunk[..n]);
        }
        size += n as u64;
    }

    Ok(FileDigest {
        size,
        digest: hasher.finalize().to_vec(),
    })
}
