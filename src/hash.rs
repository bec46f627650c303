//! Streaming BLAKE2b-512 hashing.
//!
//! The digest scheme (BLAKE2b-512, unpadded base64url, 86-character names)
//! is part of the on-disk interface and is deliberately not configurable.

use std::io;
use std::path::Path;

use base64::prelude::*;
use blake2::{Blake2b512, Digest};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ContentHash;

const READ_BUF_SIZE: usize = 128 * 1024;

/// Incremental hasher for callers that interleave hashing with other work,
/// such as hash-while-writing in the blob store.
pub struct Hasher(Blake2b512);

impl Hasher {
    pub fn new() -> Self {
        Self(Blake2b512::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> ContentHash {
        encode_digest(self.0)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything remaining in the reader.
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ContentHash> {
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Hash a file's contents.
pub async fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let mut file = File::open(path).await?;
    hash_reader(&mut file).await
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = Blake2b512::new();
    hasher.update(data);
    encode_digest(hasher)
}

fn encode_digest(hasher: Blake2b512) -> ContentHash {
    let digest = hasher.finalize();
    ContentHash::from_digest_string(BASE64_URL_SAFE_NO_PAD.encode(digest))
}
