//! Storage abstraction over the blob store.
//!
//! A blob store is a flat namespace from content hashes to immutable byte
//! blobs. The trait exists so tests can substitute in-memory doubles and so
//! a non-filesystem backend can slot in behind the publisher and the
//! serving path.

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

mod fs;
mod mem;
mod types;

pub use fs::FsStore;
pub use mem::MemStore;
pub use types::{ObjectMeta, StoreError};

use crate::ContentHash;

/// Readable, seekable blob handle.
pub trait BlobRead: AsyncRead + AsyncSeek + Send + Unpin + std::fmt::Debug {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin + std::fmt::Debug> BlobRead for T {}

/// A boxed blob handle for streaming reads with range support.
pub type BlobReader = Box<dyn BlobRead>;

/// A boxed async reader for streaming writes.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Open a blob for reading, returning the handle together with the
    /// metadata of the opened file so validators cannot diverge from the
    /// bytes actually served.
    async fn open(&self, hash: &ContentHash) -> Result<(BlobReader, ObjectMeta), StoreError>;

    /// Get blob metadata without opening it.
    async fn stat(&self, hash: &ContentHash) -> Result<ObjectMeta, StoreError>;

    /// Store blob data under its hash.
    ///
    /// Partially written blobs must never be observable under the final
    /// name. MUST verify that the data hashes to `hash` and return
    /// `HashMismatch` if not.
    async fn write_new(&self, hash: &ContentHash, data: ByteReader) -> Result<(), StoreError>;

    /// Update a blob's modification time.
    async fn set_mtime(&self, hash: &ContentHash, mtime: SystemTime) -> Result<(), StoreError>;

    /// Remove a blob. Idempotent: removing an absent blob succeeds.
    async fn remove(&self, hash: &ContentHash) -> Result<(), StoreError>;

    /// Enumerate stored blobs. Entries whose names are not valid content
    /// hashes are ignored.
    async fn list(&self) -> Result<Vec<ContentHash>, StoreError>;
}
