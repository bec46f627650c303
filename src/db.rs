//! Tree database: the mapping from logical paths to content records, plus
//! the garbage-collection candidate queue.
//!
//! The trait is the substitution seam for non-SQL backends; the shipped
//! implementation is SQLite.

use thiserror::Error;

pub mod sqlite;

pub use sqlite::{DbMode, SqliteTreeDb};

use crate::ContentHash;

/// One pre-encoded alternate of a record's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedContent {
    /// Lowercase HTTP content-coding token, e.g. `gzip`.
    pub code: String,
    pub hash: ContentHash,
}

/// What a logical path serves: a primary blob, its content type, and an
/// ordered list of alternate encodings (order encodes publisher preference).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub hash: ContentHash,
    pub content_type: String,
    pub encodings: Vec<EncodedContent>,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("record not found")]
    NotFound,

    #[error("unique constraint violated")]
    UniqueConflict,

    #[error("database connection failed: {0}")]
    Connection(rusqlite::Error),

    #[error("malformed stored checksum {0:?}")]
    MalformedChecksum(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
}

pub trait TreeDb: Send + Sync + 'static {
    /// Idempotent schema creation.
    fn setup(&self) -> Result<(), DbError>;

    fn exists(&self, name: &str) -> Result<bool, DbError>;

    /// True iff any record, primary or encoded, references the hash.
    fn content_exists(&self, hash: &ContentHash) -> Result<bool, DbError>;

    fn get(&self, name: &str) -> Result<ContentRecord, DbError>;

    /// Page of record names ordered by name, starting after the cursor.
    fn list(&self, limit: usize, after: Option<&str>) -> Result<Vec<String>, DbError>;

    /// Insert a fresh record. The name must not exist yet.
    fn insert(&self, name: &str, record: &ContentRecord) -> Result<(), DbError>;

    /// Replace an existing record. Every hash the old record referenced is
    /// enqueued as a GC candidate in the same transaction, and the encoding
    /// set is rewritten with dense order values.
    fn update(&self, name: &str, record: &ContentRecord) -> Result<(), DbError>;

    /// Delete a record, enqueueing its hashes as GC candidates.
    fn delete(&self, name: &str) -> Result<(), DbError>;

    /// Snapshot of the GC candidate queue.
    fn gc_candidates(&self) -> Result<Vec<ContentHash>, DbError>;

    /// Drop one candidate from the queue.
    fn gc_dequeue(&self, hash: &ContentHash) -> Result<(), DbError>;
}
