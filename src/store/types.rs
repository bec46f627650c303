use std::io;
use std::time::SystemTime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found")]
    NotFound,

    #[error("blob is a directory")]
    IsDirectory,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Metadata about a stored blob.
#[derive(Debug, Clone, Copy)]
pub struct ObjectMeta {
    pub size: u64,
    pub modified: SystemTime,
}
