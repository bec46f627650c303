//! fsserve - content-addressed static file publishing and serving.
//!
//! Files are staged into an immutable blob store named by their BLAKE2b-512
//! digest, and a small SQLite database maps logical request paths to blobs
//! plus pre-compressed alternates. The HTTP layer resolves request paths
//! through that database, negotiates a content encoding, and streams the
//! selected blob with hash-derived validators.

pub mod config;
pub mod db;
pub mod hash;
pub mod id;
pub mod mime;
pub mod serve;
pub mod store;
pub mod tree;

use std::fmt;
use std::str::FromStr;

pub use db::{ContentRecord, EncodedContent, TreeDb};
pub use serve::{Route, Server};
pub use store::{BlobStore, FsStore};
pub use tree::{SyncConfig, Tree};

/// Length of an unpadded base64url encoding of a 64-byte digest.
pub const HASH_STR_LEN: usize = 86;

/// Newtype for BLAKE2b-512 digests in unpadded base64url form.
///
/// The string doubles as the blob filename and as the value stored in the
/// tree database, so it is validated on construction: exactly 86 characters,
/// all from the base64url alphabet.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid content hash {0:?}")]
pub struct InvalidHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_digest_string(s: String) -> Self {
        debug_assert_eq!(s.len(), HASH_STR_LEN);
        Self(s)
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_STR_LEN
            || !s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lexically clean a slash-separated logical path.
///
/// Collapses duplicate slashes and `.` segments, resolves `..` against
/// earlier segments, and strips any leading slash. `..` segments that would
/// escape the root are dropped. An empty result is returned as `""`.
pub fn clean_path(p: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}
