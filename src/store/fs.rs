use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::hash::Hasher;
use crate::ContentHash;

use super::{BlobReader, BlobStore, ByteReader, ObjectMeta, StoreError};

const BLOB_MODE: u32 = 0o644;
const COPY_BUF_SIZE: usize = 128 * 1024;

/// Blob store over a flat filesystem directory, one file per hash.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the blob directory if it does not exist yet.
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.as_str())
    }
}

fn map_open_err(e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::Io(e)
    }
}

fn meta_from(metadata: &std::fs::Metadata) -> Result<ObjectMeta, StoreError> {
    if metadata.is_dir() {
        return Err(StoreError::IsDirectory);
    }
    Ok(ObjectMeta {
        size: metadata.len(),
        modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    })
}

#[async_trait]
impl BlobStore for FsStore {
    async fn open(&self, hash: &ContentHash) -> Result<(BlobReader, ObjectMeta), StoreError> {
        let file = File::open(self.blob_path(hash)).await.map_err(map_open_err)?;
        // fstat the open handle: the metadata describes the bytes this very
        // handle will serve even if the blob is replaced concurrently.
        let metadata = file.metadata().await?;
        let meta = meta_from(&metadata)?;
        Ok((Box::new(file), meta))
    }

    async fn stat(&self, hash: &ContentHash) -> Result<ObjectMeta, StoreError> {
        let metadata = fs::metadata(self.blob_path(hash))
            .await
            .map_err(map_open_err)?;
        meta_from(&metadata)
    }

    async fn write_new(&self, hash: &ContentHash, mut data: ByteReader) -> Result<(), StoreError> {
        let path = self.blob_path(hash);
        fs::create_dir_all(&self.root).await?;

        let temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let temp_path = temp.path().to_path_buf();

        // Write to the tempfile while hashing, then verify before the
        // rename makes the blob visible under its final name.
        let mut file = File::create(&temp_path).await?;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = hasher.finish();
        if &actual != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            });
        }

        fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(BLOB_MODE)).await?;
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    async fn set_mtime(&self, hash: &ContentHash, mtime: SystemTime) -> Result<(), StoreError> {
        let file = std::fs::File::options()
            .write(true)
            .open(self.blob_path(hash))
            .map_err(map_open_err)?;
        file.set_modified(mtime)?;
        Ok(())
    }

    async fn remove(&self, hash: &ContentHash) -> Result<(), StoreError> {
        match fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<ContentHash>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut hashes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && let Ok(hash) = name.parse::<ContentHash>()
            {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }
}

impl FsStore {
    /// Directory the blobs live in.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        (dir, store)
    }

    async fn put(store: &FsStore, data: &[u8]) -> ContentHash {
        let hash = hash_bytes(data);
        store
            .write_new(&hash, Box::new(std::io::Cursor::new(data.to_vec())))
            .await
            .unwrap();
        hash
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let (_dir, store) = store();
        let hash = put(&store, b"blob bytes").await;

        let (mut reader, meta) = store.open(&hash).await.unwrap();
        assert_eq!(meta.size, 10);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"blob bytes");
    }

    #[tokio::test]
    async fn write_verifies_hash() {
        let (_dir, store) = store();
        let wrong = hash_bytes(b"other data");
        let err = store
            .write_new(&wrong, Box::new(std::io::Cursor::new(b"blob bytes".to_vec())))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        // nothing observable under the final name
        assert!(matches!(
            store.stat(&wrong).await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn blob_mode_is_world_readable() {
        let (dir, store) = store();
        let hash = put(&store, b"perm check").await;
        let mode = std::fs::metadata(dir.path().join(hash.as_str()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, store) = store();
        let hash = put(&store, b"to remove").await;
        store.remove(&hash).await.unwrap();
        store.remove(&hash).await.unwrap();
        assert!(matches!(
            store.stat(&hash).await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn list_skips_foreign_names() {
        let (dir, store) = store();
        let hash = put(&store, b"listed").await;
        std::fs::write(dir.path().join("not-a-hash"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![hash]);
    }

    #[tokio::test]
    async fn set_mtime_applies() {
        let (_dir, store) = store();
        let hash = put(&store, b"mtime").await;
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        store.set_mtime(&hash, t).await.unwrap();
        let meta = store.stat(&hash).await.unwrap();
        assert_eq!(meta.modified, t);
    }

    #[tokio::test]
    async fn open_directory_blob_fails() {
        let (dir, store) = store();
        let hash = hash_bytes(b"dir stand-in");
        std::fs::create_dir(dir.path().join(hash.as_str())).unwrap();
        assert!(matches!(
            store.open(&hash).await.unwrap_err(),
            StoreError::IsDirectory
        ));
    }
}
