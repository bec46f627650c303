use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::ContentHash;
use crate::hash::Hasher;

use super::{BlobReader, BlobStore, ByteReader, ObjectMeta, StoreError};

/// In-memory blob store. The serving and publish paths only see the
/// [`BlobStore`] trait, so this substitutes for the filesystem store in
/// tests and tooling.
#[derive(Default)]
pub struct MemStore {
    blobs: Mutex<HashMap<ContentHash, (Vec<u8>, SystemTime)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContentHash, (Vec<u8>, SystemTime)>> {
        self.blobs.lock().expect("mem store lock poisoned")
    }
}

#[async_trait]
impl BlobStore for MemStore {
    async fn open(&self, hash: &ContentHash) -> Result<(BlobReader, ObjectMeta), StoreError> {
        let blobs = self.lock();
        let (data, modified) = blobs.get(hash).ok_or(StoreError::NotFound)?;
        let meta = ObjectMeta {
            size: data.len() as u64,
            modified: *modified,
        };
        Ok((Box::new(std::io::Cursor::new(data.clone())), meta))
    }

    async fn stat(&self, hash: &ContentHash) -> Result<ObjectMeta, StoreError> {
        let blobs = self.lock();
        let (data, modified) = blobs.get(hash).ok_or(StoreError::NotFound)?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            modified: *modified,
        })
    }

    async fn write_new(&self, hash: &ContentHash, mut data: ByteReader) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let actual = hasher.finish();
        if &actual != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            });
        }

        self.lock()
            .insert(hash.clone(), (buf, SystemTime::now()));
        Ok(())
    }

    async fn set_mtime(&self, hash: &ContentHash, mtime: SystemTime) -> Result<(), StoreError> {
        let mut blobs = self.lock();
        let (_, modified) = blobs.get_mut(hash).ok_or(StoreError::NotFound)?;
        *modified = mtime;
        Ok(())
    }

    async fn remove(&self, hash: &ContentHash) -> Result<(), StoreError> {
        self.lock().remove(hash);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContentHash>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
