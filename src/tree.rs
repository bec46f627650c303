//! Publish operations: add, remove, batch sync, and garbage collection.
//!
//! The publisher stages source files into the blob store under their content
//! hashes and registers records in the tree database. Mutations enqueue
//! superseded hashes as GC candidates (the database does this
//! transactionally), and every publish operation drains the queue before
//! returning.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info};

use crate::db::{ContentRecord, DbError, EncodedContent, TreeDb};
use crate::store::{BlobStore, StoreError};
use crate::{ContentHash, clean_path, hash};

const LIST_PAGE_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("source file not found: {0}")]
    SrcNotFound(PathBuf),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid match regex for {src}: {err}")]
    BadMatchRegex { src: String, err: regex::Error },

    #[error("tree db: {0}")]
    Db(#[from] DbError),

    #[error("blob store: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One encoded alternate supplied to [`Tree::add`].
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub code: String,
    pub src: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub dirs: Vec<SyncDirConfig>,
}

/// One sync entry: either an exact file publish or a recursive directory
/// walk filtered by a regex.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncDirConfig {
    pub dst: String,
    #[serde(default, rename = "contenttype")]
    pub content_type: String,
    #[serde(default)]
    pub exact: bool,
    pub src: String,
    /// Regex the source-relative path must satisfy (glob entries only).
    #[serde(default, rename = "match")]
    pub match_pattern: String,
    #[serde(default)]
    pub alts: Vec<EncodedAlt>,
}

/// Encoded alternates for a sync entry. Exact entries name the encoded file
/// directly; glob entries derive it by appending `suffix` to the source
/// path.
#[derive(Debug, Clone, Deserialize)]
pub struct EncodedAlt {
    pub code: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub name: String,
}

/// The publish engine over a blob store and a tree database.
pub struct Tree<S, D> {
    store: S,
    db: D,
}

impl<S: BlobStore, D: TreeDb> Tree<S, D> {
    pub fn new(store: S, db: D) -> Self {
        Self { store, db }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    /// Idempotent schema setup, delegated to the tree database.
    pub fn setup(&self) -> Result<(), TreeError> {
        self.db.setup()?;
        Ok(())
    }

    /// Publish one file (and its pre-encoded alternates) under `dst`.
    pub async fn add(
        &self,
        dst: &str,
        content_type: &str,
        src: &Path,
        encoded: &[EncodedFile],
    ) -> Result<(), TreeError> {
        if dst.is_empty() {
            return Err(TreeError::InvalidRequest("must provide dst".into()));
        }
        for enc in encoded {
            if enc.code.is_empty() {
                return Err(TreeError::InvalidRequest(
                    "must provide encoded file code".into(),
                ));
            }
        }
        let dst = clean_path(dst);
        if dst.is_empty() {
            return Err(TreeError::InvalidRequest("must provide dst".into()));
        }

        let alts: Vec<(String, PathBuf)> = encoded
            .iter()
            .map(|e| (e.code.clone(), e.src.clone()))
            .collect();
        self.publish(&dst, content_type, src, &alts, false).await?;
        self.drain_gc().await
    }

    /// Remove the record at `name`. The record must exist.
    pub async fn rm(&self, name: &str) -> Result<(), TreeError> {
        if name.is_empty() {
            return Err(TreeError::InvalidRequest("must provide name".into()));
        }
        let name = clean_path(name);
        match self.db.delete(&name) {
            Ok(()) => {}
            Err(DbError::NotFound) => return Err(TreeError::NotFound(name)),
            Err(e) => return Err(e.into()),
        }
        info!(%name, "removed content record");
        self.drain_gc().await
    }

    /// Batch publish from configuration. With `rm_after`, records not
    /// covered by the configuration are deleted afterwards.
    pub async fn sync(&self, cfg: &SyncConfig, rm_after: bool) -> Result<(), TreeError> {
        for dir in &cfg.dirs {
            for alt in &dir.alts {
                if alt.code.is_empty() {
                    return Err(TreeError::InvalidRequest(
                        "must provide encoded file code".into(),
                    ));
                }
            }
        }

        let mut handled: HashSet<String> = HashSet::new();
        for dir in &cfg.dirs {
            let dst_prefix = clean_path(&dir.dst);
            if dir.exact {
                if dst_prefix.is_empty() {
                    return Err(TreeError::InvalidRequest("must provide dst".into()));
                }
                let alts: Vec<(String, PathBuf)> = dir
                    .alts
                    .iter()
                    .map(|a| (a.code.clone(), PathBuf::from(&a.name)))
                    .collect();
                self.publish(
                    &dst_prefix,
                    &dir.content_type,
                    Path::new(&dir.src),
                    &alts,
                    false,
                )
                .await?;
                handled.insert(dst_prefix);
            } else {
                self.sync_dir(&mut handled, dir, &dst_prefix).await?;
            }
        }

        if rm_after {
            let mut after: Option<String> = None;
            loop {
                let page = self.db.list(LIST_PAGE_SIZE, after.as_deref())?;
                let Some(last) = page.last().cloned() else {
                    break;
                };
                for name in page {
                    if !handled.contains(&name) {
                        self.db.delete(&name)?;
                        info!(%name, "removed unsynced content record");
                    }
                }
                after = Some(last);
            }
        }

        self.drain_gc().await
    }

    /// Drain the GC candidate queue; with `full`, additionally sweep the
    /// blob store for unreferenced blobs. Full sweeps are racy against
    /// concurrent publishes and must only run on a quiescent tree.
    pub async fn gc(&self, full: bool) -> Result<(), TreeError> {
        self.drain_gc().await?;
        if full {
            for hash in self.store.list().await? {
                if !self.db.content_exists(&hash)? {
                    self.store.remove(&hash).await?;
                    info!(blob = %hash, "removed unreferenced blob");
                }
            }
        }
        Ok(())
    }

    async fn sync_dir(
        &self,
        handled: &mut HashSet<String>,
        dir: &SyncDirConfig,
        dst_prefix: &str,
    ) -> Result<(), TreeError> {
        let matcher = Regex::new(&dir.match_pattern).map_err(|err| TreeError::BadMatchRegex {
            src: dir.src.clone(),
            err,
        })?;
        let root = Path::new(&dir.src);

        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                TreeError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other(format!("failed walking {}", dir.src))
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if !matcher.is_match(&rel) {
                debug!(dst = dst_prefix, src = %rel, "skipping unmatched file");
                continue;
            }

            let dst = clean_path(&format!("{dst_prefix}/{rel}"));
            let alts: Vec<(String, PathBuf)> = dir
                .alts
                .iter()
                .map(|a| {
                    let mut alt = entry.path().as_os_str().to_owned();
                    alt.push(&a.suffix);
                    (a.code.clone(), PathBuf::from(alt))
                })
                .collect();
            self.publish(&dst, &dir.content_type, entry.path(), &alts, true)
                .await?;
            handled.insert(dst);
        }
        Ok(())
    }

    /// Stage blobs for one destination and write the record if it changed.
    /// With `skip_missing_alts`, absent encoded files are skipped instead of
    /// failing the publish (sync directories commonly have partial
    /// alternate coverage).
    async fn publish(
        &self,
        dst: &str,
        content_type: &str,
        src: &Path,
        alts: &[(String, PathBuf)],
        skip_missing_alts: bool,
    ) -> Result<(), TreeError> {
        let prior = match self.db.get(dst) {
            Ok(rec) => Some(rec),
            Err(DbError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let mut record = ContentRecord {
            hash: self
                .ensure_blob(prior.as_ref().map(|p| &p.hash), src)
                .await?,
            content_type: content_type.to_string(),
            encodings: Vec::with_capacity(alts.len()),
        };
        for (code, alt_src) in alts {
            let prior_enc = prior
                .as_ref()
                .and_then(|p| p.encodings.iter().find(|e| &e.code == code))
                .map(|e| &e.hash);
            let hash = match self.ensure_blob(prior_enc, alt_src).await {
                Ok(hash) => hash,
                Err(TreeError::SrcNotFound(path)) if skip_missing_alts => {
                    debug!(dst, src = %path.display(), "skipping missing alt file");
                    continue;
                }
                Err(e) => return Err(e),
            };
            record.encodings.push(EncodedContent {
                code: code.clone(),
                hash,
            });
        }

        match prior {
            Some(prior) if prior == record => {
                info!(dst, "skipping unchanged content record");
            }
            Some(_) => {
                self.db.update(dst, &record)?;
                info!(dst, "updated content record");
            }
            None => {
                self.db.insert(dst, &record)?;
                info!(dst, "added content record");
            }
        }
        Ok(())
    }

    /// Decide whether `src` needs to be copied into the blob store.
    ///
    /// Reuses the prior blob without rehashing when size matches and the
    /// blob is no older than the source; otherwise hashes the source and
    /// copies only if no equally fresh blob already sits under that hash.
    async fn ensure_blob(
        &self,
        existing: Option<&ContentHash>,
        src: &Path,
    ) -> Result<ContentHash, TreeError> {
        let src_meta = match fs::metadata(src).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TreeError::SrcNotFound(src.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        if src_meta.is_dir() {
            return Err(TreeError::InvalidRequest(format!(
                "source file {} is a directory",
                src.display()
            )));
        }
        let src_size = src_meta.len();
        let src_mtime = src_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let mut existing_matches_size = false;
        if let Some(existing) = existing {
            match self.store.stat(existing).await {
                Ok(meta) if meta.size == src_size => {
                    if meta.modified >= src_mtime {
                        info!(src = %src.display(), blob = %existing,
                            "reusing unchanged blob on matching size and mtime");
                        return Ok(existing.clone());
                    }
                    existing_matches_size = true;
                }
                Ok(_) | Err(StoreError::NotFound) | Err(StoreError::IsDirectory) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let hashed = hash::hash_file(src).await?;

        if let Some(existing) = existing
            && &hashed == existing
            && existing_matches_size
        {
            // same bytes, back-dated source tree: refresh the blob mtime so
            // the short-circuit above fires next time
            self.store.set_mtime(existing, src_mtime).await?;
            info!(src = %src.display(), blob = %existing,
                "reusing unchanged blob on matching size and hash");
            return Ok(hashed);
        }

        match self.store.stat(&hashed).await {
            Ok(meta) if meta.size == src_size && meta.modified >= src_mtime => {
                info!(src = %src.display(), blob = %hashed, "reusing existing blob");
                return Ok(hashed);
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let file = File::open(src).await?;
        self.store.write_new(&hashed, Box::new(file)).await?;
        info!(src = %src.display(), blob = %hashed, "added content file");
        Ok(hashed)
    }

    /// Drain the GC candidate queue: remove blobs no record references any
    /// more, then dequeue each candidate.
    async fn drain_gc(&self) -> Result<(), TreeError> {
        for hash in self.db.gc_candidates()? {
            if !self.db.content_exists(&hash)? {
                self.store.remove(&hash).await?;
                info!(blob = %hash, "collected unreferenced blob");
            }
            self.db.gc_dequeue(&hash)?;
        }
        Ok(())
    }
}
