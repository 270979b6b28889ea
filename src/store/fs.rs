//! Filesystem-backed [`BlobStore`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

use super::{validate_key, BlobReader, BlobStore, Listing, PutOutcome};

/// Prefix of in-flight temporary files; hidden from listings.
const TEMP_PREFIX: &str = ".tmp-";

/// Blob store rooted at a local directory.
///
/// Put-if-absent is atomic: the payload is first written to a temporary file
/// inside the root, then hard-linked to its final name. `link(2)` fails if
/// the target exists, so of two concurrent first-uploads exactly one stores
/// and the other observes [`PutOutcome::AlreadyPresent`]. Readers never see
/// a partially written blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    name: String,
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let name = name.into();
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::Io {
            store: name.clone(),
            message: format!("cannot create {}: {}", root.display(), e),
        })?;
        Ok(Self { name, root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn io_error(&self, context: &str, err: std::io::Error) -> StoreError {
        StoreError::Io {
            store: self.name.clone(),
            message: format!("{context}: {err}"),
        }
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::NotFound {
            store: self.name.clone(),
            key: key.to_string(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Link a fully written temporary file into place.
    async fn commit(&self, key: &str, temp: &Path, target: &Path) -> Result<PutOutcome, StoreError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("create parent directory", e))?;
        }

        let linked = tokio::fs::hard_link(temp, target).await;
        let _ = tokio::fs::remove_file(temp).await;

        match linked {
            Ok(()) => {
                debug!(store = %self.name, key, "stored blob");
                Ok(PutOutcome::Stored)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(store = %self.name, key, "blob already present");
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(e) => Err(self.io_error("link blob", e)),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| self.io_error("stat blob", e))
    }

    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, StoreError> {
        let target = self.path(key)?;
        if self.exists(key).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let temp = self.temp_path();
        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.io_error("write blob", e));
        }
        self.commit(key, &temp, &target).await
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<PutOutcome, StoreError> {
        let target = self.path(key)?;
        if self.exists(key).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        let temp = self.temp_path();
        if let Err(e) = tokio::fs::copy(source, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(self.io_error(&format!("copy {}", source.display()), e));
        }
        self.commit(key, &temp, &target).await
    }

    async fn open(&self, key: &str) -> Result<BlobReader, StoreError> {
        let path = self.path(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.not_found(key)),
            Err(e) => Err(self.io_error("open blob", e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(store = %self.name, key, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error("delete blob", e)),
        }
    }

    async fn list(&self, dir: &str) -> Result<Listing, StoreError> {
        let path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.path(dir)?
        };

        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.not_found(dir)),
            Err(e) => return Err(self.io_error("list directory", e)),
        };

        let mut listing = Listing::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_error("list directory", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| self.io_error("list directory", e))?;
            if file_type.is_dir() {
                listing.dirs.push(name);
            } else {
                listing.files.push(name);
            }
        }

        listing.dirs.sort();
        listing.files.sort();
        Ok(listing)
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(validate_key(key)?))
    }
}
