//! Content-addressed Blob Store.
//!
//! The pipeline talks to storage only through the [`BlobStore`] trait:
//! existence checks, put-if-absent writes, streaming reads, deletes,
//! directory listings, and local paths for tools that need a real file.
//!
//! Two named stores are used:
//!
//! - `wsi`: uploaded slides, keyed by content hash
//! - `dicoms`: output archives, keyed by Study Instance UID
//!
//! # Example
//!
//! ```no_run
//! use wsi_dicomizer::store::Stores;
//!
//! # async fn run() -> Result<(), wsi_dicomizer::error::StoreError> {
//! let stores = Stores::under("/var/lib/dicomizer")?;
//! if !stores.wsi.exists("4f2a.svs").await? {
//!     stores.wsi.put_bytes("4f2a.svs", bytes::Bytes::from_static(b"...")).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod fs;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::StoreError;

pub use fs::FsBlobStore;

/// Name of the store holding uploaded slides.
pub const WSI_STORE: &str = "wsi";

/// Name of the store holding converted study archives.
pub const DICOMS_STORE: &str = "dicoms";

/// Result of a put-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The payload was written under the key
    Stored,
    /// The key already existed; nothing was written
    AlreadyPresent,
}

/// Entries directly under a store directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
}

/// Readable stream over a stored blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Key-value storage for slides and archives.
///
/// Writes are put-if-absent: because keys are derived from content (or from
/// a freshly generated UID), an existing key is assumed to hold identical
/// bytes and is never overwritten.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store name, used in errors and logs.
    fn name(&self) -> &str;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Store `bytes` under `key` unless the key already exists.
    async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, StoreError>;

    /// Copy the file at `source` under `key` unless the key already exists.
    async fn put_file(&self, key: &str, source: &Path) -> Result<PutOutcome, StoreError>;

    /// Open `key` for reading.
    async fn open(&self, key: &str) -> Result<BlobReader, StoreError>;

    /// Delete `key`. Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List the directories and files directly under `dir` (`""` = root).
    async fn list(&self, dir: &str) -> Result<Listing, StoreError>;

    /// Local filesystem path of `key` (whether or not it exists).
    fn path(&self, key: &str) -> Result<PathBuf, StoreError>;
}

/// The two named stores the service works with.
#[derive(Clone)]
pub struct Stores {
    pub wsi: Arc<dyn BlobStore>,
    pub dicoms: Arc<dyn BlobStore>,
}

impl Stores {
    /// Filesystem-backed stores under `root/wsi` and `root/dicoms`.
    pub fn under(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        Ok(Self {
            wsi: Arc::new(FsBlobStore::new(WSI_STORE, root.join(WSI_STORE))?),
            dicoms: Arc::new(FsBlobStore::new(DICOMS_STORE, root.join(DICOMS_STORE))?),
        })
    }

    /// Look up a store by name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn BlobStore>> {
        match name {
            WSI_STORE => Some(&self.wsi),
            DICOMS_STORE => Some(&self.dicoms),
            _ => None,
        }
    }
}

/// Reject keys that are empty, absolute, or climb out of the store.
pub(crate) fn validate_key(key: &str) -> Result<&Path, StoreError> {
    let path = Path::new(key);
    let well_formed = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if well_formed {
        Ok(path)
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
