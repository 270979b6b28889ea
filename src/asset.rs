//! WSI asset ingestion and lookup.
//!
//! Assets are content addressed: the id of an uploaded slide is the SHA-256
//! of its bytes followed by its original extension, so uploading identical
//! bytes twice is a no-op.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::archive::{is_zip_file, DirectorySlide, ZipLayout};
use crate::error::AssetError;
use crate::format::tiff::{PyramidLevel, TiffPyramid};
use crate::format::{detect_format, FormatTag};
use crate::io::FileRangeReader;
use crate::store::{BlobStore, PutOutcome};

/// Read buffer used while hashing uploads.
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

// =============================================================================
// Types
// =============================================================================

/// Where an asset's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetLocation {
    /// A single slide file
    File { path: PathBuf },

    /// An archive holding an index file plus its data directory
    Directory {
        archive: PathBuf,
        index: String,
        auxiliary: Vec<String>,
    },
}

/// An uploaded slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WsiAsset {
    /// Store key: content hash plus original extension
    pub id: String,

    /// Detected format, `None` when the detector did not recognise it
    pub format: Option<FormatTag>,

    pub location: AssetLocation,

    /// Whether this upload wrote new bytes
    pub newly_stored: bool,
}

/// Asset details for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct AssetDescription {
    pub id: String,
    pub size: u64,
    pub format: Option<FormatTag>,
    pub archive: bool,

    /// Pyramid levels for TIFF-based slides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<PyramidLevel>>,
}

// =============================================================================
// Ingestion
// =============================================================================

/// Store a single slide file.
pub async fn ingest_file(store: &dyn BlobStore, path: &Path) -> Result<WsiAsset, AssetError> {
    let id = content_key(path).await?;
    let outcome = store.put_file(&id, path).await?;
    let stored_path = store.path(&id)?;
    let format = detect_format(&stored_path).await;

    info!(
        id = %id,
        format = format.map(|f| f.name()).unwrap_or("unknown"),
        new = outcome == PutOutcome::Stored,
        "ingested slide"
    );

    Ok(WsiAsset {
        id,
        format,
        location: AssetLocation::File { path: stored_path },
        newly_stored: outcome == PutOutcome::Stored,
    })
}

/// Store an upload.
///
/// A ZIP holding a directory slide at its top level is kept whole as one
/// asset. Any other ZIP is unpacked and each top-level file becomes its own
/// asset. Non-ZIP uploads are stored as a single file.
pub async fn ingest_upload(store: &dyn BlobStore, path: &Path) -> Result<Vec<WsiAsset>, AssetError> {
    if !is_zip_file(path).await {
        return Ok(vec![ingest_file(store, path).await?]);
    }

    let archive = path.to_path_buf();
    let layout = tokio::task::spawn_blocking(move || ZipLayout::read(&archive))
        .await
        .map_err(|e| AssetError::read(path, e))?
        .map_err(|e| archive_error(path, e))?;

    if let Some(slide) = layout.directory_slide() {
        return Ok(vec![ingest_directory_slide(store, path, slide).await?]);
    }

    let scratch = tempfile::tempdir().map_err(|e| AssetError::read(path, e))?;
    let archive = path.to_path_buf();
    let target = scratch.path().to_path_buf();
    let names: Vec<String> = layout.top_level_files().map(str::to_string).collect();
    let extracted = tokio::task::spawn_blocking(move || extract_entries(&archive, &target, &names))
        .await
        .map_err(|e| AssetError::read(path, e))??;

    let mut assets = Vec::new();
    for file in extracted {
        assets.push(ingest_file(store, &file).await?);
    }
    if assets.is_empty() {
        warn!(upload = %path.display(), "archive has no top-level files");
    }
    Ok(assets)
}

async fn ingest_directory_slide(
    store: &dyn BlobStore,
    path: &Path,
    slide: DirectorySlide,
) -> Result<WsiAsset, AssetError> {
    let mut asset = ingest_file(store, path).await?;
    debug!(id = %asset.id, index = %slide.index, files = slide.auxiliary.len(), "directory slide archive");

    let archive = match asset.location {
        AssetLocation::File { path } => path,
        AssetLocation::Directory { archive, .. } => archive,
    };
    asset.format = Path::new(&slide.index)
        .extension()
        .filter(|ext| ext.eq_ignore_ascii_case("mrxs"))
        .map(|_| FormatTag::Mirax);
    asset.location = AssetLocation::Directory {
        archive,
        index: slide.index,
        auxiliary: slide.auxiliary,
    };
    Ok(asset)
}

/// Extract the named top-level entries, skipping names that would escape
/// `target`.
fn extract_entries(
    archive: &Path,
    target: &Path,
    names: &[String],
) -> Result<Vec<PathBuf>, AssetError> {
    let file = std::fs::File::open(archive).map_err(|e| AssetError::read(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_error(archive, e))?;

    let mut extracted = Vec::with_capacity(names.len());
    for name in names {
        let mut entry = zip.by_name(name).map_err(|e| archive_error(archive, e))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = %name, "skipping unsafe archive entry");
            continue;
        };
        let out_path = target.join(relative);
        let mut out =
            std::fs::File::create(&out_path).map_err(|e| AssetError::read(&out_path, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| archive_error(archive, e))?;
        extracted.push(out_path);
    }
    Ok(extracted)
}

fn archive_error(path: &Path, err: impl std::fmt::Display) -> AssetError {
    AssetError::Archive {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Content-derived store key: `<sha256 hex><original extension>`.
pub async fn content_key(path: &Path) -> Result<String, AssetError> {
    let hash = hash_file(path).await?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    Ok(format!("{hash}{extension}"))
}

/// SHA-256 of a file, hex encoded.
pub async fn hash_file(path: &Path) -> Result<String, AssetError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AssetError::read(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| AssetError::read(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

// =============================================================================
// Lookup
// =============================================================================

/// Local path of a stored asset, failing if it does not exist.
pub async fn resolve_asset(store: &dyn BlobStore, id: &str) -> Result<PathBuf, AssetError> {
    if !store.exists(id).await? {
        return Err(AssetError::NotFound { id: id.to_string() });
    }
    Ok(store.path(id)?)
}

/// Format and pyramid details of a stored asset.
pub async fn describe_asset(store: &dyn BlobStore, id: &str) -> Result<AssetDescription, AssetError> {
    let path = resolve_asset(store, id).await?;
    let size = tokio::fs::metadata(&path)
        .await
        .map_err(|e| AssetError::read(&path, e))?
        .len();
    let format = detect_format(&path).await;
    let archive = is_zip_file(&path).await;

    let levels = match format {
        Some(format) if format.is_tiff() => read_levels(&path).await,
        _ => None,
    };

    Ok(AssetDescription {
        id: id.to_string(),
        size,
        format,
        archive,
        levels,
    })
}

async fn read_levels(path: &Path) -> Option<Vec<PyramidLevel>> {
    let reader = FileRangeReader::open(path).await.ok()?;
    match TiffPyramid::parse(&reader).await {
        Ok(pyramid) => Some(pyramid.levels),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not read pyramid");
            None
        }
    }
}

/// Remove an asset from the store.
pub async fn delete_asset(store: &dyn BlobStore, id: &str) -> Result<(), AssetError> {
    if !store.exists(id).await? {
        return Err(AssetError::NotFound { id: id.to_string() });
    }
    store.delete(id).await?;
    info!(id, "deleted slide");
    Ok(())
}
