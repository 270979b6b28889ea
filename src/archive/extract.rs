//! Archive Extractor.
//!
//! Uploaded assets are either a slide file or a ZIP. [`normalize`] turns
//! both into one local path a converter can open:
//!
//! - plain files are used in place
//! - directory slides (an index such as `slide.mrxs` plus a `slide/` data
//!   directory) are moved side by side into a flat scratch directory and
//!   the index path is returned
//! - otherwise the first extracted file the Format Detector recognises is
//!   returned
//!
//! Extracted data lives in a [`TempDir`] owned by the returned
//! [`NormalizedInput`] and is removed when it is dropped.

use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::ExtractError;
use crate::format::detect_format;

use super::{is_directory_index, is_zip_file};

/// Subdirectory of the scratch dir receiving the raw archive contents.
const CONTENTS_DIR: &str = "contents";

/// Subdirectory of the scratch dir receiving a materialised directory slide.
const SLIDE_DIR: &str = "slide";

// =============================================================================
// NormalizedInput
// =============================================================================

/// A slide path ready for conversion.
#[derive(Debug)]
pub struct NormalizedInput {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl NormalizedInput {
    fn in_place(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            scratch: None,
        }
    }

    /// Path to hand to the converter.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path points into extracted scratch data.
    pub fn is_extracted(&self) -> bool {
        self.scratch.is_some()
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// What the blocking extraction step found.
enum Located {
    Directory(PathBuf),
    Candidates(Vec<PathBuf>),
}

/// Normalize `raw` into a single convertible path.
///
/// Archives are extracted under `scratch_root`.
pub async fn normalize(raw: &Path, scratch_root: &Path) -> Result<NormalizedInput, ExtractError> {
    if !is_zip_file(raw).await {
        return Ok(NormalizedInput::in_place(raw));
    }

    let scratch = tempfile::Builder::new()
        .prefix("wsi-extract-")
        .tempdir_in(scratch_root)
        .map_err(|e| ExtractError::Io(format!("cannot create scratch directory: {e}")))?;

    let archive = raw.to_path_buf();
    let root = scratch.path().to_path_buf();
    let located = tokio::task::spawn_blocking(move || locate(&archive, &root))
        .await
        .map_err(|e| ExtractError::Io(format!("extraction task failed: {e}")))??;

    let path = match located {
        Located::Directory(index) => Some(index),
        Located::Candidates(candidates) => {
            let mut found = None;
            for candidate in candidates {
                if detect_format(&candidate).await.is_some() {
                    found = Some(candidate);
                    break;
                }
            }
            found
        }
    };

    match path {
        Some(path) => {
            info!(archive = %raw.display(), slide = %path.display(), "normalized archive input");
            Ok(NormalizedInput {
                path,
                scratch: Some(scratch),
            })
        }
        None => Err(ExtractError::NoUsableSlideFound(raw.to_path_buf())),
    }
}

/// Extract `archive` under `root` and look for a slide entry point.
fn locate(archive: &Path, root: &Path) -> Result<Located, ExtractError> {
    let contents = root.join(CONTENTS_DIR);
    extract_zip(archive, &contents)?;

    if let Some((index, data_dir)) = find_directory_slide(&contents) {
        let index = materialize(&index, &data_dir, &root.join(SLIDE_DIR))?;
        return Ok(Located::Directory(index));
    }

    let candidates = WalkDir::new(&contents)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    Ok(Located::Candidates(candidates))
}

fn extract_zip(archive: &Path, target: &Path) -> Result<(), ExtractError> {
    let corrupt = |message: String| ExtractError::Corrupt {
        path: archive.to_path_buf(),
        message,
    };

    let file = File::open(archive).map_err(|e| corrupt(e.to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    std::fs::create_dir_all(target)
        .map_err(|e| ExtractError::Io(format!("cannot create {}: {e}", target.display())))?;
    zip.extract(target).map_err(|e| corrupt(e.to_string()))?;

    debug!(archive = %archive.display(), entries = zip.len(), "extracted archive");
    Ok(())
}

/// Find an index file whose same-name sibling directory holds data files.
fn find_directory_slide(root: &Path) -> Option<(PathBuf, PathBuf)> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_directory_index(e.path()))
        .find_map(|entry| {
            let index = entry.into_path();
            let data_dir = index.with_extension("");
            has_files(&data_dir).then_some((index, data_dir))
        })
}

fn has_files(dir: &Path) -> bool {
    dir.is_dir()
        && WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file())
}

/// Move an index file and its data directory side by side into `flat`.
fn materialize(index: &Path, data_dir: &Path, flat: &Path) -> Result<PathBuf, ExtractError> {
    let io = |e: std::io::Error| ExtractError::Io(format!("cannot materialize directory slide: {e}"));

    let (Some(index_name), Some(dir_name)) = (index.file_name(), data_dir.file_name()) else {
        return Err(ExtractError::Io(format!(
            "malformed directory slide path {}",
            index.display()
        )));
    };

    std::fs::create_dir_all(flat).map_err(io)?;
    let target_index = flat.join(index_name);
    std::fs::rename(index, &target_index).map_err(io)?;
    std::fs::rename(data_dir, flat.join(dir_name)).map_err(io)?;
    Ok(target_index)
}

// =============================================================================
// ZipLayout
// =============================================================================

/// A directory slide found at the top level of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySlide {
    /// Index entry name, e.g. `slide.mrxs`
    pub index: String,
    /// Entry names inside the data directory
    pub auxiliary: Vec<String>,
}

/// Regular-file entry names of a ZIP, read without extracting it.
#[derive(Debug, Clone, Default)]
pub struct ZipLayout {
    files: Vec<String>,
}

impl ZipLayout {
    /// Read the entry list of the archive at `path`.
    pub fn read(path: &Path) -> Result<Self, ExtractError> {
        let corrupt = |message: String| ExtractError::Corrupt {
            path: path.to_path_buf(),
            message,
        };
        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let zip = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
        Ok(Self::from_names(zip.file_names()))
    }

    pub(crate) fn from_names<'a>(names: impl Iterator<Item = &'a str>) -> Self {
        let mut files: Vec<String> = names
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        files.sort();
        Self { files }
    }

    /// All regular-file entries, sorted.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Entries that are not inside any directory.
    pub fn top_level_files(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(String::as_str)
            .filter(|name| !name.contains('/'))
    }

    /// First top-level index whose same-name directory holds entries.
    pub fn directory_slide(&self) -> Option<DirectorySlide> {
        self.top_level_files()
            .filter(|name| is_directory_index(Path::new(name)))
            .find_map(|index| {
                let stem = Path::new(index).file_stem()?.to_str()?;
                let prefix = format!("{stem}/");
                let auxiliary: Vec<String> = self
                    .files
                    .iter()
                    .filter(|name| name.starts_with(&prefix))
                    .cloned()
                    .collect();
                (!auxiliary.is_empty()).then(|| DirectorySlide {
                    index: index.to_string(),
                    auxiliary,
                })
            })
    }
}
