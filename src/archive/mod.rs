//! ZIP handling on both sides of a conversion.
//!
//! - [`extract`]: turns an uploaded asset (plain slide or ZIP) into a single
//!   path the converters can open
//! - [`package`]: flattens converter output into one study archive

pub mod extract;
pub mod package;

use std::path::Path;

use tokio::io::AsyncReadExt;

pub use extract::{normalize, DirectorySlide, NormalizedInput, ZipLayout};
pub use package::{package_outputs, PackageSummary};

/// Extensions of index files that point at a same-name data directory.
pub const DIRECTORY_INDEX_EXTENSIONS: &[&str] = &["mrxs"];

/// Local file header and empty-archive signatures.
const ZIP_SIGNATURES: [[u8; 4]; 2] = [*b"PK\x03\x04", *b"PK\x05\x06"];

/// Whether the file at `path` starts with a ZIP signature.
///
/// Unreadable and short files are reported as not being archives.
pub async fn is_zip_file(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic).await {
        Ok(_) => ZIP_SIGNATURES.contains(&magic),
        Err(_) => false,
    }
}

/// Whether `path` names a directory-slide index file.
pub(crate) fn is_directory_index(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            DIRECTORY_INDEX_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
