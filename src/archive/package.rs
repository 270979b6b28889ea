//! Output packaging.
//!
//! Every instance file from every slide's output directory is written into
//! one flat ZIP under a freshly generated name, so slides that happen to
//! produce identically named files never collide and the converters'
//! directory layout does not leak into the deliverable.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::StoreError;

/// Store name reported for scratch-space failures.
const SCRATCH: &str = "scratch";

/// Extension given to every archive entry.
const ENTRY_EXTENSION: &str = "dcm";

/// Result of packaging one study.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    /// Instances written per output directory, in input order
    pub per_slide: Vec<usize>,
}

impl PackageSummary {
    /// Total instances in the archive.
    pub fn instances(&self) -> usize {
        self.per_slide.iter().sum()
    }
}

/// Write every file under `output_dirs` into a new ZIP at `archive_path`.
///
/// Blocking; callers on the runtime should use `spawn_blocking`.
pub fn package_outputs(
    output_dirs: &[PathBuf],
    archive_path: &Path,
) -> Result<PackageSummary, StoreError> {
    let file = File::create(archive_path)
        .map_err(|e| scratch_error(format!("create {}: {e}", archive_path.display())))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut names = HashSet::new();
    let mut per_slide = Vec::with_capacity(output_dirs.len());

    for dir in output_dirs {
        let mut count = 0;
        for path in instance_files(dir) {
            let name = fresh_entry_name(&mut names);
            append(&mut zip, &path, &name)?;
            debug!(source = %path.display(), entry = %name, "packaged instance");
            count += 1;
        }
        per_slide.push(count);
    }

    let mut writer = zip
        .finish()
        .map_err(|e| scratch_error(format!("finish archive: {e}")))?;
    writer
        .flush()
        .map_err(|e| scratch_error(format!("flush archive: {e}")))?;

    let summary = PackageSummary { per_slide };
    info!(
        archive = %archive_path.display(),
        instances = summary.instances(),
        "packaged study archive"
    );
    Ok(summary)
}

fn instance_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

/// Random entry name not yet used in this archive.
fn fresh_entry_name(used: &mut HashSet<String>) -> String {
    loop {
        let name = format!("{}.{ENTRY_EXTENSION}", Uuid::new_v4().simple());
        if used.insert(name.clone()) {
            return name;
        }
    }
}

fn append<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    source: &Path,
    name: &str,
) -> Result<(), StoreError> {
    let mut input = File::open(source)
        .map_err(|e| scratch_error(format!("open {}: {e}", source.display())))?;
    let size = input
        .metadata()
        .map(|m| m.len())
        .map_err(|e| scratch_error(format!("stat {}: {e}", source.display())))?;

    // Instances carry JPEG pixel data already.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(size >= u64::from(u32::MAX));

    zip.start_file(name, options)
        .map_err(|e| scratch_error(format!("start entry {name}: {e}")))?;
    std::io::copy(&mut input, zip)
        .map_err(|e| scratch_error(format!("write entry {name}: {e}")))?;
    Ok(())
}

fn scratch_error(message: String) -> StoreError {
    StoreError::Io {
        store: SCRATCH.to_string(),
        message,
    }
}
