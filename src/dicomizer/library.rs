//! Conversion through a WSI library.
//!
//! [`LibraryDicomizer`] turns a tag set into structured metadata, asks the
//! library how many native pyramid levels the slide has, and requests
//! exactly [`OUTPUT_LEVELS`] output levels: missing levels are synthesised
//! when the slide has fewer, extra levels are dropped when it has more.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ConversionError;
use crate::format::is_tiff_header;
use crate::format::tiff::TiffPyramid;
use crate::io::FileRangeReader;
use crate::metadata::{DicomTagSet, TagMap};

use super::{process, Dicomizer, StrategyKind};

/// Pyramid levels in every library conversion.
pub const OUTPUT_LEVELS: usize = 6;

// =============================================================================
// Job model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyMetadata {
    pub uid: String,
    pub identifier: Option<String>,
    pub accession_number: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesMetadata {
    pub uid: String,
    pub number: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientMetadata {
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquipmentMetadata {
    pub manufacturer: Option<String>,
}

/// Structured metadata handed to the library.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsiMetadata {
    pub study: StudyMetadata,
    pub series: SeriesMetadata,
    pub patient: PatientMetadata,
    pub equipment: EquipmentMetadata,

    /// Full keyword dataset merged over the structured fields
    pub merge: TagMap,
}

impl From<&DicomTagSet> for WsiMetadata {
    fn from(tags: &DicomTagSet) -> Self {
        Self {
            study: StudyMetadata {
                uid: tags.study_instance_uid.clone(),
                identifier: tags.study_id.clone(),
                accession_number: tags.accession_number.clone(),
                description: tags.study_description.clone(),
            },
            series: SeriesMetadata {
                uid: tags.series_instance_uid.clone(),
                number: tags.series_number,
                description: tags.series_description.clone(),
            },
            patient: PatientMetadata {
                identifier: tags.patient_id.clone(),
                name: tags.patient_name.clone(),
            },
            equipment: EquipmentMetadata {
                manufacturer: tags.manufacturer.clone(),
            },
            merge: tags.to_dataset(),
        }
    }
}

/// Which pyramid levels to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelPlan {
    pub include_levels: Vec<usize>,
    pub add_missing_levels: bool,
}

impl LevelPlan {
    /// Plan for a slide with `native` pyramid levels.
    pub fn for_native(native: usize) -> Self {
        Self {
            include_levels: (0..OUTPUT_LEVELS).collect(),
            add_missing_levels: native < OUTPUT_LEVELS,
        }
    }
}

/// Lossy JPEG encoding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JpegSettings {
    pub quality: u8,
    pub subsampling: String,
}

impl Default for JpegSettings {
    fn default() -> Self {
        Self {
            quality: 100,
            subsampling: "420".to_string(),
        }
    }
}

/// Auxiliary images and attributes to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentFlags {
    pub include_label: bool,
    pub include_overview: bool,
    pub include_thumbnail: bool,
    pub include_confidential: bool,
}

impl Default for ContentFlags {
    /// Pyramid only, confidential attributes retained.
    fn default() -> Self {
        Self {
            include_label: false,
            include_overview: false,
            include_thumbnail: false,
            include_confidential: true,
        }
    }
}

/// One library conversion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryJob {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub metadata: WsiMetadata,
    pub encoding: JpegSettings,
    #[serde(flatten)]
    pub levels: LevelPlan,
    #[serde(flatten)]
    pub content: ContentFlags,
}

// =============================================================================
// WsiLibrary
// =============================================================================

/// The consumed library contract.
#[async_trait]
pub trait WsiLibrary: Send + Sync {
    /// Native pyramid levels of the slide at `input`.
    async fn level_count(&self, input: &Path) -> Result<usize, ConversionError>;

    /// Write DICOM instances for `job` into `job.output_dir`.
    async fn convert(&self, job: &LibraryJob) -> Result<(), ConversionError>;
}

/// Library-backed dicomizer.
#[derive(Clone)]
pub struct LibraryDicomizer {
    library: Arc<dyn WsiLibrary>,
}

impl LibraryDicomizer {
    pub fn new(library: Arc<dyn WsiLibrary>) -> Self {
        Self { library }
    }

    /// Job for one slide given its native level count.
    pub fn plan(tags: &DicomTagSet, input: &Path, output_dir: &Path, native: usize) -> LibraryJob {
        LibraryJob {
            input: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            metadata: WsiMetadata::from(tags),
            encoding: JpegSettings::default(),
            levels: LevelPlan::for_native(native),
            content: ContentFlags::default(),
        }
    }
}

#[async_trait]
impl Dicomizer for LibraryDicomizer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Library
    }

    async fn convert(
        &self,
        tags: &DicomTagSet,
        input: &Path,
        output_dir: &Path,
    ) -> Result<(), ConversionError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ConversionError::Io(format!("create {}: {e}", output_dir.display())))?;

        let native = self.library.level_count(input).await?;
        if native == 0 {
            return Err(ConversionError::Library(format!(
                "no pyramid levels found in {}",
                input.display()
            )));
        }

        let job = Self::plan(tags, input, output_dir, native);
        info!(
            input = %input.display(),
            native_levels = native,
            add_missing_levels = job.levels.add_missing_levels,
            series_uid = %tags.series_instance_uid,
            "running library conversion"
        );
        self.library.convert(&job).await
    }
}

// =============================================================================
// LibraryBridge
// =============================================================================

/// [`WsiLibrary`] backed by a bridge executable.
///
/// - `<bridge> inspect <input>` prints the native level count
/// - `<bridge> convert <job.json>` performs a conversion
///
/// TIFF slides are counted with the built-in pyramid parser instead of the
/// bridge.
#[derive(Debug, Clone)]
pub struct LibraryBridge {
    executable: PathBuf,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl LibraryBridge {
    /// Job files are written under `scratch_dir`.
    pub fn new(
        executable: impl Into<PathBuf>,
        timeout: Duration,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executable: executable.into(),
            timeout,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn program_name(&self) -> String {
        self.executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }

    async fn native_tiff_levels(&self, input: &Path) -> Option<usize> {
        let mut head = [0u8; 8];
        let mut file = tokio::fs::File::open(input).await.ok()?;
        file.read_exact(&mut head).await.ok()?;
        if !is_tiff_header(&head) {
            return None;
        }

        let reader = FileRangeReader::open(input).await.ok()?;
        let pyramid = TiffPyramid::parse(&reader).await.ok()?;
        Some(pyramid.level_count()).filter(|count| *count > 0)
    }
}

#[async_trait]
impl WsiLibrary for LibraryBridge {
    async fn level_count(&self, input: &Path) -> Result<usize, ConversionError> {
        if let Some(count) = self.native_tiff_levels(input).await {
            debug!(input = %input.display(), count, "counted TIFF pyramid levels");
            return Ok(count);
        }

        let program = self.program_name();
        let mut command = Command::new(&self.executable);
        command.arg("inspect").arg(input);
        let output = process::run(&program, command, self.timeout).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<usize>().map_err(|_| {
            ConversionError::Library(format!(
                "{program} inspect printed '{}' instead of a level count",
                stdout.trim()
            ))
        })
    }

    async fn convert(&self, job: &LibraryJob) -> Result<(), ConversionError> {
        let job_file = write_job_file(job, &self.scratch_dir)?;

        let mut command = Command::new(&self.executable);
        command.arg("convert").arg(job_file.path());
        process::run(&self.program_name(), command, self.timeout).await?;
        Ok(())
    }
}

fn write_job_file(job: &LibraryJob, dir: &Path) -> Result<tempfile::NamedTempFile, ConversionError> {
    let file = tempfile::Builder::new()
        .prefix("wsi-job-")
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(|e| ConversionError::Io(format!("job file: {e}")))?;
    serde_json::to_writer_pretty(file.as_file(), job)
        .map_err(|e| ConversionError::Io(format!("job file: {e}")))?;
    Ok(file)
}
