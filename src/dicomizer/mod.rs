//! Dicomizer strategies.
//!
//! Two engines convert slides to DICOM behind the same [`Dicomizer`]
//! interface:
//!
//! - [`SubprocessDicomizer`] drives an external converter executable
//! - [`LibraryDicomizer`] drives a WSI library through the [`WsiLibrary`]
//!   contract, with explicit control over pyramid levels and encoding
//!
//! [`select`] picks the engine from the detected format.

mod library;
mod process;
mod subprocess;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ConversionError;
use crate::format::FormatTag;
use crate::metadata::DicomTagSet;

pub use library::{
    ContentFlags, EquipmentMetadata, JpegSettings, LevelPlan, LibraryBridge, LibraryDicomizer,
    LibraryJob, PatientMetadata, SeriesMetadata, StudyMetadata, WsiLibrary, WsiMetadata,
    OUTPUT_LEVELS,
};
pub use subprocess::{SubprocessDicomizer, SubprocessSettings};

/// Which engine converts a slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Subprocess,
    Library,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Subprocess => f.write_str("subprocess"),
            StrategyKind::Library => f.write_str("library"),
        }
    }
}

/// Engine for a detected format.
pub fn select(format: FormatTag) -> StrategyKind {
    match format {
        FormatTag::Aperio | FormatTag::Leica | FormatTag::Isyntax => StrategyKind::Library,
        FormatTag::Hamamatsu
        | FormatTag::Mirax
        | FormatTag::Philips
        | FormatTag::Trestle
        | FormatTag::Ventana
        | FormatTag::GenericTiff => StrategyKind::Subprocess,
    }
}

/// A slide to DICOM converter.
///
/// On success `output_dir` holds one or more DICOM instance files. On
/// failure its contents are undefined and must be discarded.
#[async_trait]
pub trait Dicomizer: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn convert(
        &self,
        tags: &DicomTagSet,
        input: &Path,
        output_dir: &Path,
    ) -> Result<(), ConversionError>;
}

/// One engine per strategy kind.
#[derive(Clone)]
pub struct DicomizerSet {
    pub subprocess: Arc<dyn Dicomizer>,
    pub library: Arc<dyn Dicomizer>,
}

impl DicomizerSet {
    pub fn new(subprocess: Arc<dyn Dicomizer>, library: Arc<dyn Dicomizer>) -> Self {
        Self {
            subprocess,
            library,
        }
    }

    pub fn for_kind(&self, kind: StrategyKind) -> &Arc<dyn Dicomizer> {
        match kind {
            StrategyKind::Subprocess => &self.subprocess,
            StrategyKind::Library => &self.library,
        }
    }
}
