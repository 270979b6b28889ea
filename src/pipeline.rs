//! Study Conversion Pipeline.
//!
//! One [`StudyRequest`] moves through
//! `Validating -> Resolving -> Converting(i) -> Packaging -> Uploading`.
//! Any failure stops the run with a [`PipelineFailure`] naming the stage;
//! nothing is written to the `dicoms` store unless every slide converted
//! into at least one instance.
//!
//! All scratch data (extracted archives, per-slide output directories, the
//! study archive before upload) lives under one temporary directory that is
//! removed when the run ends, whatever the outcome.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{field, info, info_span, warn, Instrument, Span};

use crate::archive::{normalize, package_outputs};
use crate::dicomizer::{select, DicomizerSet, StrategyKind};
use crate::error::{AssetError, ConversionError, ExtractError, PipelineError, StoreError};
use crate::format::{detect_format, FormatTag};
use crate::metadata::{study_identity_hash, MetadataBuilder, StudyRequest};
use crate::store::{PutOutcome, Stores};

// =============================================================================
// Stages and results
// =============================================================================

/// Pipeline stage, used to report where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Resolving,
    /// Converting the slide at this index of the request
    Converting { slide: usize },
    Packaging,
    Uploading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validating => f.write_str("validating"),
            Stage::Resolving => f.write_str("resolving"),
            Stage::Converting { slide } => write!(f, "converting slide {slide}"),
            Stage::Packaging => f.write_str("packaging"),
            Stage::Uploading => f.write_str("uploading"),
        }
    }
}

/// Terminal failure of a run.
#[derive(Debug, Clone, Error)]
#[error("study conversion failed while {stage}: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl PipelineFailure {
    fn at(stage: Stage) -> impl Fn(PipelineError) -> PipelineFailure {
        move |error| PipelineFailure { stage, error }
    }
}

/// Per-slide outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesResult {
    pub wsi_id: String,
    pub series_instance_uid: String,
    pub format: FormatTag,
    pub strategy: StrategyKind,
    pub number_of_instances: usize,
}

/// Successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyConversionResult {
    pub study_instance_uid: String,
    pub study_orthanc_id: String,
    pub number_of_instances: usize,
    pub series: Vec<SeriesResult>,
}

/// Key of a study archive in the `dicoms` store.
pub fn archive_key(study_instance_uid: &str) -> String {
    format!("{study_instance_uid}.zip")
}

// =============================================================================
// StudyPipeline
// =============================================================================

/// Converts study requests into stored DICOM archives.
#[derive(Clone)]
pub struct StudyPipeline {
    stores: Stores,
    dicomizers: DicomizerSet,
    scratch_root: PathBuf,
}

impl StudyPipeline {
    pub fn new(stores: Stores, dicomizers: DicomizerSet, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            stores,
            dicomizers,
            scratch_root: scratch_root.into(),
        }
    }

    /// Run one request to completion.
    pub async fn run(&self, request: &StudyRequest) -> Result<StudyConversionResult, PipelineFailure> {
        let span = info_span!(
            "study_conversion",
            study_uid = field::Empty,
            slides = request.slides.len()
        );
        self.execute(request).instrument(span).await
    }

    async fn execute(&self, request: &StudyRequest) -> Result<StudyConversionResult, PipelineFailure> {
        // ----- Validating -----
        request.validate().map_err(PipelineFailure::at(Stage::Validating))?;
        let builder = MetadataBuilder::for_request(request);
        let study_uid = builder.study_instance_uid().to_string();
        Span::current().record("study_uid", study_uid.as_str());
        info!("request validated");

        // ----- Resolving -----
        let key = archive_key(&study_uid);
        let inputs = self
            .resolve(request, &key)
            .await
            .map_err(PipelineFailure::at(Stage::Resolving))?;
        info!(assets = inputs.len(), "assets resolved");

        let scratch = tempfile::Builder::new()
            .prefix("wsi-study-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| scratch_failure(Stage::Resolving, e))?;

        // ----- Converting -----
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut series = Vec::with_capacity(inputs.len());
        for (index, (slide, raw)) in request.slides.iter().zip(&inputs).enumerate() {
            let stage = Stage::Converting { slide: index };
            let output_dir = scratch.path().join(format!("series-{index}"));

            let (format, strategy, series_uid) = self
                .convert_slide(request, &builder, index, raw, scratch.path(), &output_dir)
                .await
                .map_err(PipelineFailure::at(stage))?;

            outputs.push(output_dir);
            series.push(SeriesResult {
                wsi_id: slide.wsi_id.clone(),
                series_instance_uid: series_uid,
                format,
                strategy,
                number_of_instances: 0,
            });
        }

        // ----- Packaging -----
        let archive_path = scratch.path().join(&key);
        let summary = {
            let outputs = outputs.clone();
            let archive_path = archive_path.clone();
            tokio::task::spawn_blocking(move || package_outputs(&outputs, &archive_path))
                .await
                .map_err(|e| scratch_failure(Stage::Packaging, e))?
                .map_err(|e| PipelineFailure::at(Stage::Packaging)(e.into()))?
        };
        let counts = series.iter_mut().zip(&summary.per_slide);
        for (index, (result, count)) in counts.enumerate() {
            if *count == 0 {
                warn!(slide = index, wsi_id = %result.wsi_id, "engine wrote no instances");
                return Err(PipelineFailure::at(Stage::Converting { slide: index })(
                    ConversionError::NoInstances.into(),
                ));
            }
            result.number_of_instances = *count;
        }

        // ----- Uploading -----
        let outcome = self
            .stores
            .dicoms
            .put_file(&key, &archive_path)
            .await
            .map_err(|e| PipelineFailure::at(Stage::Uploading)(e.into()))?;
        if outcome == PutOutcome::AlreadyPresent {
            return Err(PipelineFailure::at(Stage::Uploading)(PipelineError::Storage(
                StoreError::Io {
                    store: self.stores.dicoms.name().to_string(),
                    message: format!("archive {key} was written concurrently"),
                },
            )));
        }

        let patient_id = request.patient_id().unwrap_or_default();
        let result = StudyConversionResult {
            study_orthanc_id: study_identity_hash(patient_id, &study_uid),
            study_instance_uid: study_uid,
            number_of_instances: summary.instances(),
            series,
        };
        info!(
            key = %key,
            instances = result.number_of_instances,
            "study archive stored"
        );
        Ok(result)
    }

    /// Stored path of every slide, in request order.
    async fn resolve(&self, request: &StudyRequest, archive_key: &str) -> Result<Vec<PathBuf>, PipelineError> {
        if request.supplied_study_uid().is_some() && self.stores.dicoms.exists(archive_key).await? {
            return Err(PipelineError::Validation(format!(
                "an archive for study {} already exists",
                archive_key.trim_end_matches(".zip")
            )));
        }

        let mut inputs = Vec::with_capacity(request.slides.len());
        for slide in &request.slides {
            let not_found = || PipelineError::AssetNotFound {
                wsi_id: slide.wsi_id.clone(),
            };
            match self.stores.wsi.exists(&slide.wsi_id).await {
                Ok(true) => inputs.push(self.stores.wsi.path(&slide.wsi_id)?),
                Ok(false) | Err(StoreError::InvalidKey(_)) => return Err(not_found()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inputs)
    }

    /// Normalize, detect, select, build tags, convert.
    async fn convert_slide(
        &self,
        request: &StudyRequest,
        builder: &MetadataBuilder,
        index: usize,
        raw: &Path,
        scratch: &Path,
        output_dir: &Path,
    ) -> Result<(FormatTag, StrategyKind, String), PipelineError> {
        let slide = &request.slides[index];

        // Extracted data is released when `input` drops at the end of this call.
        let input = normalize(raw, scratch)
            .await
            .map_err(|e| extract_failure(&slide.wsi_id, e))?;

        let format = detect_format(input.path())
            .await
            .ok_or_else(|| PipelineError::UnsupportedFormat {
                wsi_id: slide.wsi_id.clone(),
            })?;
        let strategy = select(format);
        let tags = builder.build(&request.dicom_tags_study, &slide.dicom_tags_series)?;

        info!(
            slide = index,
            wsi_id = %slide.wsi_id,
            format = %format,
            strategy = %strategy,
            series_uid = %tags.series_instance_uid,
            "converting slide"
        );
        self.dicomizers
            .for_kind(strategy)
            .convert(&tags, input.path(), output_dir)
            .await?;

        Ok((format, strategy, tags.series_instance_uid))
    }
}

fn extract_failure(wsi_id: &str, err: ExtractError) -> PipelineError {
    match err {
        ExtractError::NoUsableSlideFound(_) | ExtractError::Corrupt { .. } => {
            warn!(wsi_id, error = %err, "archive normalization failed");
            PipelineError::NoUsableSlideFound {
                wsi_id: wsi_id.to_string(),
            }
        }
        ExtractError::Io(message) => PipelineError::Storage(StoreError::Io {
            store: "scratch".to_string(),
            message,
        }),
    }
}

fn scratch_failure(stage: Stage, err: impl fmt::Display) -> PipelineFailure {
    PipelineFailure {
        stage,
        error: PipelineError::Storage(StoreError::Io {
            store: "scratch".to_string(),
            message: err.to_string(),
        }),
    }
}

// =============================================================================
// Retrieval
// =============================================================================

/// Local path of a stored study archive.
///
/// `id` is a Study Instance UID, or the id of an older single-slide archive.
pub async fn fetch_study_archive(stores: &Stores, id: &str) -> Result<PathBuf, AssetError> {
    let key = archive_key(id);
    match stores.dicoms.exists(&key).await {
        Ok(true) => Ok(stores.dicoms.path(&key)?),
        Ok(false) | Err(StoreError::InvalidKey(_)) => Err(AssetError::NotFound { id: id.to_string() }),
        Err(e) => Err(e.into()),
    }
}
