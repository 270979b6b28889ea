//! Study requests and DICOM tag sets.
//!
//! A [`StudyRequest`] carries loosely typed study-level tags plus one entry
//! per slide with series-level overrides. [`MetadataBuilder`] merges the two
//! (series wins), applies defaults, validates the result, and fixes the
//! identifiers: one Study Instance UID per request, a fresh Series Instance
//! UID per slide.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::PipelineError;

/// Loosely typed DICOM keyword to value mapping.
pub type TagMap = Map<String, Value>;

// =============================================================================
// Tag keywords and defaults
// =============================================================================

pub mod keys {
    pub const PATIENT_ID: &str = "PatientID";
    pub const PATIENT_NAME: &str = "PatientName";
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const STUDY_ID: &str = "StudyID";
    pub const ACCESSION_NUMBER: &str = "AccessionNumber";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SERIES_DESCRIPTION: &str = "SeriesDescription";
    pub const SERIES_NUMBER: &str = "SeriesNumber";
    pub const MANUFACTURER: &str = "Manufacturer";
    pub const IMAGE_TYPE: &str = "ImageType";
    pub const FOCUS_METHOD: &str = "FocusMethod";
    pub const EXTENDED_DEPTH_OF_FIELD: &str = "ExtendedDepthOfField";
    pub const SPECIMEN_DESCRIPTION_SEQUENCE: &str = "SpecimenDescriptionSequence";

    /// Keywords with a dedicated field in `DicomTagSet`.
    pub const KNOWN: &[&str] = &[
        PATIENT_ID,
        PATIENT_NAME,
        STUDY_INSTANCE_UID,
        STUDY_DESCRIPTION,
        STUDY_ID,
        ACCESSION_NUMBER,
        SERIES_INSTANCE_UID,
        SERIES_DESCRIPTION,
        SERIES_NUMBER,
        MANUFACTURER,
        IMAGE_TYPE,
        FOCUS_METHOD,
        EXTENDED_DEPTH_OF_FIELD,
        SPECIMEN_DESCRIPTION_SEQUENCE,
    ];
}

pub const DEFAULT_ACCESSION_NUMBER: &str = "GaelO";
pub const DEFAULT_SERIES_DESCRIPTION: &str = "";
pub const DEFAULT_SERIES_NUMBER: u32 = 1;
pub const DEFAULT_FOCUS_METHOD: &str = "AUTO";
pub const DEFAULT_EXTENDED_DEPTH_OF_FIELD: &str = "NO";

/// Specimen identifier used when the caller supplies no specimen sequence.
pub const PLACEHOLDER_SPECIMEN_IDENTIFIER: &str = "Specimen^Identifier";

/// Specimen UID used when the caller supplies no specimen sequence.
pub const PLACEHOLDER_SPECIMEN_UID: &str = "1.2.276.0.7230010.3.1.4.3252829876.4112.1426166133.871";

/// Root for UUID-derived UIDs (ISO/IEC 9834-8).
const UUID_UID_ROOT: &str = "2.25";

/// Maximum length of a DICOM UID.
const MAX_UID_LENGTH: usize = 64;

// =============================================================================
// Request model
// =============================================================================

/// Conversion request for one study.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyRequest {
    #[serde(default)]
    pub dicom_tags_study: TagMap,

    #[serde(default)]
    pub slides: Vec<SlideRequest>,
}

/// One slide of a study request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlideRequest {
    pub wsi_id: String,

    #[serde(default)]
    pub dicom_tags_series: TagMap,
}

impl StudyRequest {
    /// Parse a request body.
    pub fn from_json(body: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(body)
            .map_err(|e| PipelineError::Validation(format!("malformed request body: {e}")))
    }

    /// Structural checks, stopping at the first violation.
    ///
    /// Performs no I/O; asset existence is checked by the pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.slides.is_empty() {
            return Err(invalid("at least one slide is required"));
        }

        let study = &self.dicom_tags_study;
        required_text(study, keys::PATIENT_ID)?;
        required_text(study, keys::PATIENT_NAME)?;
        if study.contains_key(keys::SERIES_INSTANCE_UID) {
            return Err(invalid(
                "SeriesInstanceUID must be given per slide, not at study level",
            ));
        }
        if let Some(uid) = optional_text(study, keys::STUDY_INSTANCE_UID)? {
            validate_uid(keys::STUDY_INSTANCE_UID, &uid)?;
        }
        validate_common(study)?;

        let mut series_uids = HashSet::new();
        for (index, slide) in self.slides.iter().enumerate() {
            if slide.wsi_id.trim().is_empty() {
                return Err(invalid(format!("slide {index}: wsi_id is empty")));
            }
            let series = &slide.dicom_tags_series;
            if series.contains_key(keys::STUDY_INSTANCE_UID) {
                return Err(invalid(format!(
                    "slide {index}: StudyInstanceUID is shared by the study and cannot be overridden"
                )));
            }
            validate_common(series)?;
            if let Some(uid) = optional_text(series, keys::SERIES_INSTANCE_UID)? {
                validate_uid(keys::SERIES_INSTANCE_UID, &uid)?;
                if !series_uids.insert(uid.clone()) {
                    return Err(invalid(format!(
                        "slide {index}: SeriesInstanceUID {uid} is used by another slide"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Study Instance UID supplied by the caller, if any.
    pub fn supplied_study_uid(&self) -> Option<&str> {
        self.dicom_tags_study
            .get(keys::STUDY_INSTANCE_UID)
            .and_then(Value::as_str)
    }

    /// Study-level PatientID.
    pub fn patient_id(&self) -> Option<&str> {
        self.dicom_tags_study
            .get(keys::PATIENT_ID)
            .and_then(Value::as_str)
    }
}

/// Checks shared by study-level tags and series overrides.
///
/// A null value counts as absent and falls back to the default.
fn validate_common(tags: &TagMap) -> Result<(), PipelineError> {
    let present = |key: &str| tags.get(key).filter(|value| !value.is_null());

    if let Some(value) = present(keys::IMAGE_TYPE) {
        ImageType::from_value(value)?;
    }
    if let Some(value) = present(keys::SERIES_NUMBER) {
        series_number(value)?;
    }
    if let Some(value) = present(keys::SPECIMEN_DESCRIPTION_SEQUENCE) {
        if !value.is_array() {
            return Err(invalid("SpecimenDescriptionSequence must be an array"));
        }
    }
    Ok(())
}

// =============================================================================
// ImageType
// =============================================================================

/// First ImageType token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDataCharacteristics {
    Original,
    Derived,
}

/// Second ImageType token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientExaminationCharacteristics {
    Primary,
    Secondary,
}

/// Two-token ImageType code, written `ORIGINAL\SECONDARY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageType {
    pub pixel_data: PixelDataCharacteristics,
    pub examination: PatientExaminationCharacteristics,
}

impl Default for ImageType {
    fn default() -> Self {
        Self {
            pixel_data: PixelDataCharacteristics::Original,
            examination: PatientExaminationCharacteristics::Secondary,
        }
    }
}

impl ImageType {
    /// Accepts the backslash-separated string or a two-element array.
    pub fn from_value(value: &Value) -> Result<Self, PipelineError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Array(items) => {
                let tokens: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
                match tokens {
                    Some(tokens) => Self::from_tokens(&tokens),
                    None => Err(invalid("ImageType tokens must be strings")),
                }
            }
            _ => Err(invalid("ImageType must be a string")),
        }
    }

    fn from_tokens(tokens: &[&str]) -> Result<Self, PipelineError> {
        let [first, second] = tokens else {
            return Err(invalid(format!(
                "ImageType must have exactly two values, got {}",
                tokens.len()
            )));
        };
        let pixel_data = match first.trim() {
            "ORIGINAL" => PixelDataCharacteristics::Original,
            "DERIVED" => PixelDataCharacteristics::Derived,
            other => {
                return Err(invalid(format!(
                    "ImageType value 1 must be ORIGINAL or DERIVED, got '{other}'"
                )))
            }
        };
        let examination = match second.trim() {
            "PRIMARY" => PatientExaminationCharacteristics::Primary,
            "SECONDARY" => PatientExaminationCharacteristics::Secondary,
            other => {
                return Err(invalid(format!(
                    "ImageType value 2 must be PRIMARY or SECONDARY, got '{other}'"
                )))
            }
        };
        Ok(Self {
            pixel_data,
            examination,
        })
    }
}

impl FromStr for ImageType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split('\\').collect();
        Self::from_tokens(&tokens)
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = match self.pixel_data {
            PixelDataCharacteristics::Original => "ORIGINAL",
            PixelDataCharacteristics::Derived => "DERIVED",
        };
        let second = match self.examination {
            PatientExaminationCharacteristics::Primary => "PRIMARY",
            PatientExaminationCharacteristics::Secondary => "SECONDARY",
        };
        write!(f, "{first}\\{second}")
    }
}

// =============================================================================
// DicomTagSet
// =============================================================================

/// Canonical tag set for one slide conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct DicomTagSet {
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_description: Option<String>,
    pub study_id: Option<String>,
    pub accession_number: String,
    pub series_instance_uid: String,
    pub series_description: String,
    pub series_number: u32,
    pub manufacturer: Option<String>,
    pub image_type: ImageType,
    pub focus_method: String,
    pub extended_depth_of_field: String,
    pub specimen_description_sequence: Vec<Value>,

    /// Caller-supplied keywords without a dedicated field, passed through
    pub extra: TagMap,
}

impl DicomTagSet {
    /// Keyword-keyed dataset as written to a converter's tag file.
    pub fn to_dataset(&self) -> TagMap {
        let mut dataset = self.extra.clone();
        let mut put = |key: &str, value: Value| {
            dataset.insert(key.to_string(), value);
        };

        put(keys::PATIENT_ID, json!(self.patient_id));
        put(keys::PATIENT_NAME, json!(self.patient_name));
        put(keys::STUDY_INSTANCE_UID, json!(self.study_instance_uid));
        if let Some(description) = &self.study_description {
            put(keys::STUDY_DESCRIPTION, json!(description));
        }
        if let Some(study_id) = &self.study_id {
            put(keys::STUDY_ID, json!(study_id));
        }
        put(keys::ACCESSION_NUMBER, json!(self.accession_number));
        put(keys::SERIES_INSTANCE_UID, json!(self.series_instance_uid));
        put(keys::SERIES_DESCRIPTION, json!(self.series_description));
        put(keys::SERIES_NUMBER, json!(self.series_number.to_string()));
        if let Some(manufacturer) = &self.manufacturer {
            put(keys::MANUFACTURER, json!(manufacturer));
        }
        put(keys::IMAGE_TYPE, json!(self.image_type.to_string()));
        put(keys::FOCUS_METHOD, json!(self.focus_method));
        put(keys::EXTENDED_DEPTH_OF_FIELD, json!(self.extended_depth_of_field));
        put(
            keys::SPECIMEN_DESCRIPTION_SEQUENCE,
            Value::Array(self.specimen_description_sequence.clone()),
        );

        dataset
    }
}

/// Specimen sequence injected when the caller supplies none.
pub fn placeholder_specimen_sequence() -> Vec<Value> {
    vec![json!({
        "SpecimenIdentifier": PLACEHOLDER_SPECIMEN_IDENTIFIER,
        "SpecimenUID": PLACEHOLDER_SPECIMEN_UID,
        "IssuerOfTheSpecimenIdentifierSequence": [],
        "SpecimenPreparationSequence": []
    })]
}

// =============================================================================
// MetadataBuilder
// =============================================================================

/// Builds per-slide tag sets that share one Study Instance UID.
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    study_instance_uid: String,
}

impl MetadataBuilder {
    /// Use the caller's Study Instance UID if supplied, otherwise a new one.
    pub fn for_request(request: &StudyRequest) -> Self {
        let study_instance_uid = request
            .supplied_study_uid()
            .map(str::to_string)
            .unwrap_or_else(generate_uid);
        Self { study_instance_uid }
    }

    pub fn with_study_uid(study_instance_uid: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
        }
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.study_instance_uid
    }

    /// Merge study tags with one slide's overrides into a tag set.
    pub fn build(&self, study: &TagMap, series: &TagMap) -> Result<DicomTagSet, PipelineError> {
        let mut merged = study.clone();
        merged.extend(series.iter().map(|(k, v)| (k.clone(), v.clone())));

        let image_type = match merged.get(keys::IMAGE_TYPE) {
            Some(value) if !value.is_null() => ImageType::from_value(value)?,
            _ => ImageType::default(),
        };
        let series_number = match merged.get(keys::SERIES_NUMBER) {
            Some(value) if !value.is_null() => series_number(value)?,
            _ => DEFAULT_SERIES_NUMBER,
        };
        let series_instance_uid = optional_text(&merged, keys::SERIES_INSTANCE_UID)?
            .unwrap_or_else(generate_uid);
        let specimen_description_sequence = match merged.get(keys::SPECIMEN_DESCRIPTION_SEQUENCE) {
            Some(Value::Array(items)) if !items.is_empty() => items.clone(),
            _ => placeholder_specimen_sequence(),
        };

        let extra = merged
            .iter()
            .filter(|(k, _)| !keys::KNOWN.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(DicomTagSet {
            patient_id: required_text(&merged, keys::PATIENT_ID)?,
            patient_name: required_text(&merged, keys::PATIENT_NAME)?,
            study_instance_uid: self.study_instance_uid.clone(),
            study_description: optional_text(&merged, keys::STUDY_DESCRIPTION)?,
            study_id: optional_text(&merged, keys::STUDY_ID)?,
            accession_number: optional_text(&merged, keys::ACCESSION_NUMBER)?
                .unwrap_or_else(|| DEFAULT_ACCESSION_NUMBER.to_string()),
            series_instance_uid,
            series_description: optional_text(&merged, keys::SERIES_DESCRIPTION)?
                .unwrap_or_else(|| DEFAULT_SERIES_DESCRIPTION.to_string()),
            series_number,
            manufacturer: optional_text(&merged, keys::MANUFACTURER)?,
            image_type,
            focus_method: optional_text(&merged, keys::FOCUS_METHOD)?
                .unwrap_or_else(|| DEFAULT_FOCUS_METHOD.to_string()),
            extended_depth_of_field: optional_text(&merged, keys::EXTENDED_DEPTH_OF_FIELD)?
                .unwrap_or_else(|| DEFAULT_EXTENDED_DEPTH_OF_FIELD.to_string()),
            specimen_description_sequence,
            extra,
        })
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// New globally unique UID of the form `2.25.<uuid as decimal>`.
pub fn generate_uid() -> String {
    format!("{UUID_UID_ROOT}.{}", Uuid::new_v4().as_u128())
}

/// Whether `uid` is a syntactically valid DICOM UID.
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= MAX_UID_LENGTH
        && uid.split('.').all(|component| {
            !component.is_empty()
                && component.bytes().all(|b| b.is_ascii_digit())
                && (component == "0" || !component.starts_with('0'))
        })
}

/// Stable correlation key for a study: the SHA-1 of `PatientID|StudyInstanceUID`
/// as five hyphen-separated groups of eight hex digits.
pub fn study_identity_hash(patient_id: &str, study_instance_uid: &str) -> String {
    let digest = Sha1::digest(format!("{patient_id}|{study_instance_uid}").as_bytes());
    let hex = hex::encode(digest);
    hex.as_bytes()
        .chunks(8)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

// =============================================================================
// Value helpers
// =============================================================================

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation(message.into())
}

/// Scalar value as text; `None` for null or absent.
fn optional_text(tags: &TagMap, key: &str) -> Result<Option<String>, PipelineError> {
    match tags.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(invalid(format!("{key} must be a scalar value"))),
    }
}

fn required_text(tags: &TagMap, key: &str) -> Result<String, PipelineError> {
    match optional_text(tags, key)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(invalid(format!("{key} is required"))),
    }
}

fn series_number(value: &Value) -> Result<u32, PipelineError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(format!("SeriesNumber must be a non-negative integer, got {value}")))
}

fn validate_uid(key: &str, uid: &str) -> Result<(), PipelineError> {
    if is_valid_uid(uid) {
        Ok(())
    } else {
        Err(invalid(format!("{key} '{uid}' is not a valid UID")))
    }
}
