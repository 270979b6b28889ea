use std::path::PathBuf;

use thiserror::Error;

/// I/O errors raised while reading slide bytes from local storage
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File could not be opened or read
    #[error("File error on {path}: {message}")]
    File { path: PathBuf, message: String },
}

impl IoError {
    pub(crate) fn file(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        IoError::File {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// IFD declares more entries than we are willing to parse
    #[error("IFD entry count {0} exceeds limit")]
    TooManyEntries(u64),
}

/// Blob Store failures (server-class)
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Key does not exist in the store
    #[error("Key not found in store '{store}': {key}")]
    NotFound { store: String, key: String },

    /// Key is empty, absolute, or escapes the store root
    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    /// Underlying filesystem failure
    #[error("Storage I/O error in store '{store}': {message}")]
    Io { store: String, message: String },
}

/// Asset ingestion and lookup failures
#[derive(Debug, Clone, Error)]
pub enum AssetError {
    /// No asset is stored under this id
    #[error("Asset not found: {id}")]
    NotFound { id: String },

    /// The uploaded file could not be read
    #[error("Cannot read upload {path}: {message}")]
    Read { path: PathBuf, message: String },

    /// The uploaded ZIP could not be unpacked
    #[error("Invalid upload archive {path}: {message}")]
    Archive { path: PathBuf, message: String },

    /// Blob Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AssetError {
    pub(crate) fn read(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        AssetError::Read {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Failure of a single slide conversion (external tool or library)
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// Converter could not be started
    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    /// Converter exited with a non-zero status
    #[error("{program} exited with status {code:?}: {stderr}")]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Converter exceeded the configured deadline and was killed
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    /// Library reported an unusable result
    #[error("Library error: {0}")]
    Library(String),

    /// Engine finished without writing any DICOM instance
    #[error("No DICOM instances were written")]
    NoInstances,

    /// Local I/O failure while preparing or collecting the conversion
    #[error("I/O error: {0}")]
    Io(String),
}

/// Archive normalization failures
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// Neither a single-file slide nor an index + data directory was found
    #[error("No usable slide found in archive {0}")]
    NoUsableSlideFound(PathBuf),

    /// The archive could not be read
    #[error("Corrupt archive {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Scratch space could not be prepared
    #[error("I/O error: {0}")]
    Io(String),
}

/// Client or server responsibility for a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller supplied bad input; fixing the input and retrying may succeed
    Client,
    /// Conversion tooling or storage failed
    Server,
}

/// Study conversion failures.
///
/// Every variant aborts the whole study; nothing partial is persisted.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Missing or malformed request input
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Referenced asset is absent from its store
    #[error("Asset not found: {wsi_id}")]
    AssetNotFound { wsi_id: String },

    /// Format Detector returned Unknown
    #[error("Unsupported slide format for asset {wsi_id}")]
    UnsupportedFormat { wsi_id: String },

    /// Archive normalization found nothing convertible
    #[error("No usable slide found for asset {wsi_id}")]
    NoUsableSlideFound { wsi_id: String },

    /// Converter failed; the cause is kept for diagnostics
    #[error("Conversion failed: {0}")]
    ConversionFailed(#[from] ConversionError),

    /// Blob Store or scratch I/O failure
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PipelineError {
    /// Whether the failure is the caller's responsibility.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Validation(_)
            | PipelineError::AssetNotFound { .. }
            | PipelineError::UnsupportedFormat { .. }
            | PipelineError::NoUsableSlideFound { .. } => ErrorClass::Client,
            PipelineError::ConversionFailed(_) | PipelineError::Storage(_) => ErrorClass::Server,
        }
    }

    /// Short machine-readable identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::AssetNotFound { .. } => "asset_not_found",
            PipelineError::UnsupportedFormat { .. } => "unsupported_format",
            PipelineError::NoUsableSlideFound { .. } => "no_usable_slide_found",
            PipelineError::ConversionFailed(_) => "conversion_failed",
            PipelineError::Storage(_) => "storage_error",
        }
    }
}
