//! # WSI Dicomizer
//!
//! Converts Whole Slide Images (WSI) into DICOM studies.
//!
//! Slides are stored content addressed, classified by format, converted by
//! one of two engines, and packaged per study into a single archive whose
//! instances share one Study Instance UID.
//!
//! ## Features
//!
//! - **Content-addressed storage**: idempotent, race-safe put-if-absent uploads
//! - **Format detection**: Aperio, Hamamatsu, Leica, MIRAX, Philips, Trestle,
//!   Ventana, generic tiled TIFF, and iSyntax
//! - **Two conversion engines**: an external converter process or a WSI
//!   library, selected per format behind one interface
//! - **Multi-slide studies**: shared Study UID, fresh Series UID per slide,
//!   collision-free flat archives
//!
//! ## Architecture
//!
//! - [`store`] - Blob Store trait and filesystem backend
//! - [`asset`] - slide ingestion and lookup
//! - [`mod@format`] - TIFF parsing and format detection
//! - [`metadata`] - study requests, tag sets, UIDs
//! - [`dicomizer`] - conversion engines and their selection
//! - [`archive`] - archive normalization and output packaging
//! - [`pipeline`] - the study conversion state machine
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use wsi_dicomizer::{Config, StudyRequest};
//!
//! # async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = config.pipeline()?;
//! let request = StudyRequest::from_json(br#"{
//!     "dicom_tags_study": {"PatientID": "123456", "PatientName": "patientName"},
//!     "slides": [{"wsi_id": "4f2a.svs", "dicom_tags_series": {}}]
//! }"#)?;
//!
//! let result = pipeline.run(&request).await?;
//! println!("{} instances in {}", result.number_of_instances, result.study_instance_uid);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod asset;
pub mod config;
pub mod dicomizer;
pub mod error;
pub mod format;
pub mod io;
pub mod metadata;
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use asset::{
    delete_asset, describe_asset, ingest_file, ingest_upload, AssetDescription, AssetLocation,
    WsiAsset,
};
pub use config::{Cli, Command, Config};
pub use dicomizer::{
    select, Dicomizer, DicomizerSet, LibraryBridge, LibraryDicomizer, StrategyKind,
    SubprocessDicomizer, WsiLibrary,
};
pub use error::{
    AssetError, ConversionError, ErrorClass, ExtractError, IoError, PipelineError, StoreError,
    TiffError,
};
pub use format::{detect_format, FormatTag};
pub use metadata::{generate_uid, study_identity_hash, DicomTagSet, MetadataBuilder, StudyRequest};
pub use pipeline::{fetch_study_archive, PipelineFailure, Stage, StudyConversionResult, StudyPipeline};
pub use store::{BlobStore, FsBlobStore, PutOutcome, Stores};
