//! Test utilities for integration tests.
//!
//! This module provides mock dicomizers that record their invocations, a
//! store-plus-pipeline harness rooted in a temporary directory, and helpers
//! for building slide files and upload archives.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use wsi_dicomizer::dicomizer::{Dicomizer, DicomizerSet, StrategyKind};
use wsi_dicomizer::error::ConversionError;
use wsi_dicomizer::metadata::{DicomTagSet, StudyRequest};
use wsi_dicomizer::pipeline::{archive_key, StudyPipeline};
use wsi_dicomizer::store::Stores;
use wsi_dicomizer::{ingest_file, ingest_upload, WsiAsset};

// =============================================================================
// Mock Dicomizer with Invocation Tracking
// =============================================================================

/// A dicomizer that writes placeholder instances instead of converting.
///
/// Every run writes files named `instance-0.dcm`, `instance-1.dcm`, ... so
/// outputs of different slides always collide by name.
pub struct MockDicomizer {
    kind: StrategyKind,
    instances: usize,
    fail: bool,
    call_count: AtomicUsize,
    calls: Mutex<Vec<(DicomTagSet, PathBuf)>>,
}

impl MockDicomizer {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            instances: 1,
            fail: false,
            call_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of instance files each run writes.
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    /// Fail every run with a non-zero exit status.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Tag sets received so far, in call order.
    pub fn recorded_tags(&self) -> Vec<DicomTagSet> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(tags, _)| tags.clone())
            .collect()
    }

    /// Input paths received so far, in call order.
    pub fn recorded_inputs(&self) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, input)| input.clone())
            .collect()
    }
}

#[async_trait]
impl Dicomizer for MockDicomizer {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn convert(
        &self,
        tags: &DicomTagSet,
        input: &Path,
        output_dir: &Path,
    ) -> Result<(), ConversionError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((tags.clone(), input.to_path_buf()));

        if self.fail {
            return Err(ConversionError::ExitStatus {
                program: "mock-converter".to_string(),
                code: Some(1),
                stderr: "cannot open slide".to_string(),
            });
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ConversionError::Io(e.to_string()))?;
        for i in 0..self.instances {
            let body = format!("DICM {} {}", tags.series_instance_uid, i);
            tokio::fs::write(output_dir.join(format!("instance-{i}.dcm")), body)
                .await
                .map_err(|e| ConversionError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Pipeline Harness
// =============================================================================

/// Stores, mock engines and a pipeline sharing one temporary root.
pub struct Harness {
    pub root: TempDir,
    pub stores: Stores,
    pub subprocess: Arc<MockDicomizer>,
    pub library: Arc<MockDicomizer>,
    pub pipeline: StudyPipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_dicomizers(
            MockDicomizer::new(StrategyKind::Subprocess),
            MockDicomizer::new(StrategyKind::Library),
        )
    }

    pub fn with_dicomizers(subprocess: MockDicomizer, library: MockDicomizer) -> Self {
        let root = tempfile::tempdir().unwrap();
        let stores = Stores::under(root.path().join("storage")).unwrap();
        let scratch = root.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::create_dir_all(root.path().join("uploads")).unwrap();

        let subprocess = Arc::new(subprocess);
        let library = Arc::new(library);
        let dicomizers = DicomizerSet::new(subprocess.clone(), library.clone());
        let pipeline = StudyPipeline::new(stores.clone(), dicomizers, scratch);

        Self {
            root,
            stores,
            subprocess,
            library,
            pipeline,
        }
    }

    /// Write `data` as an upload named `name`.
    pub fn upload_path(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.root.path().join("uploads").join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Store a single slide file and return its id.
    pub async fn ingest(&self, name: &str, data: &[u8]) -> String {
        let path = self.upload_path(name, data);
        ingest_file(self.stores.wsi.as_ref(), &path).await.unwrap().id
    }

    /// Store an upload through the archive-aware path.
    pub async fn upload(&self, name: &str, data: &[u8]) -> Vec<WsiAsset> {
        let path = self.upload_path(name, data);
        ingest_upload(self.stores.wsi.as_ref(), &path).await.unwrap()
    }

    pub fn total_calls(&self) -> usize {
        self.subprocess.call_count() + self.library.call_count()
    }

    /// Files currently held by the `dicoms` store.
    pub async fn stored_archives(&self) -> Vec<String> {
        self.stores.dicoms.list("").await.unwrap().files
    }

    /// Entry names of the stored archive for a study.
    pub fn archive_entries(&self, study_instance_uid: &str) -> Vec<String> {
        let path = self
            .stores
            .dicoms
            .path(&archive_key(study_instance_uid))
            .unwrap();
        zip_entry_names(&path)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Requests
// =============================================================================

pub const PATIENT_ID: &str = "123456";

/// Request with the minimal study tags and one slide per id.
pub fn study_request(wsi_ids: &[&str]) -> StudyRequest {
    let slides: Vec<Value> = wsi_ids
        .iter()
        .map(|id| serde_json::json!({"wsi_id": id, "dicom_tags_series": {}}))
        .collect();
    request_from(serde_json::json!({
        "dicom_tags_study": {"PatientID": PATIENT_ID, "PatientName": "patientName"},
        "slides": slides,
    }))
}

pub fn request_from(body: Value) -> StudyRequest {
    StudyRequest::from_json(&serde_json::to_vec(&body).unwrap()).unwrap()
}

// =============================================================================
// Slide Files
// =============================================================================

const ASCII: u16 = 2;
const LONG: u16 = 4;

const IMAGE_WIDTH: u16 = 256;
const IMAGE_LENGTH: u16 = 257;
const IMAGE_DESCRIPTION: u16 = 270;
const TILE_WIDTH: u16 = 322;
const TILE_LENGTH: u16 = 323;
const TILE_OFFSETS: u16 = 324;
const TILE_BYTE_COUNTS: u16 = 325;

/// Builder for single-IFD little-endian TIFF files.
///
/// Enough structure for format detection and pyramid inspection; tiles hold
/// no image data.
pub struct TiffBuilder {
    width: u32,
    height: u32,
    tile_size: Option<u32>,
    description: Option<Vec<u8>>,
}

impl TiffBuilder {
    pub fn new() -> Self {
        Self {
            width: 4096,
            height: 3072,
            tile_size: Some(256),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.as_bytes().to_vec());
        self
    }

    pub fn untiled(mut self) -> Self {
        self.tile_size = None;
        self
    }

    pub fn build(self) -> Vec<u8> {
        // (tag, type, count, value or offset)
        let mut entries: Vec<(u16, u16, u32, u32)> = vec![
            (IMAGE_WIDTH, LONG, 1, self.width),
            (IMAGE_LENGTH, LONG, 1, self.height),
        ];
        if let Some(tile) = self.tile_size {
            entries.push((TILE_WIDTH, LONG, 1, tile));
            entries.push((TILE_LENGTH, LONG, 1, tile));
            entries.push((TILE_OFFSETS, LONG, 1, 0));
            entries.push((TILE_BYTE_COUNTS, LONG, 1, 0));
        }
        let has_description = self.description.is_some();
        let entry_count = entries.len() + usize::from(has_description);
        let data_start = 8 + 2 + entry_count * 12 + 4;
        if let Some(description) = &self.description {
            entries.push((
                IMAGE_DESCRIPTION,
                ASCII,
                description.len() as u32,
                data_start as u32,
            ));
        }
        entries.sort_by_key(|e| e.0);

        let mut data = vec![b'I', b'I', 42, 0, 8, 0, 0, 0];
        data.extend((entries.len() as u16).to_le_bytes());
        for (tag, field_type, count, value) in entries {
            data.extend(tag.to_le_bytes());
            data.extend(field_type.to_le_bytes());
            data.extend(count.to_le_bytes());
            data.extend(value.to_le_bytes());
        }
        data.extend(0u32.to_le_bytes());
        if let Some(description) = self.description {
            data.extend(description);
        }
        data
    }
}

impl Default for TiffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An Aperio SVS slide.
pub fn aperio_slide() -> Vec<u8> {
    TiffBuilder::new()
        .with_description("Aperio Image Library v12.0.15\r\n46000x32914 [0,100 46000x32814]")
        .build()
}

/// A tiled TIFF without vendor markers.
pub fn generic_tiff_slide() -> Vec<u8> {
    TiffBuilder::new()
        .with_description("pyramid exported by vips")
        .build()
}

/// A Philips iSyntax container header.
pub fn isyntax_slide() -> Vec<u8> {
    br#"<?xml version="1.0" encoding="UTF-8"?><DataObject ObjectType="DPUfsImport"><Attribute Name="PIM_DP_UFS_INTERFACE_VERSION"/></DataObject>"#
        .to_vec()
}

// =============================================================================
// ZIP Archives
// =============================================================================

/// Build a ZIP in memory; names ending in `/` become directory entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// File entry names of a ZIP on disk, in archive order.
pub fn zip_entry_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let archive = zip::ZipArchive::new(file).unwrap();
    archive
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect()
}

/// Check if bytes start with a local file header.
pub fn is_zip_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == *b"PK\x03\x04"
}
