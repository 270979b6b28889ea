//! Conversion through an external converter executable.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::ConversionError;
use crate::metadata::DicomTagSet;

use super::{process, Dicomizer, StrategyKind};

/// Pyramid levels the converter is asked to produce.
const LEVELS: u32 = 6;

/// JPEG quality passed to the converter.
const JPEG_QUALITY: u32 = 100;

/// How to run the external converter.
#[derive(Debug, Clone)]
pub struct SubprocessSettings {
    /// Converter executable
    pub executable: PathBuf,

    /// OpenSlide shared library handed to the converter
    pub openslide: PathBuf,

    /// Value of `--max-size`
    pub max_size: u32,

    /// Kill the converter after this long
    pub timeout: Duration,

    /// Where the transient tag file is written
    pub scratch_dir: PathBuf,
}

/// Runs the converter once per slide.
///
/// The tag set is written to a transient JSON file passed as `--dataset`.
#[derive(Debug, Clone)]
pub struct SubprocessDicomizer {
    settings: SubprocessSettings,
}

impl SubprocessDicomizer {
    pub fn new(settings: SubprocessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SubprocessSettings {
        &self.settings
    }

    /// Full argument vector, excluding the program itself.
    pub fn arguments(&self, input: &Path, tag_file: &Path, output_dir: &Path) -> Vec<OsString> {
        let mut openslide = OsString::from("--openslide=");
        openslide.push(&self.settings.openslide);
        let mut dataset = OsString::from("--dataset=");
        dataset.push(tag_file);

        vec![
            openslide,
            "--compression=jpeg".into(),
            format!("--jpeg-quality={JPEG_QUALITY}").into(),
            input.into(),
            dataset,
            "--folder".into(),
            output_dir.into(),
            "--force-openslide".into(),
            "1".into(),
            format!("--max-size={}", self.settings.max_size).into(),
            format!("--levels={LEVELS}").into(),
            "--smooth=1".into(),
        ]
    }

    fn program_name(&self) -> String {
        self.settings
            .executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.settings.executable.display().to_string())
    }
}

#[async_trait]
impl Dicomizer for SubprocessDicomizer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Subprocess
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

        // Removed when dropped, on every exit path.
        let tag_file = write_tag_file(tags, &self.settings.scratch_dir)?;

        let mut command = Command::new(&self.settings.executable);
        command.args(self.arguments(input, tag_file.path(), output_dir));

        let program = self.program_name();
        info!(
            program = %program,
            input = %input.display(),
            series_uid = %tags.series_instance_uid,
            "running external converter"
        );
        process::run(&program, command, self.settings.timeout).await?;
        Ok(())
    }
}

fn write_tag_file(tags: &DicomTagSet, dir: &Path) -> Result<tempfile::NamedTempFile, ConversionError> {
    let io = |e: std::io::Error| ConversionError::Io(format!("tag file: {e}"));

    let mut file = tempfile::Builder::new()
        .prefix("dataset-")
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(io)?;
    serde_json::to_writer(file.as_file_mut(), &tags.to_dataset())
        .map_err(|e| ConversionError::Io(format!("tag file: {e}")))?;
    file.as_file_mut().flush().map_err(io)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBuilder;
    use serde_json::json;

    fn settings(executable: &str) -> SubprocessSettings {
        SubprocessSettings {
            executable: PathBuf::from(executable),
            openslide: PathBuf::from("/opt/lib/libopenslide.so.1"),
            max_size: 10,
            timeout: Duration::from_secs(10),
            scratch_dir: std::env::temp_dir(),
        }
    }

    fn tag_set() -> DicomTagSet {
        let study = json!({"PatientID": "123456", "PatientName": "patientName"});
        MetadataBuilder::with_study_uid("1.2.3")
            .build(study.as_object().unwrap(), &Default::default())
            .unwrap()
    }

    #[test]
    fn test_argument_vector() {
        let dicomizer = SubprocessDicomizer::new(settings("/opt/bin/OrthancWSIDicomizer"));
        let args = dicomizer.arguments(
            Path::new("/in/slide.ndpi"),
            Path::new("/tmp/dataset.json"),
            Path::new("/out/0"),
        );
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--openslide=/opt/lib/libopenslide.so.1",
                "--compression=jpeg",
                "--jpeg-quality=100",
                "/in/slide.ndpi",
                "--dataset=/tmp/dataset.json",
                "--folder",
                "/out/0",
                "--force-openslide",
                "1",
                "--max-size=10",
                "--levels=6",
                "--smooth=1",
            ]
        );
    }

    #[test]
    fn test_tag_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_tag_file(&tag_set(), dir.path()).unwrap();
        assert_eq!(file.path().parent(), Some(dir.path()));
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(written["PatientID"], json!("123456"));
        assert_eq!(written["StudyInstanceUID"], json!("1.2.3"));

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_converter_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dicomizer = SubprocessDicomizer::new(settings("false"));
        let err = dicomizer
            .convert(&tag_set(), Path::new("/in/slide.ndpi"), &dir.path().join("out"))
            .await
            .unwrap_err();
        match err {
            ConversionError::ExitStatus { program, code, .. } => {
                assert_eq!(program, "false");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(dir.path().join("out").is_dir());
    }

    #[tokio::test]
    async fn test_missing_converter() {
        let dir = tempfile::tempdir().unwrap();
        let dicomizer = SubprocessDicomizer::new(settings("/nonexistent/OrthancWSIDicomizer"));
        let err = dicomizer
            .convert(&tag_set(), Path::new("/in/slide.ndpi"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Launch { .. }));
    }
}
