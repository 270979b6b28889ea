//! Study conversion integration tests.
//!
//! Tests verify:
//! - Format-driven engine selection for single and multi-slide studies
//! - Shared Study UID and distinct Series UIDs across slides
//! - Collision-free flat archives in the `dicoms` store
//! - Failures stop the run at the right stage and persist nothing
//! - Invalid requests never reach a converter

use std::collections::HashSet;

use serde_json::json;

use wsi_dicomizer::dicomizer::StrategyKind;
use wsi_dicomizer::error::ErrorClass;
use wsi_dicomizer::format::FormatTag;
use wsi_dicomizer::metadata::{generate_uid, study_identity_hash};
use wsi_dicomizer::pipeline::{archive_key, fetch_study_archive, Stage};

use super::test_utils::{
    aperio_slide, generic_tiff_slide, is_zip_magic, isyntax_slide, request_from, study_request,
    zip_bytes, Harness, MockDicomizer, TiffBuilder, PATIENT_ID,
};

// =============================================================================
// Single Slide
// =============================================================================

#[tokio::test]
async fn test_aperio_slide_uses_library_engine() {
    let harness = Harness::with_dicomizers(
        MockDicomizer::new(StrategyKind::Subprocess),
        MockDicomizer::new(StrategyKind::Library).with_instances(3),
    );
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    let result = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();

    assert_eq!(harness.library.call_count(), 1);
    assert_eq!(harness.subprocess.call_count(), 0);
    assert_eq!(result.number_of_instances, 3);
    assert_eq!(result.series.len(), 1);
    assert_eq!(result.series[0].format, FormatTag::Aperio);
    assert_eq!(result.series[0].strategy, StrategyKind::Library);
    assert_eq!(result.series[0].wsi_id, id);

    assert_eq!(
        harness.stored_archives().await,
        vec![archive_key(&result.study_instance_uid)]
    );
    assert_eq!(harness.archive_entries(&result.study_instance_uid).len(), 3);
}

#[tokio::test]
async fn test_generic_tiff_uses_subprocess_engine() {
    let harness = Harness::new();
    let id = harness.ingest("slide.tif", &generic_tiff_slide()).await;

    let result = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();

    assert_eq!(harness.subprocess.call_count(), 1);
    assert_eq!(harness.library.call_count(), 0);
    assert_eq!(result.series[0].format, FormatTag::GenericTiff);
    assert_eq!(result.series[0].strategy, StrategyKind::Subprocess);
}

#[tokio::test]
async fn test_isyntax_uses_library_engine() {
    let harness = Harness::new();
    let id = harness.ingest("slide.isyntax", &isyntax_slide()).await;

    let result = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();

    assert_eq!(harness.library.call_count(), 1);
    assert_eq!(result.series[0].format, FormatTag::Isyntax);
}

#[tokio::test]
async fn test_tags_passed_to_engine() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    let result = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();

    let tags = harness.library.recorded_tags();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].patient_id, PATIENT_ID);
    assert_eq!(tags[0].patient_name, "patientName");
    assert_eq!(tags[0].study_instance_uid, result.study_instance_uid);
    assert_eq!(tags[0].series_instance_uid, result.series[0].series_instance_uid);
    assert_eq!(tags[0].image_type.to_string(), "ORIGINAL\\SECONDARY");
    assert_eq!(tags[0].series_number, 1);
    assert_eq!(
        result.study_orthanc_id,
        study_identity_hash(PATIENT_ID, &result.study_instance_uid)
    );
}

// =============================================================================
// Multiple Slides
// =============================================================================

#[tokio::test]
async fn test_two_slides_share_study_with_distinct_series() {
    let harness = Harness::with_dicomizers(
        MockDicomizer::new(StrategyKind::Subprocess).with_instances(2),
        MockDicomizer::new(StrategyKind::Library).with_instances(3),
    );
    let aperio = harness.ingest("a.svs", &aperio_slide()).await;
    let generic = harness.ingest("b.tif", &generic_tiff_slide()).await;

    // Identical overrides on both slides
    let request = request_from(json!({
        "dicom_tags_study": {"PatientID": PATIENT_ID, "PatientName": "patientName"},
        "slides": [
            {"wsi_id": aperio, "dicom_tags_series": {"SeriesDescription": "HE", "SeriesNumber": 4}},
            {"wsi_id": generic, "dicom_tags_series": {"SeriesDescription": "HE", "SeriesNumber": 4}},
        ],
    }));

    let result = harness.pipeline.run(&request).await.unwrap();

    assert_eq!(result.series.len(), 2);
    assert_ne!(
        result.series[0].series_instance_uid,
        result.series[1].series_instance_uid
    );
    assert_eq!(result.series[0].number_of_instances, 3);
    assert_eq!(result.series[1].number_of_instances, 2);
    assert_eq!(result.number_of_instances, 5);

    let library_tags = harness.library.recorded_tags();
    let subprocess_tags = harness.subprocess.recorded_tags();
    assert_eq!(library_tags[0].study_instance_uid, result.study_instance_uid);
    assert_eq!(subprocess_tags[0].study_instance_uid, result.study_instance_uid);
    assert_eq!(library_tags[0].series_description, "HE");
    assert_eq!(subprocess_tags[0].series_number, 4);

    // One archive, every entry unique and flat despite colliding output names
    assert_eq!(harness.stored_archives().await.len(), 1);
    let entries = harness.archive_entries(&result.study_instance_uid);
    assert_eq!(entries.len(), 5);
    let unique: HashSet<&String> = entries.iter().collect();
    assert_eq!(unique.len(), 5);
    for name in &entries {
        assert!(!name.contains('/'), "entry {} is not flat", name);
        assert!(name.ends_with(".dcm"));
    }
}

#[tokio::test]
async fn test_same_asset_twice_gets_two_series() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    let result = harness
        .pipeline
        .run(&study_request(&[id.as_str(), id.as_str()]))
        .await
        .unwrap();

    assert_eq!(harness.library.call_count(), 2);
    assert_ne!(
        result.series[0].series_instance_uid,
        result.series[1].series_instance_uid
    );
    assert_eq!(harness.archive_entries(&result.study_instance_uid).len(), 2);
}

#[tokio::test]
async fn test_supplied_uids_are_honoured() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;
    let study_uid = generate_uid();
    let series_uid = generate_uid();

    let request = request_from(json!({
        "dicom_tags_study": {
            "PatientID": PATIENT_ID,
            "PatientName": "patientName",
            "StudyInstanceUID": study_uid,
        },
        "slides": [{"wsi_id": id, "dicom_tags_series": {"SeriesInstanceUID": series_uid}}],
    }));

    let result = harness.pipeline.run(&request).await.unwrap();
    assert_eq!(result.study_instance_uid, study_uid);
    assert_eq!(result.series[0].series_instance_uid, series_uid);

    // A second run for the same study must not replace the stored archive
    let failure = harness.pipeline.run(&request).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Resolving);
    assert_eq!(failure.error.kind(), "validation_error");
    assert_eq!(harness.library.call_count(), 1);
}

#[tokio::test]
async fn test_generated_study_uids_differ_between_runs() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;
    let request = study_request(&[id.as_str()]);

    let first = harness.pipeline.run(&request).await.unwrap();
    let second = harness.pipeline.run(&request).await.unwrap();

    assert_ne!(first.study_instance_uid, second.study_instance_uid);
    assert_eq!(harness.stored_archives().await.len(), 2);
}

// =============================================================================
// Archive Inputs
// =============================================================================

#[tokio::test]
async fn test_directory_slide_upload_converts() {
    let harness = Harness::new();
    let upload = zip_bytes(&[
        ("CMU-1.mrxs", b"[GENERAL]\n"),
        ("CMU-1/", b""),
        ("CMU-1/Slidedat.ini", b"[GENERAL]\nSLIDE_VERSION=01.02\n"),
        ("CMU-1/Data0000.dat", b"tiles"),
    ]);
    let assets = harness.upload("CMU-1.zip", &upload).await;
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].format, Some(FormatTag::Mirax));

    let result = harness
        .pipeline
        .run(&study_request(&[assets[0].id.as_str()]))
        .await
        .unwrap();

    assert_eq!(result.series[0].format, FormatTag::Mirax);
    assert_eq!(result.series[0].strategy, StrategyKind::Subprocess);

    let inputs = harness.subprocess.recorded_inputs();
    assert_eq!(inputs[0].file_name().unwrap(), "CMU-1.mrxs");
}

#[tokio::test]
async fn test_archive_with_only_index_file() {
    let harness = Harness::new();
    let upload = zip_bytes(&[("CMU-1.mrxs", b"[GENERAL]\n")]);
    harness
        .stores
        .wsi
        .put_bytes("0d9f3c.zip", upload.into())
        .await
        .unwrap();

    let failure = harness
        .pipeline
        .run(&study_request(&["0d9f3c.zip"]))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Converting { slide: 0 });
    assert_eq!(failure.error.kind(), "no_usable_slide_found");
    assert_eq!(failure.error.class(), ErrorClass::Client);
    assert_eq!(harness.total_calls(), 0);
    assert!(harness.stored_archives().await.is_empty());
}

#[tokio::test]
async fn test_zip_holding_single_slide() {
    let harness = Harness::new();
    let svs = aperio_slide();
    let upload = zip_bytes(&[("readme.txt", b"notes"), ("slide.svs", &svs)]);
    harness
        .stores
        .wsi
        .put_bytes("5be1.zip", upload.into())
        .await
        .unwrap();

    let result = harness.pipeline.run(&study_request(&["5be1.zip"])).await.unwrap();

    assert_eq!(result.series[0].format, FormatTag::Aperio);
    assert_eq!(harness.library.call_count(), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_missing_asset() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    let failure = harness
        .pipeline
        .run(&study_request(&[id.as_str(), "doesnotexist.svs"]))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Resolving);
    assert_eq!(failure.error.kind(), "asset_not_found");
    assert!(failure.error.to_string().contains("doesnotexist.svs"));
    assert_eq!(harness.total_calls(), 0);
    assert!(harness.stored_archives().await.is_empty());
}

#[tokio::test]
async fn test_invalid_image_type_never_converts() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    let request = request_from(json!({
        "dicom_tags_study": {
            "PatientID": PATIENT_ID,
            "PatientName": "patientName",
            "ImageType": "ORIGINAL",
        },
        "slides": [{"wsi_id": id, "dicom_tags_series": {}}],
    }));

    let failure = harness.pipeline.run(&request).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Validating);
    assert_eq!(failure.error.kind(), "validation_error");
    assert_eq!(harness.total_calls(), 0);
    assert!(harness.stored_archives().await.is_empty());
}

#[tokio::test]
async fn test_empty_slide_list_rejected() {
    let harness = Harness::new();

    let failure = harness.pipeline.run(&study_request(&[])).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Validating);
    assert_eq!(harness.total_calls(), 0);
}

#[tokio::test]
async fn test_unsupported_format() {
    let harness = Harness::new();
    let id = harness.ingest("notes.txt", b"not a slide at all").await;

    let failure = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap_err();

    assert_eq!(failure.stage, Stage::Converting { slide: 0 });
    assert_eq!(failure.error.kind(), "unsupported_format");
    assert_eq!(harness.total_calls(), 0);
}

#[tokio::test]
async fn test_untiled_tiff_is_unsupported() {
    let harness = Harness::new();
    let untiled = TiffBuilder::new().with_description("scanned page").untiled().build();
    let id = harness.ingest("page.tif", &untiled).await;

    let failure = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap_err();

    assert_eq!(failure.error.kind(), "unsupported_format");
    assert_eq!(harness.total_calls(), 0);
}

#[tokio::test]
async fn test_conversion_failure_aborts_study() {
    let harness = Harness::with_dicomizers(
        MockDicomizer::new(StrategyKind::Subprocess),
        MockDicomizer::new(StrategyKind::Library).failing(),
    );
    let generic = harness.ingest("a.tif", &generic_tiff_slide()).await;
    let aperio = harness.ingest("b.svs", &aperio_slide()).await;

    let failure = harness
        .pipeline
        .run(&study_request(&[generic.as_str(), aperio.as_str()]))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Converting { slide: 1 });
    assert_eq!(failure.error.kind(), "conversion_failed");
    assert_eq!(failure.error.class(), ErrorClass::Server);
    assert_eq!(harness.subprocess.call_count(), 1);
    assert_eq!(harness.library.call_count(), 1);
    assert!(harness.stored_archives().await.is_empty());
}

#[tokio::test]
async fn test_empty_conversion_output_aborts_study() {
    let harness = Harness::with_dicomizers(
        MockDicomizer::new(StrategyKind::Subprocess),
        MockDicomizer::new(StrategyKind::Library).with_instances(0),
    );
    let generic = harness.ingest("a.tif", &generic_tiff_slide()).await;
    let aperio = harness.ingest("b.svs", &aperio_slide()).await;

    let failure = harness
        .pipeline
        .run(&study_request(&[generic.as_str(), aperio.as_str()]))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Converting { slide: 1 });
    assert_eq!(failure.error.kind(), "conversion_failed");
    assert_eq!(harness.library.call_count(), 1);
    assert!(harness.stored_archives().await.is_empty());
}

#[tokio::test]
async fn test_scratch_cleaned_after_runs() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;

    harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();
    harness
        .pipeline
        .run(&study_request(&["missing.svs"]))
        .await
        .unwrap_err();

    let scratch = harness.root.path().join("scratch");
    assert_eq!(std::fs::read_dir(scratch).unwrap().count(), 0);
}

// =============================================================================
// Retrieval
// =============================================================================

#[tokio::test]
async fn test_fetch_after_conversion() {
    let harness = Harness::new();
    let id = harness.ingest("slide.svs", &aperio_slide()).await;
    let result = harness.pipeline.run(&study_request(&[id.as_str()])).await.unwrap();

    let path = fetch_study_archive(&harness.stores, &result.study_instance_uid)
        .await
        .unwrap();
    assert!(is_zip_magic(&std::fs::read(&path).unwrap()));

    let missing = fetch_study_archive(&harness.stores, &generate_uid()).await;
    assert!(missing.is_err());
}
