//! Slide ingestion integration tests.
//!
//! Tests verify:
//! - Uploads are keyed by content and stored once
//! - Concurrent uploads of the same bytes never clobber each other
//! - ZIP uploads split into per-file assets or stay whole for directory slides
//! - Stored assets can be described and deleted

use std::sync::Arc;

use wsi_dicomizer::asset::{delete_asset, describe_asset, ingest_file, AssetLocation};
use wsi_dicomizer::error::AssetError;
use wsi_dicomizer::format::FormatTag;
use wsi_dicomizer::store::{BlobStore, FsBlobStore, PutOutcome};

use super::test_utils::{aperio_slide, generic_tiff_slide, isyntax_slide, zip_bytes, Harness};

// =============================================================================
// Content Addressing
// =============================================================================

#[tokio::test]
async fn test_reupload_is_idempotent() {
    let harness = Harness::new();

    let first = harness.upload("slide.svs", &aperio_slide()).await;
    let second = harness.upload("slide.svs", &aperio_slide()).await;

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, second[0].id);
    assert!(first[0].newly_stored);
    assert!(!second[0].newly_stored);
    assert!(first[0].id.ends_with(".svs"));
    assert_eq!(first[0].format, Some(FormatTag::Aperio));

    let listing = harness.stores.wsi.list("").await.unwrap();
    assert_eq!(listing.files, vec![first[0].id.clone()]);
}

#[tokio::test]
async fn test_key_keeps_original_extension() {
    let harness = Harness::new();
    let data = generic_tiff_slide();

    let tif = harness.ingest("a.tif", &data).await;
    let tiff = harness.ingest("a.tiff", &data).await;

    // Same hash, different suffix
    assert_ne!(tif, tiff);
    assert_eq!(tif.trim_end_matches(".tif"), tiff.trim_end_matches(".tiff"));
    assert_eq!(tif.len(), 64 + ".tif".len());
}

#[tokio::test]
async fn test_concurrent_uploads_store_once() {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(FsBlobStore::new("wsi", root.path().join("wsi")).unwrap());
    let upload = root.path().join("slide.svs");
    std::fs::write(&upload, aperio_slide()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let upload = upload.clone();
        handles.push(tokio::spawn(async move {
            ingest_file(store.as_ref(), &upload).await.unwrap()
        }));
    }

    let mut stored = 0;
    let mut ids = Vec::new();
    for handle in handles {
        let asset = handle.await.unwrap();
        if asset.newly_stored {
            stored += 1;
        }
        ids.push(asset.id);
    }

    assert_eq!(stored, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert!(
        store.open(&ids[0]).await.is_ok(),
        "stored asset should be readable"
    );
}

#[tokio::test]
async fn test_put_if_absent_keeps_first_bytes() {
    let root = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new("dicoms", root.path()).unwrap();

    let first = store.put_bytes("1.2.3.zip", b"first".to_vec().into()).await.unwrap();
    let second = store.put_bytes("1.2.3.zip", b"second".to_vec().into()).await.unwrap();

    assert_eq!(first, PutOutcome::Stored);
    assert_eq!(second, PutOutcome::AlreadyPresent);
    let path = store.path("1.2.3.zip").unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"first");
}

// =============================================================================
// ZIP Uploads
// =============================================================================

#[tokio::test]
async fn test_zip_upload_splits_top_level_files() {
    let harness = Harness::new();
    let svs = aperio_slide();
    let isyntax = isyntax_slide();
    let upload = zip_bytes(&[
        ("a.svs", &svs),
        ("b.isyntax", &isyntax),
        ("nested/", b""),
        ("nested/ignored.svs", &svs),
    ]);

    let mut assets = harness.upload("batch.zip", &upload).await;
    assets.sort_by_key(|a| a.format.map(|f| f.name()));

    assert_eq!(assets.len(), 2);
    assert_eq!(assets[0].format, Some(FormatTag::Aperio));
    assert_eq!(assets[1].format, Some(FormatTag::Isyntax));
    assert!(assets[0].id.ends_with(".svs"));
    assert!(assets[1].id.ends_with(".isyntax"));
    for asset in &assets {
        assert!(matches!(asset.location, AssetLocation::File { .. }));
    }
}

#[tokio::test]
async fn test_directory_slide_upload_kept_whole() {
    let harness = Harness::new();
    let upload = zip_bytes(&[
        ("CMU-1.mrxs", b"[GENERAL]\n"),
        ("CMU-1/Slidedat.ini", b"[GENERAL]\n"),
        ("CMU-1/Data0000.dat", b"tiles"),
    ]);

    let assets = harness.upload("CMU-1.zip", &upload).await;

    assert_eq!(assets.len(), 1);
    assert!(assets[0].id.ends_with(".zip"));
    match &assets[0].location {
        AssetLocation::Directory {
            index, auxiliary, ..
        } => {
            assert_eq!(index, "CMU-1.mrxs");
            assert_eq!(auxiliary.len(), 2);
        }
        other => panic!("expected directory slide, got {:?}", other),
    }
}

// =============================================================================
// Inspection and Deletion
// =============================================================================

#[tokio::test]
async fn test_describe_and_delete() {
    let harness = Harness::new();
    let data = isyntax_slide();
    let id = harness.ingest("slide.isyntax", &data).await;

    let description = describe_asset(harness.stores.wsi.as_ref(), &id).await.unwrap();
    assert_eq!(description.id, id);
    assert_eq!(description.size, data.len() as u64);
    assert_eq!(description.format, Some(FormatTag::Isyntax));
    assert!(!description.archive);

    delete_asset(harness.stores.wsi.as_ref(), &id).await.unwrap();
    assert!(!harness.stores.wsi.exists(&id).await.unwrap());

    assert!(matches!(
        delete_asset(harness.stores.wsi.as_ref(), &id).await,
        Err(AssetError::NotFound { .. })
    ));
    assert!(matches!(
        describe_asset(harness.stores.wsi.as_ref(), &id).await,
        Err(AssetError::NotFound { .. })
    ));
}
