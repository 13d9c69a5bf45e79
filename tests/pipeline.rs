//! End-to-end pipeline tests: real object store, real redb catalog and
//! workflow store, real image bytes, no network.

use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;

use cyanopica::catalog::Catalog;
use cyanopica::common::PHOTOS_BUCKET;
use cyanopica::models::photo::{PhotoId, PhotoUploadInput, PreviewSize, new_photo_id};
use cyanopica::processing::image::{decode_image, encode_jpeg, scaled_height};
use cyanopica::storage::{FsObjectStore, ObjectStore};
use cyanopica::utils::original_object_name;
use cyanopica::workflow::activities::{ActivityCommand, PipelineContext, run_activity};
use cyanopica::workflow::store::WorkflowStore;
use cyanopica::workflow::{ExecutionState, RetryPolicy, StartOutcome, Worker, WorkflowEngine};

struct Harness {
    _dir: TempDir,
    store: Arc<dyn ObjectStore>,
    catalog: Arc<Catalog>,
    pipeline: Arc<PipelineContext>,
    engine: Arc<WorkflowEngine>,
    worker: Worker,
}

fn harness(policy: RetryPolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path().join("object")));
    let catalog = Arc::new(Catalog::open(dir.path().join("catalog.redb")).unwrap());
    let workflow_store = Arc::new(WorkflowStore::open(dir.path().join("workflow.redb")).unwrap());
    let pipeline = Arc::new(PipelineContext {
        store: store.clone(),
        catalog: catalog.clone(),
    });
    let engine = Arc::new(WorkflowEngine::with_policy(
        workflow_store,
        pipeline.clone(),
        policy,
    ));
    let worker = Worker::new(engine.clone(), 2);
    Harness {
        _dir: dir,
        store,
        catalog,
        pipeline,
        engine,
        worker,
    }
}

fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    });
    encode_jpeg(&DynamicImage::ImageRgb8(image)).unwrap()
}

/// Store an original and start its workflow, the way the upload receiver
/// does.
async fn ingest(harness: &Harness, name: &str, content: Vec<u8>) -> PhotoId {
    let id = new_photo_id();
    let object = original_object_name(name);
    let store = harness.store.clone();
    let object_clone = object.clone();
    tokio::task::spawn_blocking(move || {
        store
            .put_item(PHOTOS_BUCKET, id.as_str(), &object_clone, &content, "image/jpeg")
            .unwrap();
    })
    .await
    .unwrap();

    let outcome = harness
        .engine
        .start_photo_upload(PhotoUploadInput {
            photo_id: id,
            original_name: name.to_string(),
            original_object: object,
        })
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    id
}

#[tokio::test]
async fn completed_pipeline_yields_one_row_and_four_objects() {
    let harness = harness(RetryPolicy::default());
    let id = ingest(&harness, "holiday.jpg", sample_jpeg(1024, 768)).await;

    harness.worker.run_until_idle().await.unwrap();

    let record = harness.engine.photo_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.state, ExecutionState::Completed);

    // Exactly one catalog row, with the decoded dimensions and a hash.
    assert_eq!(harness.catalog.len().unwrap(), 1);
    let row = harness.catalog.get(id.as_str()).unwrap().unwrap();
    assert_eq!(row.name, "holiday.jpg");
    assert_eq!((row.width, row.height), (1024, 768));
    assert!(!row.blur_hash.is_empty());

    // Original plus all three previews.
    let items = harness.store.list_items(PHOTOS_BUCKET, id.as_str()).unwrap();
    assert_eq!(items.len(), 4);

    for size in PreviewSize::ALL {
        let item = harness
            .store
            .get_item(PHOTOS_BUCKET, id.as_str(), &size.object_name())
            .unwrap();
        let preview = decode_image(&harness.store.get_item_content(&item).unwrap()).unwrap();
        assert_eq!(preview.width(), size.target_width());
        assert_eq!(
            preview.height(),
            scaled_height(1024, 768, size.target_width())
        );
    }
}

#[tokio::test]
async fn double_start_is_deduplicated() {
    let harness = harness(RetryPolicy::default());
    let id = ingest(&harness, "dunes.jpg", sample_jpeg(640, 480)).await;

    let again = harness
        .engine
        .start_photo_upload(PhotoUploadInput {
            photo_id: id,
            original_name: "dunes.jpg".to_string(),
            original_object: "original.jpg".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(again, StartOutcome::AlreadyExists);

    harness.worker.run_until_idle().await.unwrap();
    assert_eq!(harness.catalog.len().unwrap(), 1);
}

#[tokio::test]
async fn rerunning_a_preview_activity_is_idempotent() {
    let harness = harness(RetryPolicy::default());
    let id = ingest(&harness, "ridge.jpg", sample_jpeg(800, 600)).await;
    harness.worker.run_until_idle().await.unwrap();

    let name = PreviewSize::Small.object_name();
    let item = harness
        .store
        .get_item(PHOTOS_BUCKET, id.as_str(), &name)
        .unwrap();
    let before = harness.store.get_item_content(&item).unwrap();

    // Re-deliver the same invocation, as an at-least-once queue may.
    run_activity(
        &harness.pipeline,
        ActivityCommand::GeneratePreview {
            photo_id: id,
            size: PreviewSize::Small,
            original_object: "original.jpg".to_string(),
        },
    )
    .await
    .unwrap();

    let after = harness.store.get_item_content(&item).unwrap();
    assert_eq!(before, after);
    assert_eq!(
        harness.store.list_items(PHOTOS_BUCKET, id.as_str()).unwrap().len(),
        4
    );
}

#[tokio::test]
async fn undecodable_original_fails_without_partial_state() {
    let harness = harness(RetryPolicy::immediate(3));
    let id = ingest(
        &harness,
        "broken.jpg",
        b"this is not a decodable image".to_vec(),
    )
    .await;

    harness.worker.run_until_idle().await.unwrap();

    let record = harness.engine.photo_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.state, ExecutionState::Failed);

    // No catalog row, and nothing beyond the original in storage.
    assert!(harness.catalog.get(id.as_str()).unwrap().is_none());
    let items = harness.store.list_items(PHOTOS_BUCKET, id.as_str()).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "original.jpg");

    // The queue is fully drained; nothing retries forever.
    assert_eq!(harness.engine.queued_tasks().await.unwrap(), 0);
}

#[tokio::test]
async fn delete_contract_tolerates_absent_storage_folder() {
    let harness = harness(RetryPolicy::default());
    let id = ingest(&harness, "pier.jpg", sample_jpeg(320, 240)).await;
    harness.worker.run_until_idle().await.unwrap();

    // Storage half already gone, e.g. a crashed earlier delete.
    harness.store.delete_folder(PHOTOS_BUCKET, id.as_str()).unwrap();

    // The delete path still succeeds: folder delete is a no-op, row goes.
    harness.store.delete_folder(PHOTOS_BUCKET, id.as_str()).unwrap();
    assert!(harness.catalog.delete(id.as_str()).unwrap());
    assert!(harness.catalog.get(id.as_str()).unwrap().is_none());
}

#[tokio::test]
async fn interrupted_execution_resumes_from_recorded_history() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path().join("object")));
    let catalog = Arc::new(Catalog::open(dir.path().join("catalog.redb")).unwrap());
    let pipeline = Arc::new(PipelineContext {
        store: store.clone(),
        catalog: catalog.clone(),
    });

    let id = new_photo_id();
    let content = sample_jpeg(512, 384);
    {
        let store = store.clone();
        let content = content.clone();
        tokio::task::spawn_blocking(move || {
            store
                .put_item(PHOTOS_BUCKET, id.as_str(), "original.jpg", &content, "image/jpeg")
                .unwrap();
        })
        .await
        .unwrap();
    }

    // First process: start the workflow, commit only the first turn, then
    // "crash" by dropping the engine.
    {
        let workflow_store = Arc::new(WorkflowStore::open(dir.path().join("workflow.redb")).unwrap());
        let engine = Arc::new(WorkflowEngine::new(workflow_store, pipeline.clone()));
        engine
            .start_photo_upload(PhotoUploadInput {
                photo_id: id,
                original_name: "resume.jpg".to_string(),
                original_object: "original.jpg".to_string(),
            })
            .await
            .unwrap();
        if let Some((seq, task)) = engine.claim(Vec::new()).await.unwrap() {
            engine.process(seq, task).await.unwrap();
        }
    }

    // Second process: a fresh engine over the same database finishes the
    // job from the recorded history and queue.
    let workflow_store = Arc::new(WorkflowStore::open(dir.path().join("workflow.redb")).unwrap());
    let engine = Arc::new(WorkflowEngine::new(workflow_store, pipeline));
    let worker = Worker::new(engine.clone(), 2);
    worker.run_until_idle().await.unwrap();

    let record = engine.photo_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert!(catalog.get(id.as_str()).unwrap().is_some());
    assert_eq!(store.list_items(PHOTOS_BUCKET, id.as_str()).unwrap().len(), 4);
}
