//! The retryable units of the pipeline. Activity kinds are a closed enum
//! dispatched to typed handlers; the queue stays replayable without any
//! register-by-name indirection.
//!
//! Every handler is safe to re-invoke: previews overwrite their own storage
//! key, metadata extraction is read-only, and the catalog write is an upsert
//! keyed by the photo id.

use std::sync::Arc;

use anyhow::{Context, Result};
use bitcode::{Decode, Encode};
use log::info;
use tokio::task::spawn_blocking;

use crate::catalog::Catalog;
use crate::common::PHOTOS_BUCKET;
use crate::models::photo::{PhotoId, PhotoProbe, PhotoSchema, PreviewSize};
use crate::processing::image::{decode_image, encode_jpeg, resize_to_width};
use crate::processing::metadata::{blur_hash, extract_camera_metadata};
use crate::storage::ObjectStore;

/// Shared collaborators the activities run against.
pub struct PipelineContext {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<Catalog>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ActivityCommand {
    GeneratePreview {
        photo_id: PhotoId,
        size: PreviewSize,
        original_object: String,
    },
    ExtractMetadata {
        photo_id: PhotoId,
        original_object: String,
    },
    WriteCatalogRow {
        photo_id: PhotoId,
        original_name: String,
        probe: PhotoProbe,
    },
}

impl ActivityCommand {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityCommand::GeneratePreview { .. } => "generate_preview",
            ActivityCommand::ExtractMetadata { .. } => "extract_metadata",
            ActivityCommand::WriteCatalogRow { .. } => "write_catalog_row",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ActivityResult {
    PreviewStored { size: PreviewSize },
    Metadata(PhotoProbe),
    CatalogWritten,
}

/// Execute one activity invocation. Errors are returned to the engine, which
/// owns retries; handlers never retry internally.
pub async fn run_activity(
    ctx: &PipelineContext,
    command: ActivityCommand,
) -> Result<ActivityResult> {
    match command {
        ActivityCommand::GeneratePreview {
            photo_id,
            size,
            original_object,
        } => {
            generate_preview(ctx, photo_id, size, original_object).await?;
            Ok(ActivityResult::PreviewStored { size })
        }
        ActivityCommand::ExtractMetadata {
            photo_id,
            original_object,
        } => {
            let probe = extract_metadata(ctx, photo_id, original_object).await?;
            Ok(ActivityResult::Metadata(probe))
        }
        ActivityCommand::WriteCatalogRow {
            photo_id,
            original_name,
            probe,
        } => {
            write_catalog_row(ctx, photo_id, original_name, probe).await?;
            Ok(ActivityResult::CatalogWritten)
        }
    }
}

fn fetch_original(
    store: &dyn ObjectStore,
    photo_id: &PhotoId,
    original_object: &str,
) -> Result<Vec<u8>> {
    let item = store
        .get_item(PHOTOS_BUCKET, photo_id.as_str(), original_object)
        .context("Failed to get original photo")?;
    store
        .get_item_content(&item)
        .context("Failed to get original photo content")
}

async fn generate_preview(
    ctx: &PipelineContext,
    photo_id: PhotoId,
    size: PreviewSize,
    original_object: String,
) -> Result<()> {
    let store = ctx.store.clone();
    spawn_blocking(move || -> Result<()> {
        let content = fetch_original(store.as_ref(), &photo_id, &original_object)?;
        let original = decode_image(&content).context("Failed to decode original image")?;

        let preview = resize_to_width(&original, size.target_width());
        let jpeg = encode_jpeg(&preview).context("Failed to encode preview JPEG")?;

        store
            .put_item(
                PHOTOS_BUCKET,
                photo_id.as_str(),
                &size.object_name(),
                &jpeg,
                "image/jpeg",
            )
            .context("Failed to store preview image")?;

        info!(
            "Stored {} preview for photo {} ({} bytes)",
            size.as_str(),
            photo_id,
            jpeg.len()
        );
        Ok(())
    })
    .await?
}

async fn extract_metadata(
    ctx: &PipelineContext,
    photo_id: PhotoId,
    original_object: String,
) -> Result<PhotoProbe> {
    let store = ctx.store.clone();
    spawn_blocking(move || -> Result<PhotoProbe> {
        let content = fetch_original(store.as_ref(), &photo_id, &original_object)?;
        let original = decode_image(&content).context("Failed to decode original image")?;

        let blur_hash = blur_hash(&original).context("Failed to compute blur hash")?;
        // EXIF problems degrade to empty fields; only decode failures above
        // are worth a retry.
        let camera = extract_camera_metadata(&content);

        Ok(PhotoProbe {
            width: original.width(),
            height: original.height(),
            blur_hash,
            camera,
        })
    })
    .await?
}

async fn write_catalog_row(
    ctx: &PipelineContext,
    photo_id: PhotoId,
    original_name: String,
    probe: PhotoProbe,
) -> Result<()> {
    let catalog = ctx.catalog.clone();
    spawn_blocking(move || -> Result<()> {
        let row = PhotoSchema::from_probe(photo_id, original_name, &probe);
        catalog
            .upsert(&row)
            .context("Failed to insert photo into catalog")?;
        info!("Catalogued photo {}", photo_id);
        Ok(())
    })
    .await?
}
