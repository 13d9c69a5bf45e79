use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{error, info};
use rocket::State;
use rocket::form::{Errors, Form, FromForm, FromFormField};
use rocket::fs::TempFile;
use rocket::http::ContentType;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use serde::Serialize;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::AppContext;
use crate::api::guards::GuardAuth;
use crate::api::{AppError, AppResult, GuardResult};
use crate::common::{PHOTOS_BUCKET, VALID_IMAGE_EXTENSIONS};
use crate::models::photo::{PhotoId, PhotoSchema, PhotoUploadInput, PreviewSize, new_photo_id};
use crate::storage::fs::content_type_for_ext;
use crate::utils::original_object_name;

#[derive(FromForm, Debug)]
pub struct UploadForm<'r> {
    /// The upload field, repeatable: one entry per photo.
    #[field(name = "photo")]
    pub photo: Vec<TempFile<'r>>,
}

/// Per-file upload outcome. Acceptance means the original is stored and the
/// workflow is started, not that processing finished.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum UploadOutcome {
    Accepted { id: PhotoId, name: String },
    Rejected { name: String, error: String },
}

fn get_filename(file: &TempFile<'_>) -> String {
    file.name()
        .map(|name| name.to_string())
        .unwrap_or_else(|| "photo".to_string())
}

fn get_extension(file: &TempFile<'_>) -> Result<String> {
    match file.content_type() {
        Some(ct) => match ct.extension() {
            Some(ext) => Ok(ext.as_str().to_lowercase()),
            None => bail!("Failed to extract file extension."),
        },
        None => bail!("Failed to get content type."),
    }
}

#[post("/api/photos/upload", data = "<form>")]
pub async fn upload(
    auth: GuardResult<GuardAuth>,
    context: &State<Arc<AppContext>>,
    form: Result<Form<UploadForm<'_>>, Errors<'_>>,
) -> AppResult<Json<Vec<UploadOutcome>>> {
    let _ = auth?;
    let mut inner_form = match form {
        Ok(form) => form.into_inner(),
        Err(errors) => {
            let error_chain = errors
                .iter()
                .map(|err| anyhow!(err.to_string()))
                .reduce(|acc, err| acc.context(err.to_string()));

            return match error_chain {
                Some(chain) => Err(AppError::bad_request(chain.context("Failed to parse form"))),
                None => Err(AppError::bad_request(anyhow!(
                    "Failed to parse form with unknown error"
                ))),
            };
        }
    };

    if inner_form.photo.is_empty() {
        return Err(AppError::bad_request(anyhow!(
            "Upload request contains no 'photo' field"
        )));
    }

    let mut outcomes = Vec::with_capacity(inner_form.photo.len());
    for file in inner_form.photo.iter_mut() {
        let display_name = display_name_for(file);
        // One file's failure must not abort its siblings.
        match ingest_one(context, file, &display_name).await {
            Ok(id) => outcomes.push(UploadOutcome::Accepted {
                id,
                name: display_name,
            }),
            Err(err) => {
                error!("Failed to ingest {display_name}: {err:#}");
                outcomes.push(UploadOutcome::Rejected {
                    name: display_name,
                    error: format!("{err:#}"),
                });
            }
        }
    }
    Ok(Json(outcomes))
}

fn display_name_for(file: &TempFile<'_>) -> String {
    let name = get_filename(file);
    match get_extension(file) {
        Ok(ext) => format!("{name}.{ext}"),
        Err(_) => name,
    }
}

/// Store the original blob and start exactly one workflow execution for it.
async fn ingest_one(
    context: &State<Arc<AppContext>>,
    file: &mut TempFile<'_>,
    display_name: &str,
) -> Result<PhotoId> {
    let extension = get_extension(file)?;
    if !VALID_IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        bail!("Invalid file type: {extension}");
    }
    let content_type = file
        .content_type()
        .map(|ct| ct.to_string())
        .unwrap_or_else(|| content_type_for_ext(&extension));

    // Spool through a scratch path: TempFile may still be in memory, and the
    // object store wants bytes.
    let scratch = scratch_path(context);
    file.move_copy_to(&scratch)
        .await
        .context("Failed to spool uploaded file")?;

    let id = new_photo_id();
    let original_object = original_object_name(display_name);
    let store = context.store.clone();
    let put_result = spawn_blocking(move || -> Result<()> {
        let content = std::fs::read(&scratch).context("Failed to read spooled upload")?;
        let cleanup = std::fs::remove_file(&scratch);
        store
            .put_item(
                PHOTOS_BUCKET,
                id.as_str(),
                &original_object,
                &content,
                &content_type,
            )
            .context("Failed to store original file")?;
        cleanup.context("Failed to remove spooled upload")?;
        Ok(())
    })
    .await?;
    put_result?;

    context
        .engine
        .start_photo_upload(PhotoUploadInput {
            photo_id: id,
            original_name: display_name.to_string(),
            original_object: original_object_name(display_name),
        })
        .await
        .context("Failed to start photo workflow")?;

    info!("Accepted upload {display_name} as photo {id}");
    Ok(id)
}

fn scratch_path(context: &State<Arc<AppContext>>) -> PathBuf {
    context
        .config
        .data_dir
        .join(format!("upload-{}.tmp", Uuid::new_v4().simple()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromFormField)]
pub enum PhotoQuality {
    Original,
    Large,
    Medium,
    Small,
}

impl PhotoQuality {
    fn object_name(self, photo: &PhotoSchema) -> String {
        match self {
            PhotoQuality::Original => original_object_name(&photo.name),
            PhotoQuality::Large => PreviewSize::Large.object_name(),
            PhotoQuality::Medium => PreviewSize::Medium.object_name(),
            PhotoQuality::Small => PreviewSize::Small.object_name(),
        }
    }
}

/// Streams one stored object back to the caller.
pub struct PhotoContent {
    content_type: ContentType,
    bytes: Vec<u8>,
}

impl<'r> Responder<'r, 'static> for PhotoContent {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(self.content_type)
            .sized_body(self.bytes.len(), Cursor::new(self.bytes))
            .ok()
    }
}

#[get("/api/photos/<id>?<quality>")]
pub async fn get_photo(
    context: &State<Arc<AppContext>>,
    id: &str,
    quality: Option<PhotoQuality>,
) -> AppResult<PhotoContent> {
    let quality = quality.unwrap_or(PhotoQuality::Original);
    let catalog = context.catalog.clone();
    let store = context.store.clone();
    let id_owned = id.to_string();

    let found = spawn_blocking(move || -> Result<Option<(String, Vec<u8>)>> {
        let photo = match catalog.get(&id_owned)? {
            Some(photo) => photo,
            None => return Ok(None),
        };
        let object_name = quality.object_name(&photo);
        let item = store
            .get_item(PHOTOS_BUCKET, &id_owned, &object_name)
            .context("Failed to get stored photo object")?;
        let content = store
            .get_item_content(&item)
            .context("Failed to read stored photo object")?;
        Ok(Some((item.content_type, content)))
    })
    .await??;

    match found {
        Some((content_type, bytes)) => Ok(PhotoContent {
            content_type: content_type
                .parse::<ContentType>()
                .unwrap_or(ContentType::JPEG),
            bytes,
        }),
        None => Err(AppError::not_found(anyhow!("Photo {id} does not exist"))),
    }
}

#[get("/api/photos")]
pub async fn list_photos(context: &State<Arc<AppContext>>) -> AppResult<Json<Vec<PhotoSchema>>> {
    let catalog = context.catalog.clone();
    let photos = spawn_blocking(move || catalog.get_all()).await??;
    Ok(Json(photos))
}

#[delete("/api/photos/<id>")]
pub async fn delete_photo(
    auth: GuardResult<GuardAuth>,
    context: &State<Arc<AppContext>>,
    id: &str,
) -> AppResult<()> {
    let _ = auth?;
    let catalog = context.catalog.clone();
    let store = context.store.clone();
    let id_owned = id.to_string();

    let existed = spawn_blocking(move || -> Result<bool> {
        if catalog.get(&id_owned)?.is_none() {
            return Ok(false);
        }
        // Storage first: a crash mid-delete leaves a visible catalog row to
        // retry from, never an unreachable blob. An already-absent folder is
        // fine.
        store
            .delete_folder(PHOTOS_BUCKET, &id_owned)
            .context("Failed to delete storage folder")?;
        catalog
            .delete(&id_owned)
            .context("Failed to delete catalog row")?;
        info!("Deleted photo {id_owned}");
        Ok(true)
    })
    .await??;

    if !existed {
        return Err(AppError::not_found(anyhow!("Photo {id} does not exist")));
    }
    Ok(())
}
