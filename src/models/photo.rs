use arrayvec::ArrayString;
use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::now_ms;

/// Photo identity. Generated at upload time and reused as the storage folder
/// and the workflow-execution key.
pub type PhotoId = ArrayString<64>;

pub fn new_photo_id() -> PhotoId {
    let id = Uuid::new_v4().simple().to_string();
    PhotoId::from(&id).expect("uuid simple form fits in 64 bytes")
}

/// The three derived renditions of every photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreviewSize {
    Small,
    Medium,
    Large,
}

impl PreviewSize {
    pub const ALL: [PreviewSize; 3] = [PreviewSize::Small, PreviewSize::Medium, PreviewSize::Large];

    pub fn target_width(self) -> u32 {
        match self {
            PreviewSize::Small => 300,
            PreviewSize::Medium => 768,
            PreviewSize::Large => 1920,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreviewSize::Small => "small",
            PreviewSize::Medium => "medium",
            PreviewSize::Large => "large",
        }
    }

    pub fn object_name(self) -> String {
        format!("{}.jpg", self.as_str())
    }
}

/// Best-effort camera metadata pulled from EXIF. Empty string means the
/// field was absent or unparseable; neither fails the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraMetadata {
    pub lens: String,
    pub aperture: String,
    pub shutter_speed: String,
    pub iso: String,
    pub focal_length: String,
    pub focal_length_35mm: String,
}

/// Result of the metadata/hash activity: everything the catalog row needs
/// beyond what the upload already knew. Carried through workflow history,
/// never written to storage directly.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoProbe {
    pub width: u32,
    pub height: u32,
    pub blur_hash: String,
    pub camera: CameraMetadata,
}

/// One row of the `photos` catalog table. Written exclusively by the
/// catalog-write activity; removed exclusively by the delete path.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoSchema {
    pub id: PhotoId,
    pub name: String,
    pub blur_hash: String,
    pub width: u32,
    pub height: u32,
    pub lens: String,
    pub aperture: String,
    pub shutter_speed: String,
    pub iso: String,
    pub focal_length: String,
    pub focal_length_35mm: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PhotoSchema {
    pub fn from_probe(id: PhotoId, name: String, probe: &PhotoProbe) -> Self {
        let now = now_ms();
        Self {
            id,
            name,
            blur_hash: probe.blur_hash.clone(),
            width: probe.width,
            height: probe.height,
            lens: probe.camera.lens.clone(),
            aperture: probe.camera.aperture.clone(),
            shutter_speed: probe.camera.shutter_speed.clone(),
            iso: probe.camera.iso.clone(),
            focal_length: probe.camera.focal_length.clone(),
            focal_length_35mm: probe.camera.focal_length_35mm.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input of one `photo_upload_<id>` workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploadInput {
    pub photo_id: PhotoId,
    /// Display name, as uploaded.
    pub original_name: String,
    /// Storage key of the original blob, `original.<ext>`.
    pub original_object: String,
}
