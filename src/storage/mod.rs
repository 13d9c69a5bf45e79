pub mod fs;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use fs::FsObjectStore;

/// Handle into the object store. `folder` is the photo id; `name` is one of
/// `original.<ext>`, `small.jpg`, `medium.jpg`, `large.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub bucket: String,
    pub folder: String,
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

/// Durable blob storage keyed by (bucket, folder, name).
///
/// Methods are synchronous; callers on an async runtime go through
/// `spawn_blocking`. Every write must be atomic at the key level: a reader
/// never observes a half-written object under its final name.
pub trait ObjectStore: Send + Sync {
    fn put_item(
        &self,
        bucket: &str,
        folder: &str,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<StoredObject>;

    /// Stat an object without reading its content.
    fn get_item(&self, bucket: &str, folder: &str, name: &str) -> Result<StoredObject>;

    fn get_item_content(&self, item: &StoredObject) -> Result<Vec<u8>>;

    fn delete_item(&self, bucket: &str, folder: &str, name: &str) -> Result<()>;

    /// Remove a folder and everything in it. An absent or partially deleted
    /// folder is success, so delete paths can be safely re-run.
    fn delete_folder(&self, bucket: &str, folder: &str) -> Result<()>;

    fn list_items(&self, bucket: &str, folder: &str) -> Result<Vec<StoredObject>>;
}
