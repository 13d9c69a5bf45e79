use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use path_clean::PathClean;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::utils::PathExt;

use super::{ObjectStore, StoredObject};

/// Filesystem-backed object store rooted at a single directory, laid out as
/// `<root>/<bucket>/<folder>/<name>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, bucket: &str, folder: &str, name: &str) -> Result<PathBuf> {
        let mut path = self.root.join(sanitize(bucket)?);
        path.push(sanitize(folder)?);
        path.push(sanitize(name)?);
        Ok(path)
    }

    fn folder_path(&self, bucket: &str, folder: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize(bucket)?).join(sanitize(folder)?))
    }

    fn object_from_path(&self, bucket: &str, folder: &str, path: &Path) -> Result<StoredObject> {
        let metadata = fs::metadata(path)
            .context(format!("Failed to stat stored object {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Stored object has no valid file name: {}", path.display()))?;
        Ok(StoredObject {
            bucket: bucket.to_string(),
            folder: folder.to_string(),
            name: name.to_string(),
            size: metadata.len(),
            content_type: content_type_for_ext(&path.ext_lower()),
        })
    }
}

/// Reject keys that would escape the store root. Keys are single path
/// components; anything else is a caller bug, not data.
fn sanitize(component: &str) -> Result<&str> {
    let cleaned = Path::new(component).clean();
    let mut parts = cleaned.components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(component),
        _ => Err(anyhow!("Invalid storage key component: {:?}", component)),
    }
}

pub fn content_type_for_ext(ext: &str) -> String {
    match ext {
        "jpg" | "jpeg" | "jfif" | "jpe" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
    .to_string()
}

impl ObjectStore for FsObjectStore {
    fn put_item(
        &self,
        bucket: &str,
        folder: &str,
        name: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<StoredObject> {
        let final_path = self.resolve(bucket, folder, name)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| anyhow!("Storage path has no parent: {}", final_path.display()))?;
        fs::create_dir_all(parent)
            .context(format!("Failed to create folder {}", parent.display()))?;

        // Write-then-rename keeps re-runs of the same put idempotent: the key
        // either holds the previous complete object or the new one.
        let tmp_path = parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        fs::write(&tmp_path, content).context(format!(
            "Failed to write temporary object {}",
            tmp_path.display()
        ))?;
        fs::rename(&tmp_path, &final_path).context(format!(
            "Failed to move object into place at {}",
            final_path.display()
        ))?;

        Ok(StoredObject {
            bucket: bucket.to_string(),
            folder: folder.to_string(),
            name: name.to_string(),
            size: content.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    fn get_item(&self, bucket: &str, folder: &str, name: &str) -> Result<StoredObject> {
        let path = self.resolve(bucket, folder, name)?;
        self.object_from_path(bucket, folder, &path)
    }

    fn get_item_content(&self, item: &StoredObject) -> Result<Vec<u8>> {
        let path = self.resolve(&item.bucket, &item.folder, &item.name)?;
        fs::read(&path).context(format!(
            "Failed to read stored object content {}",
            path.display()
        ))
    }

    fn delete_item(&self, bucket: &str, folder: &str, name: &str) -> Result<()> {
        let path = self.resolve(bucket, folder, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).context(format!("Failed to delete stored object {}", path.display()))
            }
        }
    }

    fn delete_folder(&self, bucket: &str, folder: &str) -> Result<()> {
        let path = self.folder_path(bucket, folder)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!(
                "Failed to delete storage folder {}",
                path.display()
            )),
        }
    }

    fn list_items(&self, bucket: &str, folder: &str) -> Result<Vec<StoredObject>> {
        let path = self.folder_path(bucket, folder)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut items = Vec::new();
        for entry in WalkDir::new(&path).min_depth(1).max_depth(1) {
            let entry = entry.context(format!(
                "Failed to walk storage folder {}",
                path.display()
            ))?;
            if entry.file_type().is_file() {
                // Dot-prefixed files are in-flight temp writes, not objects.
                let hidden = entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(true);
                if !hidden {
                    items.push(self.object_from_path(bucket, folder, entry.path())?);
                }
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}
