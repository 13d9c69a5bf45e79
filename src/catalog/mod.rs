use std::path::Path;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};

use crate::models::photo::PhotoSchema;

/// `photos` table: photo id → bitcode-encoded `PhotoSchema`.
pub const PHOTO_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("photos");

/// The photo catalog. One row per fully processed photo; the pipeline's
/// catalog-write activity is the only writer, the delete path the only
/// remover.
pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path)
            .context(format!("Failed to open catalog database {}", path.display()))?;
        let txn = db.begin_write()?;
        txn.open_table(PHOTO_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Insert keyed by photo id. Re-running the catalog write for the same
    /// id replaces the row instead of duplicating it.
    pub fn upsert(&self, photo: &PhotoSchema) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PHOTO_TABLE)?;
            let encoded = bitcode::encode(photo);
            table.insert(photo.id.as_str(), encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: impl AsRef<str>) -> Result<Option<PhotoSchema>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PHOTO_TABLE)?;
        match table.get(id.as_ref())? {
            Some(bytes) => {
                let photo = bitcode::decode(bytes.value())
                    .context("Failed to decode catalog row")?;
                Ok(Some(photo))
            }
            None => Ok(None),
        }
    }

    /// All rows, newest upload first.
    pub fn get_all(&self) -> Result<Vec<PhotoSchema>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PHOTO_TABLE)?;
        let mut photos = Vec::new();
        for entry in table.range::<&str>(..)? {
            let (_, value) = entry?;
            let photo: PhotoSchema =
                bitcode::decode(value.value()).context("Failed to decode catalog row")?;
            photos.push(photo);
        }
        photos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(photos)
    }

    /// Remove a row by id. Returns whether a row existed.
    pub fn delete(&self, id: impl AsRef<str>) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(PHOTO_TABLE)?;
            table.remove(id.as_ref())?.is_some()
        };
        txn.commit()?;
        Ok(existed)
    }

    pub fn len(&self) -> Result<u64> {
        use redb::ReadableTableMetadata;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PHOTO_TABLE)?;
        Ok(table.len()?)
    }
}
