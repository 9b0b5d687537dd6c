use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use loadsync_core::{
    FileEntry, GamePath, Hash, Item, ItemId, Loadout, LoadoutId, LocationId, PathError,
};

use super::state_store::{MIGRATOR, db_id};

#[derive(Debug, Error)]
pub enum LoadoutStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored loadout is corrupt: {0}")]
    Corrupt(#[from] PathError),
}

/// Read/write contract for the desired configuration. The engine never sees
/// the storage format, only whole `Loadout` values committed atomically.
#[async_trait]
pub trait LoadoutStore: Send + Sync {
    async fn create_loadout(&self, name: &str) -> Result<Loadout, LoadoutStoreError>;
    async fn load_loadout(&self, id: LoadoutId) -> Result<Option<Loadout>, LoadoutStoreError>;
    async fn save_loadout(&self, loadout: &Loadout) -> Result<(), LoadoutStoreError>;
    async fn delete_loadout(&self, id: LoadoutId) -> Result<(), LoadoutStoreError>;
}

pub struct SqliteLoadoutStore {
    pool: SqlitePool,
}

impl SqliteLoadoutStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, LoadoutStoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), LoadoutStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LoadoutStore for SqliteLoadoutStore {
    async fn create_loadout(&self, name: &str) -> Result<Loadout, LoadoutStoreError> {
        let result = sqlx::query("INSERT INTO loadouts (name) VALUES (?1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(Loadout {
            id: LoadoutId(result.last_insert_rowid() as u64),
            name: name.to_string(),
            items: vec![],
        })
    }

    async fn load_loadout(&self, id: LoadoutId) -> Result<Option<Loadout>, LoadoutStoreError> {
        let row = sqlx::query("SELECT name FROM loadouts WHERE id = ?1")
            .bind(db_id(id))
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let name: String = row.try_get("name")?;

        let item_rows = sqlx::query(
            "SELECT id, name, priority, enabled FROM items WHERE loadout_id = ?1 ORDER BY id ASC",
        )
        .bind(db_id(id))
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(item_rows.len());
        for row in item_rows {
            let item_id: i64 = row.try_get("id")?;
            let enabled: i64 = row.try_get("enabled")?;
            items.push(Item {
                id: ItemId(item_id as u64),
                name: row.try_get("name")?,
                priority: row.try_get("priority")?,
                enabled: enabled != 0,
                files: BTreeMap::new(),
            });
        }

        let file_rows = sqlx::query(
            "SELECT item_id, location, path, hash, size, modified
             FROM item_files
             WHERE loadout_id = ?1
             ORDER BY item_id ASC, location ASC, path ASC",
        )
        .bind(db_id(id))
        .fetch_all(&self.pool)
        .await?;

        for row in file_rows {
            let item_id: i64 = row.try_get("item_id")?;
            let location: String = row.try_get("location")?;
            let path: String = row.try_get("path")?;
            let hash: i64 = row.try_get("hash")?;
            let size: i64 = row.try_get("size")?;
            let modified: i64 = row.try_get("modified")?;
            let path = GamePath::new(LocationId::new(location), path)?;
            let entry = FileEntry {
                hash: Hash(hash as u64),
                size: size as u64,
                modified,
            };
            if let Some(item) = items.iter_mut().find(|item| item.id.0 == item_id as u64) {
                item.files.insert(path, entry);
            }
        }

        Ok(Some(Loadout { id, name, items }))
    }

    /// One transaction per commit: either the whole loadout lands or none of
    /// it does.
    async fn save_loadout(&self, loadout: &Loadout) -> Result<(), LoadoutStoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO loadouts (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(db_id(loadout.id))
        .bind(&loadout.name)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM item_files WHERE loadout_id = ?1")
            .bind(db_id(loadout.id))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM items WHERE loadout_id = ?1")
            .bind(db_id(loadout.id))
            .execute(&mut *tx)
            .await?;

        for item in &loadout.items {
            sqlx::query(
                "INSERT INTO items (loadout_id, id, name, priority, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(db_id(loadout.id))
            .bind(item.id.0 as i64)
            .bind(&item.name)
            .bind(item.priority)
            .bind(if item.enabled { 1 } else { 0 })
            .execute(&mut *tx)
            .await?;

            for (path, entry) in &item.files {
                sqlx::query(
                    "INSERT INTO item_files (loadout_id, item_id, location, path, hash, size, modified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(db_id(loadout.id))
                .bind(item.id.0 as i64)
                .bind(path.location().as_str())
                .bind(path.path())
                .bind(entry.hash.as_u64() as i64)
                .bind(entry.size as i64)
                .bind(entry.modified)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_loadout(&self, id: LoadoutId) -> Result<(), LoadoutStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM item_files WHERE loadout_id = ?1")
            .bind(db_id(id))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM items WHERE loadout_id = ?1")
            .bind(db_id(id))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM loadouts WHERE id = ?1")
            .bind(db_id(id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
