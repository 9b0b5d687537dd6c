use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use loadsync_core::{DiskStateTree, FileEntry, GamePath, Hash, LoadoutId, LocationId, PathError};

pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(#[from] PathError),
}

/// Row changes applied by one `save_state` transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Persists the last-synced disk snapshot per loadout, keyed by
/// `(loadout_id, location, path)`.
pub struct DiskStateStore {
    pool: SqlitePool,
}

impl DiskStateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StateStoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StateStoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StateStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The snapshot taken at the end of the last successful sync, or `None`
    /// if this loadout has never been synced. A corrupt row is fatal.
    pub async fn get_state(
        &self,
        loadout_id: LoadoutId,
    ) -> Result<Option<DiskStateTree>, StateStoreError> {
        let marker = sqlx::query("SELECT loadout_id FROM snapshots WHERE loadout_id = ?1")
            .bind(db_id(loadout_id))
            .fetch_optional(&self.pool)
            .await?;
        if marker.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            "SELECT location, path, hash, size, modified
             FROM disk_state
             WHERE loadout_id = ?1
             ORDER BY location ASC, path ASC",
        )
        .bind(db_id(loadout_id))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let location: String = row.try_get("location")?;
            let path: String = row.try_get("path")?;
            let hash: i64 = row.try_get("hash")?;
            let size: i64 = row.try_get("size")?;
            let modified: i64 = row.try_get("modified")?;
            let path = GamePath::new(LocationId::new(location), path)?;
            entries.insert(
                path,
                FileEntry {
                    hash: Hash(hash as u64),
                    size: size as u64,
                    modified,
                },
            );
        }
        Ok(Some(DiskStateTree::from_entries(entries)))
    }

    /// Replaces the stored snapshot with a minimal diff: unchanged rows are
    /// left untouched, so re-saving an identical snapshot writes nothing.
    pub async fn save_state(
        &self,
        loadout_id: LoadoutId,
        snapshot: &DiskStateTree,
    ) -> Result<StateDelta, StateStoreError> {
        let mut tx = self.pool.begin().await?;
        let mut delta = StateDelta::default();

        let rows = sqlx::query(
            "SELECT location, path, hash, size, modified FROM disk_state WHERE loadout_id = ?1",
        )
        .bind(db_id(loadout_id))
        .fetch_all(&mut *tx)
        .await?;

        let mut existing = BTreeMap::new();
        for row in rows {
            let location: String = row.try_get("location")?;
            let path: String = row.try_get("path")?;
            let hash: i64 = row.try_get("hash")?;
            let size: i64 = row.try_get("size")?;
            let modified: i64 = row.try_get("modified")?;
            existing.insert(
                GamePath::new(LocationId::new(location), path)?,
                FileEntry {
                    hash: Hash(hash as u64),
                    size: size as u64,
                    modified,
                },
            );
        }

        for (path, entry) in snapshot.iter() {
            match existing.remove(path) {
                Some(old) if old == *entry => {}
                Some(_) => {
                    sqlx::query(
                        "UPDATE disk_state SET hash = ?4, size = ?5, modified = ?6
                         WHERE loadout_id = ?1 AND location = ?2 AND path = ?3",
                    )
                    .bind(db_id(loadout_id))
                    .bind(path.location().as_str())
                    .bind(path.path())
                    .bind(entry.hash.as_u64() as i64)
                    .bind(entry.size as i64)
                    .bind(entry.modified)
                    .execute(&mut *tx)
                    .await?;
                    delta.updated += 1;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO disk_state (loadout_id, location, path, hash, size, modified)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .bind(db_id(loadout_id))
                    .bind(path.location().as_str())
                    .bind(path.path())
                    .bind(entry.hash.as_u64() as i64)
                    .bind(entry.size as i64)
                    .bind(entry.modified)
                    .execute(&mut *tx)
                    .await?;
                    delta.inserted += 1;
                }
            }
        }

        for path in existing.keys() {
            sqlx::query(
                "DELETE FROM disk_state WHERE loadout_id = ?1 AND location = ?2 AND path = ?3",
            )
            .bind(db_id(loadout_id))
            .bind(path.location().as_str())
            .bind(path.path())
            .execute(&mut *tx)
            .await?;
            delta.deleted += 1;
        }

        sqlx::query(
            "INSERT INTO snapshots (loadout_id, updated_at) VALUES (?1, ?2)
             ON CONFLICT(loadout_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(db_id(loadout_id))
        .bind(now_secs())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(delta)
    }

    pub async fn delete_state(&self, loadout_id: LoadoutId) -> Result<(), StateStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM disk_state WHERE loadout_id = ?1")
            .bind(db_id(loadout_id))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snapshots WHERE loadout_id = ?1")
            .bind(db_id(loadout_id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) fn db_id(loadout_id: LoadoutId) -> i64 {
    loadout_id.0 as i64
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs() as i64)
        .unwrap_or(0)
}

fn default_db_path() -> Result<PathBuf, StateStoreError> {
    let mut path = dirs::data_dir().ok_or(StateStoreError::MissingDataDir)?;
    path.push("loadsync");
    path.push("state.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> DiskStateStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = DiskStateStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn path(p: &str) -> GamePath {
        GamePath::new(LocationId::from("game"), p).unwrap()
    }

    fn entry(hash: u64, modified: i64) -> FileEntry {
        FileEntry {
            hash: Hash(hash),
            size: 10,
            modified,
        }
    }

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = make_store().await;
        let snapshot = DiskStateTree::from_entries([
            (path("Data/a.esp"), entry(1, 100)),
            (path("Data/b.esp"), entry(2, 200)),
        ]);

        let delta = store.save_state(LoadoutId(1), &snapshot).await.unwrap();
        assert_eq!(delta.inserted, 2);

        let loaded = store.get_state(LoadoutId(1)).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn never_synced_is_distinct_from_empty() {
        let store = make_store().await;
        assert!(store.get_state(LoadoutId(1)).await.unwrap().is_none());

        store
            .save_state(LoadoutId(1), &DiskStateTree::new())
            .await
            .unwrap();
        let loaded = store.get_state(LoadoutId(1)).await.unwrap().unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn unchanged_snapshot_writes_nothing() {
        let store = make_store().await;
        let snapshot = DiskStateTree::from_entries([(path("Data/a.esp"), entry(1, 100))]);

        store.save_state(LoadoutId(1), &snapshot).await.unwrap();
        let delta = store.save_state(LoadoutId(1), &snapshot).await.unwrap();
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn save_applies_a_minimal_diff() {
        let store = make_store().await;
        let first = DiskStateTree::from_entries([
            (path("keep.esp"), entry(1, 100)),
            (path("change.esp"), entry(2, 100)),
            (path("drop.esp"), entry(3, 100)),
        ]);
        store.save_state(LoadoutId(1), &first).await.unwrap();

        let second = DiskStateTree::from_entries([
            (path("keep.esp"), entry(1, 100)),
            (path("change.esp"), entry(20, 150)),
            (path("added.esp"), entry(4, 150)),
        ]);
        let delta = store.save_state(LoadoutId(1), &second).await.unwrap();

        assert_eq!(
            delta,
            StateDelta {
                inserted: 1,
                updated: 1,
                deleted: 1,
            }
        );
        let loaded = store.get_state(LoadoutId(1)).await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn loadouts_do_not_share_snapshots() {
        let store = make_store().await;
        let snapshot = DiskStateTree::from_entries([(path("Data/a.esp"), entry(1, 100))]);
        store.save_state(LoadoutId(1), &snapshot).await.unwrap();

        assert!(store.get_state(LoadoutId(2)).await.unwrap().is_none());

        store.delete_state(LoadoutId(1)).await.unwrap();
        assert!(store.get_state(LoadoutId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_rows_are_fatal() {
        let store = make_store().await;
        store
            .save_state(LoadoutId(1), &DiskStateTree::new())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO disk_state (loadout_id, location, path, hash, size, modified)
             VALUES (1, 'game', '../escape', 1, 2, 3)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.get_state(LoadoutId(1)).await.unwrap_err();
        assert!(matches!(err, StateStoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn hashes_above_i64_max_survive_the_round_trip() {
        let store = make_store().await;
        let snapshot =
            DiskStateTree::from_entries([(path("big.esp"), entry(u64::MAX - 1, 100))]);
        store.save_state(LoadoutId(1), &snapshot).await.unwrap();
        let loaded = store.get_state(LoadoutId(1)).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }
}
