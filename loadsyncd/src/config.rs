use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;

use loadsync_core::{GamePath, IgnoreSet, LocationId};

use crate::sync::backup::LocalBackupStore;
use crate::sync::engine::SyncEngine;
use crate::sync::hash_cache::FileHashCache;
use crate::sync::loadout_store::SqliteLoadoutStore;
use crate::sync::locations::LocationsRegister;
use crate::sync::state_store::DiskStateStore;

/// Engine configuration resolved from the environment.
///
/// `LOADSYNC_LOCATIONS` is required: a comma-separated list of
/// `location=/absolute/root` pairs. `LOADSYNC_IGNORE` is optional:
/// `location:relative/path` entries, where a trailing `/` marks a directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub backup_dir: PathBuf,
    pub locations: Vec<(LocationId, PathBuf)>,
    pub ignore: IgnoreSet,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = match std::env::var("LOADSYNC_DATA_DIR") {
            Ok(value) => PathBuf::from(value),
            Err(_) => dirs::data_dir()
                .context("XDG data directory is unavailable")?
                .join("loadsync"),
        };
        let database_path = std::env::var("LOADSYNC_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("state.db"));
        let backup_dir = std::env::var("LOADSYNC_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("archive"));

        let locations_raw =
            std::env::var("LOADSYNC_LOCATIONS").context("LOADSYNC_LOCATIONS is not set")?;
        let locations = parse_locations(&locations_raw)?;

        let ignore = match std::env::var("LOADSYNC_IGNORE") {
            Ok(raw) => parse_ignore(&raw)?,
            Err(_) => IgnoreSet::new(),
        };

        Ok(Self {
            database_path,
            backup_dir,
            locations,
            ignore,
        })
    }

    /// Opens the database, runs migrations, and wires the engine together.
    pub async fn bootstrap(self) -> anyhow::Result<SyncEngine> {
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(&self.backup_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(&self.database_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let state_store = DiskStateStore::from_pool(pool.clone());
        state_store.init().await?;
        let loadouts = Arc::new(SqliteLoadoutStore::from_pool(pool));
        let backup = Arc::new(LocalBackupStore::new(&self.backup_dir));

        let mut locations = LocationsRegister::new();
        for (id, root) in self.locations {
            locations.register(id, root);
        }

        Ok(SyncEngine::new(
            FileHashCache::new(),
            state_store,
            loadouts,
            backup,
            locations,
            self.ignore,
        ))
    }
}

fn parse_locations(raw: &str) -> anyhow::Result<Vec<(LocationId, PathBuf)>> {
    let mut out = Vec::new();
    for pair in raw.split(',').filter(|pair| !pair.trim().is_empty()) {
        let (id, root) = pair
            .split_once('=')
            .with_context(|| format!("malformed location entry: {pair}"))?;
        let id = id.trim();
        let root = root.trim();
        anyhow::ensure!(!id.is_empty() && !root.is_empty(), "empty location entry: {pair}");
        out.push((LocationId::from(id), PathBuf::from(root)));
    }
    anyhow::ensure!(!out.is_empty(), "no locations configured");
    Ok(out)
}

fn parse_ignore(raw: &str) -> anyhow::Result<IgnoreSet> {
    let mut ignore = IgnoreSet::new();
    for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
        let entry = entry.trim();
        let (location, path) = entry
            .split_once(':')
            .with_context(|| format!("malformed ignore entry: {entry}"))?;
        let is_dir = path.ends_with('/');
        let game_path = GamePath::new(LocationId::from(location), path)
            .with_context(|| format!("invalid ignore path: {entry}"))?;
        if is_dir {
            ignore.add_dir(game_path);
        } else {
            ignore.add_file(game_path);
        }
    }
    Ok(ignore)
}
