use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

use loadsync_core::{FileEntry, GamePath, Hash, IgnoreSet, Item, ItemId, LoadoutId, LocationId};

use super::backup::{BackupError, BackupRequest, BackupStore, LocalBackupStore};
use super::engine::{
    EXTERNAL_CHANGES_ITEM, EngineError, GAME_FILES_ITEM, SyncEngine, SyncFailure,
    transient_scan_error,
};
use super::hash_cache::{CacheError, FileHashCache};
use super::loadout_store::{LoadoutStore, SqliteLoadoutStore};
use super::locations::LocationsRegister;
use super::state_store::DiskStateStore;

struct Harness {
    engine: SyncEngine,
    loadouts: Arc<SqliteLoadoutStore>,
    backup: Arc<LocalBackupStore>,
    state: DiskStateStore,
    game_dir: TempDir,
    _archive_dir: TempDir,
    staging_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let state_store = DiskStateStore::from_pool(pool.clone());
        state_store.init().await.unwrap();
        let state = DiskStateStore::from_pool(pool.clone());
        let loadouts = Arc::new(SqliteLoadoutStore::from_pool(pool));

        let game_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let backup = Arc::new(LocalBackupStore::new(archive_dir.path()));

        let mut locations = LocationsRegister::new();
        locations.register(LocationId::from("game"), game_dir.path());

        let mut ignore = IgnoreSet::new();
        ignore.add_dir(game_path("Saves"));

        let engine = SyncEngine::new(
            FileHashCache::new(),
            state_store,
            loadouts.clone(),
            backup.clone(),
            locations,
            ignore,
        );

        Self {
            engine,
            loadouts,
            backup,
            state,
            game_dir,
            _archive_dir: archive_dir,
            staging_dir: tempdir().unwrap(),
        }
    }

    /// A scan of the game directory with `relative` marked as unreadable,
    /// the way a per-file I/O failure surfaces from the hash cache.
    async fn scan_with_failure(&self, relative: &str) -> (super::engine::ScanOutcome, FileEntry) {
        let mut scan = self.engine.scan_disk(&cancel()).await.unwrap();
        let failed = game_path(relative);
        let entry = scan.tree.remove(&failed).unwrap();
        scan.scanned -= 1;
        scan.failed_paths.insert(failed.clone());
        scan.failures.push(SyncFailure {
            path: failed.to_string(),
            error: "Input/output error".into(),
        });
        (scan, entry)
    }

    fn write_game_file(&self, relative: &str, contents: &[u8]) {
        let path = self.game_dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn read_game_file(&self, relative: &str) -> Option<Vec<u8>> {
        std::fs::read(self.game_dir.path().join(relative)).ok()
    }

    fn game_file_exists(&self, relative: &str) -> bool {
        self.game_dir.path().join(relative).exists()
    }

    /// Stages `contents` in the archive and returns the entry a loadout
    /// record for those bytes should carry.
    async fn seed_archive(&self, contents: &[u8]) -> FileEntry {
        let staged = self
            .staging_dir
            .path()
            .join(format!("seed-{}", contents.len()));
        std::fs::write(&staged, contents).unwrap();
        let hashed = FileHashCache::new().index_file(&staged).await.unwrap();
        self.backup
            .backup_files(
                vec![BackupRequest {
                    source: staged,
                    hash: hashed.entry.hash,
                    size: hashed.entry.size,
                }],
                true,
            )
            .await
            .unwrap();
        hashed.entry
    }

    async fn hash_of(&self, contents: &[u8]) -> Hash {
        let staged = self
            .staging_dir
            .path()
            .join(format!("hash-{}", contents.len()));
        std::fs::write(&staged, contents).unwrap();
        FileHashCache::new()
            .index_file(&staged)
            .await
            .unwrap()
            .entry
            .hash
    }
}

fn game_path(p: &str) -> GamePath {
    GamePath::new(LocationId::from("game"), p).unwrap()
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn create_loadout_adopts_and_archives_the_install() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    h.write_game_file("Data/Textures/t.dds", b"texture");
    h.write_game_file("Saves/slot1.ess", b"save game");

    let (loadout, summary) = h.engine.create_loadout("default", cancel()).await.unwrap();

    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.ignored, 1);
    assert_eq!(summary.backed_up, 2);

    let game_files = loadout.item_by_name(GAME_FILES_ITEM).unwrap();
    assert_eq!(game_files.files.len(), 2);
    assert!(game_files.files.contains_key(&game_path("Data/a.esp")));
    assert!(!game_files.files.contains_key(&game_path("Saves/slot1.ess")));

    for entry in game_files.files.values() {
        assert!(h.backup.have_file(entry.hash).await.unwrap());
    }
}

#[tokio::test]
async fn apply_is_a_noop_when_all_views_agree() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.copied, 0);
    assert_eq!(summary.removed, 0);
    assert_eq!(summary.ingested, 0);
    assert_eq!(summary.folded_removals, 0);
    assert_eq!(summary.warnings, 0);
    assert!(summary.failed.is_empty());
    assert_eq!(h.read_game_file("Data/a.esp").unwrap(), b"plugin a");

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    assert_eq!(reloaded, loadout);
}

#[tokio::test]
async fn apply_extracts_archived_loadout_files_to_disk() {
    let h = Harness::new().await;
    let (mut loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let entry = h.seed_archive(b"brand new plugin").await;
    loadout.items.push(Item {
        id: ItemId(2),
        name: "New Mod".into(),
        priority: 1,
        enabled: true,
        files: [(game_path("Data/b.esp"), entry)].into_iter().collect(),
    });
    h.loadouts.save_loadout(&loadout).await.unwrap();

    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.copied, 1);
    assert_eq!(h.read_game_file("Data/b.esp").unwrap(), b"brand new plugin");

    // The next apply sees disk == snapshot == loadout.
    let again = h.engine.apply(loadout.id, cancel()).await.unwrap();
    assert_eq!(again.copied, 0);
    assert_eq!(again.warnings, 0);
}

#[tokio::test]
async fn apply_deletes_dropped_files_and_cleans_empty_dirs() {
    let h = Harness::new().await;
    h.write_game_file("Data/Sub/x.esp", b"doomed");
    h.write_game_file("Data/a.esp", b"kept");
    let (mut loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let doomed_hash = h.hash_of(b"doomed").await;
    let item = loadout.item_mut(ItemId(1)).unwrap();
    item.files.remove(&game_path("Data/Sub/x.esp"));
    h.loadouts.save_loadout(&loadout).await.unwrap();

    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.removed, 1);
    assert!(!h.game_file_exists("Data/Sub/x.esp"));
    assert!(!h.game_file_exists("Data/Sub"));
    assert!(h.game_file_exists("Data/a.esp"));
    // The bytes survive in the archive.
    assert!(h.backup.have_file(doomed_hash).await.unwrap());
}

#[tokio::test]
async fn apply_swaps_in_the_updated_loadout_file() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"version 1");
    let (mut loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let updated = h.seed_archive(b"version 2").await;
    let item = loadout.item_mut(ItemId(1)).unwrap();
    item.files.insert(game_path("Data/a.esp"), updated);
    h.loadouts.save_loadout(&loadout).await.unwrap();

    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.copied, 1);
    assert_eq!(summary.removed, 0);
    assert_eq!(h.read_game_file("Data/a.esp").unwrap(), b"version 2");

    // The replaced bytes are still recoverable from the archive.
    assert!(h.backup.have_file(h.hash_of(b"version 1").await).await.unwrap());
}

#[tokio::test]
async fn apply_ingests_unknown_disk_files_into_a_synthetic_item() {
    let h = Harness::new().await;
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    h.write_game_file("Data/dropped_in.esp", b"hand installed");
    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.backed_up, 1);
    assert!(h.game_file_exists("Data/dropped_in.esp"));

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let external = reloaded.item_by_name(EXTERNAL_CHANGES_ITEM).unwrap();
    assert!(external.files.contains_key(&game_path("Data/dropped_in.esp")));
    assert!(h
        .backup
        .have_file(h.hash_of(b"hand installed").await)
        .await
        .unwrap());
}

#[tokio::test]
async fn apply_folds_external_edits_into_the_owning_item() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"original");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    h.write_game_file("Data/a.esp", b"edited by hand");
    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.ingested, 1);
    assert_eq!(h.read_game_file("Data/a.esp").unwrap(), b"edited by hand");

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let game_files = reloaded.item_by_name(GAME_FILES_ITEM).unwrap();
    assert_eq!(
        game_files.files[&game_path("Data/a.esp")].hash,
        h.hash_of(b"edited by hand").await
    );
    // No second item was invented for the edit.
    assert!(reloaded.item_by_name(EXTERNAL_CHANGES_ITEM).is_none());
}

#[tokio::test]
async fn apply_folds_external_deletes_into_the_loadout() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    h.write_game_file("Data/b.esp", b"plugin b");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    std::fs::remove_file(h.game_dir.path().join("Data/a.esp")).unwrap();
    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.folded_removals, 1);
    assert_eq!(summary.copied, 0);
    assert!(!h.game_file_exists("Data/a.esp"));

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let game_files = reloaded.item_by_name(GAME_FILES_ITEM).unwrap();
    assert!(!game_files.files.contains_key(&game_path("Data/a.esp")));
    assert!(game_files.files.contains_key(&game_path("Data/b.esp")));
}

#[tokio::test]
async fn ignored_paths_are_never_touched_in_either_direction() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    h.write_game_file("Saves/slot1.ess", b"precious save");
    let (mut loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    // A loadout record under an ignored directory must not be placed.
    let entry = h.seed_archive(b"should never land").await;
    let item = loadout.item_mut(ItemId(1)).unwrap();
    item.files.insert(game_path("Saves/injected.ess"), entry);
    h.loadouts.save_loadout(&loadout).await.unwrap();

    let summary = h.engine.apply(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.copied, 0);
    assert!(summary.ignored >= 2);
    assert!(!h.game_file_exists("Saves/injected.ess"));
    assert_eq!(h.read_game_file("Saves/slot1.ess").unwrap(), b"precious save");
}

#[tokio::test]
async fn ingest_folds_changes_without_touching_disk() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"version 1");
    let (mut loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    // A pending loadout record not yet applied to disk.
    let pending = h.seed_archive(b"pending plugin").await;
    let item = loadout.item_mut(ItemId(1)).unwrap();
    item.files.insert(game_path("Data/pending.esp"), pending);
    h.loadouts.save_loadout(&loadout).await.unwrap();

    h.write_game_file("Data/a.esp", b"version 2");
    h.write_game_file("Data/new.esp", b"hand installed");

    let summary = h.engine.ingest(loadout.id, cancel()).await.unwrap();

    assert_eq!(summary.ingested, 2);
    assert_eq!(summary.copied, 0);
    assert_eq!(summary.removed, 0);

    // Disk untouched: the pending file still is not there.
    assert!(!h.game_file_exists("Data/pending.esp"));
    assert_eq!(h.read_game_file("Data/a.esp").unwrap(), b"version 2");

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let game_files = reloaded.item_by_name(GAME_FILES_ITEM).unwrap();
    assert_eq!(
        game_files.files[&game_path("Data/a.esp")].hash,
        h.hash_of(b"version 2").await
    );
    assert!(game_files.files.contains_key(&game_path("Data/pending.esp")));
    let external = reloaded.item_by_name(EXTERNAL_CHANGES_ITEM).unwrap();
    assert!(external.files.contains_key(&game_path("Data/new.esp")));

    // Apply now places the pending record and settles everything.
    let applied = h.engine.apply(loadout.id, cancel()).await.unwrap();
    assert_eq!(applied.copied, 1);
    assert_eq!(h.read_game_file("Data/pending.esp").unwrap(), b"pending plugin");

    let settled = h.engine.apply(loadout.id, cancel()).await.unwrap();
    assert_eq!(settled.copied, 0);
    assert_eq!(settled.ingested, 0);
    assert_eq!(settled.removed, 0);
    assert_eq!(settled.warnings, 0);
}

#[tokio::test]
async fn ingest_twice_is_idempotent() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    h.write_game_file("Data/new.esp", b"hand installed");
    let first = h.engine.ingest(loadout.id, cancel()).await.unwrap();
    assert_eq!(first.ingested, 1);

    let after_first = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let second = h.engine.ingest(loadout.id, cancel()).await.unwrap();
    assert_eq!(second.ingested, 0);
    assert_eq!(second.folded_removals, 0);

    let after_second = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn missing_loadout_is_reported() {
    let h = Harness::new().await;
    let err = h.engine.apply(LoadoutId(404), cancel()).await.unwrap_err();
    assert!(matches!(err, EngineError::MissingLoadout(LoadoutId(404))));
}

#[tokio::test]
async fn cancellation_aborts_without_partial_commits() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = h.engine.apply(loadout.id, token).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    assert_eq!(reloaded, loadout);
}

#[tokio::test]
async fn apply_does_not_mistake_a_scan_failure_for_a_deletion() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    h.write_game_file("Data/b.esp", b"plugin b");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let (scan, previous) = h.scan_with_failure("Data/b.esp").await;
    let summary = h.engine.apply_scanned(loadout.id, scan, cancel()).await.unwrap();

    assert_eq!(summary.folded_removals, 0);
    assert_eq!(summary.removed, 0);
    assert_eq!(summary.failed.len(), 1);
    assert!(h.game_file_exists("Data/b.esp"));

    // The owning item keeps its record and the snapshot row is carried
    // forward unchanged.
    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let game_files = reloaded.item_by_name(GAME_FILES_ITEM).unwrap();
    assert!(game_files.files.contains_key(&game_path("Data/b.esp")));
    let snapshot = h.state.get_state(loadout.id).await.unwrap().unwrap();
    assert_eq!(snapshot.get(&game_path("Data/b.esp")), Some(&previous));

    // A clean scan settles back to a noop instead of re-adopting the file.
    let again = h.engine.apply(loadout.id, cancel()).await.unwrap();
    assert_eq!(again.ingested, 0);
    assert_eq!(again.folded_removals, 0);
    assert_eq!(again.copied, 0);
    let settled = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    assert!(settled.item_by_name(EXTERNAL_CHANGES_ITEM).is_none());
}

#[tokio::test]
async fn ingest_leaves_unreadable_paths_untouched() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    h.write_game_file("Data/b.esp", b"plugin b");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    h.write_game_file("Data/new.esp", b"hand installed");
    let (scan, previous) = h.scan_with_failure("Data/b.esp").await;
    let summary = h.engine.ingest_scanned(loadout.id, scan, cancel()).await.unwrap();

    // The readable new file still folds in; the unreadable one is neither
    // removed from its item nor dropped from the snapshot.
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.folded_removals, 0);

    let reloaded = h.loadouts.load_loadout(loadout.id).await.unwrap().unwrap();
    let game_files = reloaded.item_by_name(GAME_FILES_ITEM).unwrap();
    assert!(game_files.files.contains_key(&game_path("Data/b.esp")));
    let snapshot = h.state.get_state(loadout.id).await.unwrap().unwrap();
    assert_eq!(snapshot.get(&game_path("Data/b.esp")), Some(&previous));
}

#[test]
fn only_transient_io_errors_qualify_for_scan_retries() {
    use std::io;

    let transient = CacheError::Io {
        path: "Data/a.esp".into(),
        source: io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
    };
    assert!(transient_scan_error(&transient));

    let permanent = CacheError::Io {
        path: "Data/a.esp".into(),
        source: io::Error::new(io::ErrorKind::NotFound, "gone"),
    };
    assert!(!transient_scan_error(&permanent));
    assert!(!transient_scan_error(&CacheError::Cancelled));
}

#[tokio::test]
async fn concurrent_syncs_on_one_loadout_serialize() {
    let h = Harness::new().await;
    h.write_game_file("Data/a.esp", b"plugin a");
    let (loadout, _) = h.engine.create_loadout("default", cancel()).await.unwrap();

    let (first, second) = tokio::join!(
        h.engine.apply(loadout.id, cancel()),
        h.engine.apply(loadout.id, cancel()),
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(h.read_game_file("Data/a.esp").unwrap(), b"plugin a");
}

/// A backup store that accepts everything and stores nothing, for driving
/// the safety invariant.
struct AmnesiacBackupStore;

#[async_trait]
impl BackupStore for AmnesiacBackupStore {
    async fn have_file(&self, _hash: Hash) -> Result<bool, BackupError> {
        Ok(false)
    }

    async fn backup_files(
        &self,
        _requests: Vec<BackupRequest>,
        _deduplicate: bool,
    ) -> Result<(), BackupError> {
        Ok(())
    }

    async fn extract_file(&self, hash: Hash, _target: &Path) -> Result<(), BackupError> {
        Err(BackupError::MissingContent(hash))
    }
}

#[tokio::test]
async fn destructive_actions_require_archived_bytes() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let state_store = DiskStateStore::from_pool(pool.clone());
    state_store.init().await.unwrap();
    let loadouts = Arc::new(SqliteLoadoutStore::from_pool(pool));

    let game_dir = tempdir().unwrap();
    std::fs::create_dir_all(game_dir.path().join("Data")).unwrap();
    std::fs::write(game_dir.path().join("Data/a.esp"), b"only copy").unwrap();

    let mut locations = LocationsRegister::new();
    locations.register(LocationId::from("game"), game_dir.path());

    let engine = SyncEngine::new(
        FileHashCache::new(),
        state_store,
        loadouts.clone(),
        Arc::new(AmnesiacBackupStore),
        locations,
        IgnoreSet::new(),
    );

    let (mut loadout, _) = engine.create_loadout("default", cancel()).await.unwrap();
    let item = loadout.item_mut(ItemId(1)).unwrap();
    item.files = BTreeMap::new();
    loadouts.save_loadout(&loadout).await.unwrap();

    // The loadout dropped the file, but its bytes were never truly archived:
    // the engine must refuse to delete it.
    let err = engine.apply(loadout.id, cancel()).await.unwrap_err();
    assert!(matches!(err, EngineError::BackupUnavailable { .. }));
    assert!(game_dir.path().join("Data/a.esp").exists());
}
