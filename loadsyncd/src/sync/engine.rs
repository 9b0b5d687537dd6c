use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loadsync_core::{
    Actions, DiskStateTree, FileEntry, FlattenedLoadout, GamePath, Hash, IgnoreSet, Item, ItemId,
    ItemFile, Loadout, LoadoutId, SignatureBuilder, disk_to_file_tree, file_tree_to_flattened,
    flatten_loadout, flattened_to_file_tree, flattened_to_loadout, map_actions,
};

use super::backup::{BackupError, BackupRequest, BackupStore};
use super::hash_cache::{CacheError, CachedEntry, FileHashCache};
use super::loadout_store::{LoadoutStore, LoadoutStoreError};
use super::locations::{LocationsError, LocationsRegister};
use super::retry::{RetryPolicy, is_transient, with_retry, with_retry_if};
use super::state_store::{DiskStateStore, StateStoreError};

/// Synthetic item that absorbs files the user dropped into the game folders.
pub const EXTERNAL_CHANGES_ITEM: &str = "External Changes";
/// Item holding the unmanaged files found when a loadout is first created.
pub const GAME_FILES_ITEM: &str = "Game Files";

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("hash cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("state store error: {0}")]
    State(#[from] StateStoreError),
    #[error("loadout store error: {0}")]
    Loadout(#[from] LoadoutStoreError),
    #[error("backup store error: {0}")]
    Backup(#[from] BackupError),
    #[error("locations error: {0}")]
    Locations(#[from] LocationsError),
    #[error("loadout {0} does not exist")]
    MissingLoadout(LoadoutId),
    #[error("refusing to destroy the only copy of {path} (hash {hash})")]
    BackupUnavailable { path: GamePath, hash: Hash },
    #[error("sync was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub path: String,
    pub error: String,
}

/// What one sync run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    /// Files hashed during the scan.
    pub scanned: u64,
    /// Files written to disk from the archive.
    pub copied: u64,
    /// Files deleted from disk.
    pub removed: u64,
    /// External files or edits folded into the loadout.
    pub ingested: u64,
    /// Loadout file records dropped because their file vanished from disk.
    pub folded_removals: u64,
    /// Files newly archived in the backup store.
    pub backed_up: u64,
    /// Paths skipped by the ignore list.
    pub ignored: u64,
    /// Paths that could not be reconciled and were left alone.
    pub warnings: u64,
    /// Per-path failures that did not abort the sync.
    pub failed: Vec<SyncFailure>,
}

/// Everything the engine knows about one path before deciding what to do.
#[derive(Debug, Clone, Copy, Default)]
struct SyncNode {
    disk: Option<FileEntry>,
    prev: Option<FileEntry>,
    desired: Option<ItemFile>,
}

pub(crate) struct ScanOutcome {
    pub(crate) tree: DiskStateTree,
    pub(crate) scanned: u64,
    pub(crate) ignored: u64,
    pub(crate) failures: Vec<SyncFailure>,
    /// Paths the scan could not hash. They carry no disk entry, which must
    /// never be read as a deletion.
    pub(crate) failed_paths: BTreeSet<GamePath>,
}

/// Reconciles disk, previous snapshot, and loadout for one game install.
///
/// Syncs on the same loadout are serialized; different loadouts only share
/// the hash cache and the stores.
pub struct SyncEngine {
    hash_cache: FileHashCache,
    state_store: DiskStateStore,
    loadouts: Arc<dyn LoadoutStore>,
    backup: Arc<dyn BackupStore>,
    locations: LocationsRegister,
    ignore: IgnoreSet,
    retry: RetryPolicy,
    progress: Option<ProgressFn>,
    sync_locks: StdMutex<HashMap<LoadoutId, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        hash_cache: FileHashCache,
        state_store: DiskStateStore,
        loadouts: Arc<dyn LoadoutStore>,
        backup: Arc<dyn BackupStore>,
        locations: LocationsRegister,
        ignore: IgnoreSet,
    ) -> Self {
        Self {
            hash_cache,
            state_store,
            loadouts,
            backup,
            locations,
            ignore,
            retry: RetryPolicy::default(),
            progress: None,
            sync_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Pushes the loadout onto disk, folding external changes back in along
    /// the way. The stored snapshot is replaced only after the loadout
    /// commit succeeds.
    pub async fn apply(
        &self,
        loadout_id: LoadoutId,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, EngineError> {
        let _guard = self.lock_loadout(loadout_id).await;
        let scan = self.scan_disk(&cancel).await?;
        self.apply_scanned(loadout_id, scan, cancel).await
    }

    pub(crate) async fn apply_scanned(
        &self,
        loadout_id: LoadoutId,
        scan: ScanOutcome,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, EngineError> {
        let mut loadout = self
            .loadouts
            .load_loadout(loadout_id)
            .await?
            .ok_or(EngineError::MissingLoadout(loadout_id))?;

        let prev = self
            .state_store
            .get_state(loadout_id)
            .await?
            .unwrap_or_default();
        let flattened = flatten_loadout(&loadout);

        let mut summary = SyncSummary {
            scanned: scan.scanned,
            ignored: scan.ignored,
            failed: scan.failures,
            ..SyncSummary::default()
        };

        let nodes = merge_views(&scan.tree, &prev, &flattened);
        let archived = self.archived_hashes(&nodes).await?;

        let mut decisions = Vec::with_capacity(nodes.len());
        for (path, node) in nodes {
            if scan.failed_paths.contains(&path) {
                // An unread file gives no facts to decide on; leave the
                // path for the next sync.
                continue;
            }
            let ignored = self.ignore.is_ignored(&path);
            let signature = SignatureBuilder {
                disk_hash: node.disk.map(|e| e.hash),
                prev_hash: node.prev.map(|e| e.hash),
                loadout_hash: node.desired.map(|d| d.entry.hash),
                disk_archived: node.disk.is_some_and(|e| archived[&e.hash]),
                prev_archived: node.prev.is_some_and(|e| archived[&e.hash]),
                loadout_archived: node.desired.is_some_and(|d| archived[&d.entry.hash]),
                path_is_ignored: ignored,
            }
            .build();
            let actions = map_actions(signature);
            if ignored && node.disk.is_none() {
                // Disk-side ignored paths were already counted by the scan.
                summary.ignored += 1;
            }
            debug!(%path, ?actions, "decided");
            decisions.push((path, node, actions));
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Backups run first so nothing below can destroy unarchived bytes.
        let mut backup_requests = Vec::new();
        let mut backed_up = BTreeSet::new();
        for (path, node, actions) in &decisions {
            if actions.contains(Actions::BACKUP_FILE)
                && let Some(entry) = node.disk
            {
                backup_requests.push(BackupRequest {
                    source: self.locations.resolve(path)?,
                    hash: entry.hash,
                    size: entry.size,
                });
                backed_up.insert(entry.hash);
            }
        }
        summary.backed_up = backed_up.len() as u64;
        self.backup.backup_files(backup_requests, true).await?;

        // Trust nothing: re-verify the archive before destroying bytes.
        for (path, node, actions) in &decisions {
            if actions.contains(Actions::DELETE_FROM_DISK)
                && let Some(entry) = node.disk
                && !archived[&entry.hash]
                && !self.backup.have_file(entry.hash).await?
            {
                return Err(EngineError::BackupUnavailable {
                    path: path.clone(),
                    hash: entry.hash,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Loadout-side actions.
        let mut loadout_changed = false;
        for (path, node, actions) in &decisions {
            if actions.contains(Actions::INGEST_FROM_DISK)
                && let Some(entry) = node.disk
            {
                let item_id = match node.desired {
                    Some(desired) => desired.item,
                    None => synthetic_item(&mut loadout, EXTERNAL_CHANGES_ITEM),
                };
                if let Some(item) = loadout.item_mut(item_id) {
                    item.files.insert(path.clone(), entry);
                    summary.ingested += 1;
                    loadout_changed = true;
                }
            }
            if actions.contains(Actions::REMOVE_FROM_LOADOUT)
                && let Some(desired) = node.desired
                && let Some(item) = loadout.item_mut(desired.item)
                && item.files.remove(path).is_some()
            {
                summary.folded_removals += 1;
                loadout_changed = true;
            }
            if actions.contains(Actions::WARN_UNABLE_TO_EXTRACT) {
                warn!(%path, "no archived bytes to place this file");
                summary.warnings += 1;
            }
            if actions.contains(Actions::WARN_CONFLICT) {
                warn!(%path, "disk, snapshot, and loadout all disagree");
                summary.warnings += 1;
            }
        }

        // Disk-side actions.
        let mut new_disk = scan.tree.clone();
        carry_forward_failed(&mut new_disk, &scan.failed_paths, &prev);
        let mut removed_paths = Vec::new();
        for (path, node, actions) in &decisions {
            let mut path_failed = false;
            if actions.contains(Actions::DELETE_FROM_DISK) {
                let absolute = self.locations.resolve(path)?;
                let outcome =
                    with_retry(&self.retry, || tokio::fs::remove_file(&absolute)).await;
                match outcome {
                    Ok(()) => {
                        new_disk.remove(path);
                        removed_paths.push(path.clone());
                        if !actions.contains(Actions::EXTRACT_TO_DISK) {
                            summary.removed += 1;
                        }
                    }
                    Err(err) => {
                        summary.failed.push(SyncFailure {
                            path: path.to_string(),
                            error: err.to_string(),
                        });
                        path_failed = true;
                    }
                }
            }
            if actions.contains(Actions::EXTRACT_TO_DISK) && !path_failed {
                let Some(desired) = node.desired else {
                    continue;
                };
                match self.extract_one(path, desired.entry).await {
                    Ok(placed) => {
                        new_disk.insert(path.clone(), placed);
                        summary.copied += 1;
                    }
                    Err(err) => summary.failed.push(SyncFailure {
                        path: path.to_string(),
                        error: err.to_string(),
                    }),
                }
            }
        }

        self.clean_empty_dirs(&removed_paths, &new_disk).await;

        if loadout_changed {
            self.loadouts.save_loadout(&loadout).await?;
        }
        self.state_store.save_state(loadout_id, &new_disk).await?;

        info!(
            loadout = %loadout_id,
            copied = summary.copied,
            removed = summary.removed,
            ingested = summary.ingested,
            "apply finished"
        );
        Ok(summary)
    }

    /// Folds external disk changes into the loadout without touching disk.
    /// Loadout entries not yet applied stay pending; the snapshot becomes
    /// the fresh scan (with unread paths carried forward) so the next apply
    /// still sees pending entries as missing.
    pub async fn ingest(
        &self,
        loadout_id: LoadoutId,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, EngineError> {
        let _guard = self.lock_loadout(loadout_id).await;
        let scan = self.scan_disk(&cancel).await?;
        self.ingest_scanned(loadout_id, scan, cancel).await
    }

    pub(crate) async fn ingest_scanned(
        &self,
        loadout_id: LoadoutId,
        scan: ScanOutcome,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, EngineError> {
        let loadout = self
            .loadouts
            .load_loadout(loadout_id)
            .await?
            .ok_or(EngineError::MissingLoadout(loadout_id))?;

        let prev_disk = self
            .state_store
            .get_state(loadout_id)
            .await?
            .unwrap_or_default();

        let mut disk_view = scan.tree.clone();
        carry_forward_failed(&mut disk_view, &scan.failed_paths, &prev_disk);

        let flattened = flatten_loadout(&loadout);
        let placement = flattened_to_file_tree(&flattened, &disk_view);
        let diff = disk_to_file_tree(&disk_view, &placement, &prev_disk);
        let plan = file_tree_to_flattened(&diff, &flattened);

        let mut summary = SyncSummary {
            scanned: scan.scanned,
            ignored: scan.ignored,
            failed: scan.failures,
            ..SyncSummary::default()
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Archive the bytes being folded in before they can be lost.
        let mut to_backup: BTreeMap<Hash, (GamePath, u64)> = BTreeMap::new();
        for (path, entry) in &plan.new_files {
            to_backup.insert(entry.hash, (path.clone(), entry.size));
        }
        for (_, path, entry) in &plan.updates {
            to_backup.insert(entry.hash, (path.clone(), entry.size));
        }
        let mut requests = Vec::new();
        for (hash, (path, size)) in to_backup {
            if self.backup.have_file(hash).await? {
                continue;
            }
            requests.push(BackupRequest {
                source: self.locations.resolve(&path)?,
                hash,
                size,
            });
        }
        summary.backed_up = requests.len() as u64;
        self.backup.backup_files(requests, true).await?;

        for (_, path) in &plan.removals {
            if let Some(attr) = flattened.get(path)
                && !self.backup.have_file(attr.entry.hash).await?
            {
                warn!(%path, "folding a deletion whose bytes were never archived");
                summary.warnings += 1;
            }
        }

        summary.ingested = (plan.updates.len() + plan.new_files.len()) as u64;
        summary.folded_removals = plan.removals.len() as u64;

        let new_loadout = flattened_to_loadout(&plan, &loadout, EXTERNAL_CHANGES_ITEM);
        if new_loadout != loadout {
            self.loadouts.save_loadout(&new_loadout).await?;
        }
        self.state_store.save_state(loadout_id, &disk_view).await?;

        info!(
            loadout = %loadout_id,
            ingested = summary.ingested,
            folded = summary.folded_removals,
            "ingest finished"
        );
        Ok(summary)
    }

    /// Scans the managed locations, adopts every file into a fresh loadout,
    /// and archives the lot. This is the baseline later syncs diff against.
    pub async fn create_loadout(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(Loadout, SyncSummary), EngineError> {
        let scan = self.scan_disk(&cancel).await?;

        let mut loadout = self.loadouts.create_loadout(name).await?;
        loadout.items.push(Item {
            id: ItemId(1),
            name: GAME_FILES_ITEM.to_string(),
            priority: 0,
            enabled: true,
            files: scan.tree.iter().map(|(p, e)| (p.clone(), *e)).collect(),
        });

        let mut summary = SyncSummary {
            scanned: scan.scanned,
            ignored: scan.ignored,
            failed: scan.failures,
            ..SyncSummary::default()
        };

        let mut requests = Vec::new();
        let mut seen = BTreeSet::new();
        for (path, entry) in scan.tree.iter() {
            if !seen.insert(entry.hash) || self.backup.have_file(entry.hash).await? {
                continue;
            }
            requests.push(BackupRequest {
                source: self.locations.resolve(path)?,
                hash: entry.hash,
                size: entry.size,
            });
        }
        summary.backed_up = requests.len() as u64;
        self.backup.backup_files(requests, true).await?;

        self.loadouts.save_loadout(&loadout).await?;
        self.state_store.save_state(loadout.id, &scan.tree).await?;

        info!(loadout = %loadout.id, files = scan.scanned, "loadout created");
        Ok((loadout, summary))
    }

    pub(crate) async fn scan_disk(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, EngineError> {
        let roots: Vec<PathBuf> = self
            .locations
            .roots()
            .map(|(_, root)| root.to_path_buf())
            .collect();

        let mut outcome = ScanOutcome {
            tree: DiskStateTree::new(),
            scanned: 0,
            ignored: 0,
            failures: Vec::new(),
            failed_paths: BTreeSet::new(),
        };

        let mut stream = self.hash_cache.index_folders(roots, cancel.clone());
        while let Some(result) = stream.next().await {
            let result = match result {
                Err(CacheError::Io { path, source }) if is_transient(&source) => {
                    with_retry_if(&self.retry, transient_scan_error, || {
                        self.hash_cache.index_file(&path)
                    })
                    .await
                }
                other => other,
            };
            match result {
                Ok(hashed) => {
                    let Some(game_path) = self.locations.to_game_path(&hashed.path) else {
                        continue;
                    };
                    if self.ignore.is_ignored(&game_path) {
                        outcome.ignored += 1;
                        continue;
                    }
                    outcome.tree.insert(game_path, hashed.entry);
                    outcome.scanned += 1;
                    if let Some(progress) = &self.progress {
                        progress(outcome.scanned);
                    }
                }
                Err(CacheError::Cancelled) => return Err(EngineError::Cancelled),
                Err(CacheError::Io { path, source }) => {
                    if let Some(game_path) = self.locations.to_game_path(&path) {
                        outcome.failed_paths.insert(game_path);
                    }
                    outcome.failures.push(SyncFailure {
                        path: path.display().to_string(),
                        error: source.to_string(),
                    });
                }
                Err(err) => {
                    outcome.failures.push(SyncFailure {
                        path: String::new(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn archived_hashes(
        &self,
        nodes: &BTreeMap<GamePath, SyncNode>,
    ) -> Result<HashMap<Hash, bool>, EngineError> {
        let mut hashes = BTreeSet::new();
        for node in nodes.values() {
            hashes.extend(node.disk.map(|e| e.hash));
            hashes.extend(node.prev.map(|e| e.hash));
            hashes.extend(node.desired.map(|d| d.entry.hash));
        }
        let mut archived = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            archived.insert(hash, self.backup.have_file(hash).await?);
        }
        Ok(archived)
    }

    async fn extract_one(
        &self,
        path: &GamePath,
        entry: FileEntry,
    ) -> Result<FileEntry, EngineError> {
        let absolute = self.locations.resolve(path)?;
        with_retry_if(
            &self.retry,
            |err: &BackupError| matches!(err, BackupError::Io { source, .. } if is_transient(source)),
            || self.backup.extract_file(entry.hash, &absolute),
        )
        .await?;

        let meta = tokio::fs::metadata(&absolute)
            .await
            .map_err(|source| CacheError::Io {
                path: absolute.clone(),
                source,
            })?;
        let placed = FileEntry {
            hash: entry.hash,
            size: meta.len(),
            modified: meta
                .modified()
                .map(system_time_secs)
                .unwrap_or(entry.modified),
        };
        self.hash_cache.put_cached([(
            absolute,
            CachedEntry {
                hash: placed.hash,
                size: placed.size,
                modified: placed.modified,
            },
        )]);
        Ok(placed)
    }

    /// Removes directories that deletions emptied, walking up until a
    /// non-empty parent or the location root.
    async fn clean_empty_dirs(&self, removed: &[GamePath], remaining: &DiskStateTree) {
        let mut dirs = BTreeSet::new();
        for path in removed {
            let mut current = path.parent();
            while let Some(dir) = current {
                current = dir.parent();
                dirs.insert(dir);
            }
        }
        // Deepest first, so parents empty out as children go.
        for dir in dirs.iter().rev() {
            if remaining.paths().any(|path| path.is_under(dir)) {
                continue;
            }
            let Ok(absolute) = self.locations.resolve(dir) else {
                continue;
            };
            // Fails on non-empty directories, which is exactly the guard
            // we want for unmanaged files.
            let _ = tokio::fs::remove_dir(&absolute).await;
        }
    }

    async fn lock_loadout(&self, loadout_id: LoadoutId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.sync_locks.lock().expect("sync locks");
            locks
                .entry(loadout_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Reconciles unread paths as if nothing changed: the previous snapshot
/// entry is carried forward, so a failed read never turns into a deletion
/// on either side.
fn carry_forward_failed(
    tree: &mut DiskStateTree,
    failed: &BTreeSet<GamePath>,
    prev: &DiskStateTree,
) {
    for path in failed {
        if let Some(entry) = prev.get(path) {
            tree.insert(path.clone(), *entry);
        }
    }
}

pub(crate) fn transient_scan_error(err: &CacheError) -> bool {
    matches!(err, CacheError::Io { source, .. } if is_transient(source))
}

fn merge_views(
    disk: &DiskStateTree,
    prev: &DiskStateTree,
    flattened: &FlattenedLoadout,
) -> BTreeMap<GamePath, SyncNode> {
    let mut nodes: BTreeMap<GamePath, SyncNode> = BTreeMap::new();
    for (path, entry) in disk.iter() {
        nodes.entry(path.clone()).or_default().disk = Some(*entry);
    }
    for (path, entry) in prev.iter() {
        nodes.entry(path.clone()).or_default().prev = Some(*entry);
    }
    for (path, file) in flattened.iter() {
        nodes.entry(path.clone()).or_default().desired = Some(*file);
    }
    nodes
}

fn synthetic_item(loadout: &mut Loadout, name: &str) -> ItemId {
    if let Some(item) = loadout
        .items
        .iter()
        .find(|item| item.enabled && item.name == name)
    {
        return item.id;
    }
    let id = loadout.next_item_id();
    let priority = loadout
        .items
        .iter()
        .map(|item| item.priority + 1)
        .max()
        .unwrap_or(0);
    loadout.items.push(Item {
        id,
        name: name.to_string(),
        priority,
        enabled: true,
        files: BTreeMap::new(),
    });
    id
}

fn system_time_secs(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}
