//! The ingest/apply tree pipeline.
//!
//! Five pure functions shuttle state between its representations:
//! loadout -> flattened -> placement for the apply direction, and
//! disk -> diff -> flattened -> loadout for the ingest direction. None of
//! them touch the filesystem; the engine owns all I/O.

use std::collections::BTreeMap;

use crate::loadout::{Item, ItemId, Loadout};
use crate::path::GamePath;
use crate::tree::{
    DiskChange, DiskDiff, DiskStateTree, FileEntry, FileSource, FileTree, FlattenedLoadout,
    ItemFile,
};

/// Collapses a loadout into at most one winning attribution per path.
///
/// Disabled items contribute nothing. Collisions go to the highest
/// `priority`; ties go to the newest `ItemId`.
pub fn flatten_loadout(loadout: &Loadout) -> FlattenedLoadout {
    let rank: BTreeMap<ItemId, (i64, ItemId)> = loadout
        .items
        .iter()
        .map(|item| (item.id, (item.priority, item.id)))
        .collect();

    let mut flattened = FlattenedLoadout::new();
    for item in loadout.items.iter().filter(|item| item.enabled) {
        for (path, entry) in &item.files {
            let candidate = ItemFile {
                item: item.id,
                entry: *entry,
            };
            match flattened.get(path) {
                Some(existing) if rank[&existing.item] >= rank[&item.id] => {}
                _ => flattened.insert(path.clone(), candidate),
            }
        }
    }
    flattened
}

/// Turns the item assignment into a proposed placement, sourcing each path
/// from disk when the right bytes already sit there and from the content
/// archive otherwise.
pub fn flattened_to_file_tree(flattened: &FlattenedLoadout, disk: &DiskStateTree) -> FileTree {
    FileTree::from_entries(flattened.iter().map(|(path, file)| {
        let source = match disk.get(path) {
            Some(entry) if entry.hash == file.entry.hash => FileSource::Disk(*entry),
            _ => FileSource::Archive(file.entry),
        };
        (path.clone(), source)
    }))
}

/// Classifies the fresh disk scan against the previous snapshot.
///
/// A path missing from the snapshot but matching the previous placement is
/// still `Unchanged`: the placement was applied, only the snapshot row was
/// lost.
pub fn disk_to_file_tree(
    disk: &DiskStateTree,
    prev_placement: &FileTree,
    prev_disk: &DiskStateTree,
) -> DiskDiff {
    let mut changes = BTreeMap::new();

    for (path, current) in disk.iter() {
        let change = match prev_disk.get(path) {
            Some(previous) if previous.hash == current.hash => DiskChange::Unchanged(*current),
            Some(previous) => DiskChange::Modified {
                previous: *previous,
                current: *current,
            },
            None => match prev_placement.get(path) {
                Some(placed) if placed.entry().hash == current.hash => {
                    DiskChange::Unchanged(*current)
                }
                _ => DiskChange::Added(*current),
            },
        };
        changes.insert(path.clone(), change);
    }

    for (path, previous) in prev_disk.iter() {
        if !disk.contains(path) {
            changes.insert(path.clone(), DiskChange::Deleted { previous: *previous });
        }
    }

    DiskDiff::from_entries(changes)
}

/// The loadout-side edits implied by a disk diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestPlan {
    /// Winning attributions after the plan is applied. Paths in `new_files`
    /// are absent until they receive an item.
    pub flattened: FlattenedLoadout,
    /// Existing attributions whose entry changed on disk.
    pub updates: Vec<(ItemId, GamePath, FileEntry)>,
    /// Attributions whose file vanished from disk.
    pub removals: Vec<(ItemId, GamePath)>,
    /// Paths nothing attributes yet; they go to the synthetic item.
    pub new_files: Vec<(GamePath, FileEntry)>,
}

impl IngestPlan {
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.removals.is_empty() && self.new_files.is_empty()
    }
}

/// Re-attributes a classified disk diff: unchanged and edited paths keep
/// their previous attribution, vanished paths lose it, and unattributed new
/// paths are collected for the synthetic item.
pub fn file_tree_to_flattened(diff: &DiskDiff, prev: &FlattenedLoadout) -> IngestPlan {
    let mut plan = IngestPlan {
        flattened: prev.clone(),
        ..IngestPlan::default()
    };

    for (path, change) in diff.iter() {
        match (change.current(), prev.get(path)) {
            (Some(current), Some(attr)) => {
                if attr.entry.hash != current.hash {
                    plan.updates.push((attr.item, path.clone(), current));
                }
                plan.flattened.insert(
                    path.clone(),
                    ItemFile {
                        item: attr.item,
                        entry: current,
                    },
                );
            }
            (Some(current), None) => plan.new_files.push((path.clone(), current)),
            (None, Some(attr)) => {
                plan.removals.push((attr.item, path.clone()));
                plan.flattened.remove(path);
            }
            (None, None) => {}
        }
    }

    plan
}

/// Commits an ingest plan back onto the loadout.
///
/// Updates and removals touch only the owning item, so attributions shadowed
/// by a higher-priority item are left alone. New files land in one synthetic
/// item that is created on first use and reused afterwards, with a priority
/// above every existing item so external edits keep winning.
pub fn flattened_to_loadout(
    plan: &IngestPlan,
    prev: &Loadout,
    synthetic_item_name: &str,
) -> Loadout {
    let mut loadout = prev.clone();

    for (item_id, path, entry) in &plan.updates {
        if let Some(item) = loadout.item_mut(*item_id) {
            item.files.insert(path.clone(), *entry);
        }
    }
    for (item_id, path) in &plan.removals {
        if let Some(item) = loadout.item_mut(*item_id) {
            item.files.remove(path);
        }
    }

    if !plan.new_files.is_empty() {
        let synthetic_id = match loadout
            .items
            .iter()
            .find(|item| item.enabled && item.name == synthetic_item_name)
        {
            Some(item) => item.id,
            None => {
                let id = loadout.next_item_id();
                let priority = loadout
                    .items
                    .iter()
                    .map(|item| item.priority + 1)
                    .max()
                    .unwrap_or(0);
                loadout.items.push(Item {
                    id,
                    name: synthetic_item_name.to_string(),
                    priority,
                    enabled: true,
                    files: BTreeMap::new(),
                });
                id
            }
        };
        let item = loadout
            .item_mut(synthetic_id)
            .expect("synthetic item just resolved");
        for (path, entry) in &plan.new_files {
            item.files.insert(path.clone(), *entry);
        }
    }

    loadout
}
