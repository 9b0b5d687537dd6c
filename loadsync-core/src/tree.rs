use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::loadout::ItemId;
use crate::path::{GamePath, LocationId, PathError};

/// xxHash64 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub u64);

impl Hash {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What we know about one file's content: digest, byte length, and the unix
/// mtime (seconds) observed when it was hashed. Never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub hash: Hash,
    pub size: u64,
    pub modified: i64,
}

/// One row of the persisted snapshot wire format:
/// `(location, path, hash, size, modified)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord(pub String, pub String, pub u64, pub u64, pub i64);

/// The last-synced view of the disk, one per loadout. Replaced wholesale at
/// the end of each successful sync, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStateTree {
    entries: BTreeMap<GamePath, FileEntry>,
}

impl DiskStateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (GamePath, FileEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &GamePath) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &GamePath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: GamePath, entry: FileEntry) {
        self.entries.insert(path, entry);
    }

    pub fn remove(&mut self, path: &GamePath) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GamePath, &FileEntry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &GamePath> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_records(&self) -> Vec<SnapshotRecord> {
        self.entries
            .iter()
            .map(|(path, entry)| {
                SnapshotRecord(
                    path.location().as_str().to_string(),
                    path.path().to_string(),
                    entry.hash.as_u64(),
                    entry.size,
                    entry.modified,
                )
            })
            .collect()
    }

    pub fn from_records(
        records: impl IntoIterator<Item = SnapshotRecord>,
    ) -> Result<Self, PathError> {
        let mut entries = BTreeMap::new();
        for SnapshotRecord(location, path, hash, size, modified) in records {
            let path = GamePath::new(LocationId::new(location), path)?;
            entries.insert(
                path,
                FileEntry {
                    hash: Hash(hash),
                    size,
                    modified,
                },
            );
        }
        Ok(Self { entries })
    }
}

impl FromIterator<(GamePath, FileEntry)> for DiskStateTree {
    fn from_iter<T: IntoIterator<Item = (GamePath, FileEntry)>>(iter: T) -> Self {
        Self::from_entries(iter)
    }
}

/// Where the bytes for a placed file come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    /// Already on disk at the target path.
    Disk(FileEntry),
    /// Available from the content backup store.
    Archive(FileEntry),
}

impl FileSource {
    pub fn entry(&self) -> FileEntry {
        match self {
            FileSource::Disk(entry) | FileSource::Archive(entry) => *entry,
        }
    }
}

/// Proposed placement: which file should sit at each path and where its bytes
/// come from. Ephemeral, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    entries: BTreeMap<GamePath, FileSource>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (GamePath, FileSource)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &GamePath) -> Option<&FileSource> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GamePath, &FileSource)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The winning attribution for one path after flattening a loadout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemFile {
    pub item: ItemId,
    pub entry: FileEntry,
}

/// Item assignment: at most one winning `(item, entry)` per path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenedLoadout {
    entries: BTreeMap<GamePath, ItemFile>,
}

impl FlattenedLoadout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (GamePath, ItemFile)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &GamePath) -> Option<&ItemFile> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: GamePath, file: ItemFile) {
        self.entries.insert(path, file);
    }

    pub fn remove(&mut self, path: &GamePath) -> Option<ItemFile> {
        self.entries.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GamePath, &ItemFile)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How one path changed on disk since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskChange {
    Unchanged(FileEntry),
    Modified {
        previous: FileEntry,
        current: FileEntry,
    },
    Deleted {
        previous: FileEntry,
    },
    Added(FileEntry),
}

impl DiskChange {
    /// The entry currently on disk, if the file still exists.
    pub fn current(&self) -> Option<FileEntry> {
        match self {
            DiskChange::Unchanged(entry) | DiskChange::Added(entry) => Some(*entry),
            DiskChange::Modified { current, .. } => Some(*current),
            DiskChange::Deleted { .. } => None,
        }
    }
}

/// Classified diff of the disk against the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskDiff {
    entries: BTreeMap<GamePath, DiskChange>,
}

impl DiskDiff {
    pub fn from_entries(entries: impl IntoIterator<Item = (GamePath, DiskChange)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &GamePath) -> Option<&DiskChange> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GamePath, &DiskChange)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> GamePath {
        GamePath::new(LocationId::from("game"), p).unwrap()
    }

    fn entry(hash: u64) -> FileEntry {
        FileEntry {
            hash: Hash(hash),
            size: 10,
            modified: 1_700_000_000,
        }
    }

    #[test]
    fn hash_displays_as_padded_hex() {
        assert_eq!(Hash(0xdead_beef).to_string(), "00000000deadbeef");
    }

    #[test]
    fn snapshot_records_round_trip() {
        let tree = DiskStateTree::from_entries([
            (path("Data/a.esp"), entry(1)),
            (path("Data/b.esp"), entry(2)),
        ]);

        let records = tree.to_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, "Data/a.esp");

        let restored = DiskStateTree::from_records(records).unwrap();
        assert_eq!(restored, tree);
    }

    #[test]
    fn snapshot_records_serialize_as_tuples() {
        let tree = DiskStateTree::from_entries([(path("Data/a.esp"), entry(3))]);
        let json = serde_json::to_string(&tree.to_records()).unwrap();
        assert_eq!(json, r#"[["game","Data/a.esp",3,10,1700000000]]"#);
    }

    #[test]
    fn from_records_rejects_escaping_paths() {
        let bad = SnapshotRecord("game".into(), "../../etc/passwd".into(), 1, 2, 3);
        assert!(DiskStateTree::from_records([bad]).is_err());
    }
}
