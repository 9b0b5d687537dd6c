mod loadout;
mod path;
mod signature;
mod transform;
mod tree;

pub use loadout::{Item, ItemId, Loadout, LoadoutId};
pub use path::{GamePath, IgnoreSet, LocationId, PathError};
pub use signature::{Actions, Signature, SignatureBuilder, map_actions};
pub use transform::{
    IngestPlan, disk_to_file_tree, file_tree_to_flattened, flatten_loadout, flattened_to_file_tree,
    flattened_to_loadout,
};
pub use tree::{
    DiskChange, DiskDiff, DiskStateTree, FileEntry, FileSource, FileTree, FlattenedLoadout, Hash,
    ItemFile, SnapshotRecord,
};
