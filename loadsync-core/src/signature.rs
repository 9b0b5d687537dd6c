use bitflags::bitflags;

use crate::tree::Hash;

bitflags! {
    /// Everything the engine knows about one path, packed into ten facts.
    ///
    /// Equality bits are only set when both sides exist and their hashes
    /// agree; archived bits are only set when the corresponding view exists.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signature: u16 {
        const DISK_EXISTS         = 1 << 0;
        const PREV_EXISTS         = 1 << 1;
        const LOADOUT_EXISTS      = 1 << 2;
        const DISK_EQUALS_PREV    = 1 << 3;
        const PREV_EQUALS_LOADOUT = 1 << 4;
        const DISK_EQUALS_LOADOUT = 1 << 5;
        const DISK_ARCHIVED       = 1 << 6;
        const PREV_ARCHIVED       = 1 << 7;
        const LOADOUT_ARCHIVED    = 1 << 8;
        const PATH_IS_IGNORED     = 1 << 9;
    }
}

bitflags! {
    /// What to do about one path. Bit order is execution order: backups
    /// always run before anything that could destroy bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Actions: u16 {
        const DO_NOTHING             = 1 << 0;
        const BACKUP_FILE            = 1 << 1;
        const INGEST_FROM_DISK       = 1 << 2;
        const REMOVE_FROM_LOADOUT    = 1 << 3;
        const DELETE_FROM_DISK       = 1 << 4;
        const EXTRACT_TO_DISK        = 1 << 5;
        const WARN_UNABLE_TO_EXTRACT = 1 << 6;
        const WARN_CONFLICT          = 1 << 7;
    }
}

/// Builds a `Signature` from the three views of one path.
///
/// A `None` hash means that view has no entry for the path. Archived flags
/// are taken at face value for views that exist and dropped otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureBuilder {
    pub disk_hash: Option<Hash>,
    pub prev_hash: Option<Hash>,
    pub loadout_hash: Option<Hash>,
    pub disk_archived: bool,
    pub prev_archived: bool,
    pub loadout_archived: bool,
    pub path_is_ignored: bool,
}

impl SignatureBuilder {
    pub fn build(self) -> Signature {
        let mut sig = Signature::empty();
        if self.disk_hash.is_some() {
            sig |= Signature::DISK_EXISTS;
            if self.disk_archived {
                sig |= Signature::DISK_ARCHIVED;
            }
        }
        if self.prev_hash.is_some() {
            sig |= Signature::PREV_EXISTS;
            if self.prev_archived {
                sig |= Signature::PREV_ARCHIVED;
            }
        }
        if self.loadout_hash.is_some() {
            sig |= Signature::LOADOUT_EXISTS;
            if self.loadout_archived {
                sig |= Signature::LOADOUT_ARCHIVED;
            }
        }
        if let (Some(d), Some(p)) = (self.disk_hash, self.prev_hash)
            && d == p
        {
            sig |= Signature::DISK_EQUALS_PREV;
        }
        if let (Some(p), Some(l)) = (self.prev_hash, self.loadout_hash)
            && p == l
        {
            sig |= Signature::PREV_EQUALS_LOADOUT;
        }
        if let (Some(d), Some(l)) = (self.disk_hash, self.loadout_hash)
            && d == l
        {
            sig |= Signature::DISK_EQUALS_LOADOUT;
        }
        if self.path_is_ignored {
            sig |= Signature::PATH_IS_IGNORED;
        }
        sig
    }
}

impl Signature {
    /// Whether this bit pattern can be produced by `SignatureBuilder` for
    /// some combination of inputs. 92 of the 1024 raw patterns qualify.
    pub fn is_reachable(self) -> bool {
        let disk = self.contains(Signature::DISK_EXISTS);
        let prev = self.contains(Signature::PREV_EXISTS);
        let loadout = self.contains(Signature::LOADOUT_EXISTS);
        let dp = self.contains(Signature::DISK_EQUALS_PREV);
        let pl = self.contains(Signature::PREV_EQUALS_LOADOUT);
        let dl = self.contains(Signature::DISK_EQUALS_LOADOUT);
        let da = self.contains(Signature::DISK_ARCHIVED);
        let pa = self.contains(Signature::PREV_ARCHIVED);
        let la = self.contains(Signature::LOADOUT_ARCHIVED);

        // Some view must have an entry, or the path would not be visited.
        if !disk && !prev && !loadout {
            return false;
        }
        // Equality needs both sides present.
        if (dp && !(disk && prev)) || (pl && !(prev && loadout)) || (dl && !(disk && loadout)) {
            return false;
        }
        // Hash equality is transitive: exactly two of the three equalities
        // cannot hold at once.
        if disk && prev && loadout && [dp, pl, dl].iter().filter(|set| **set).count() == 2 {
            return false;
        }
        // Archived is a fact about content, not about the view.
        if (da && !disk) || (pa && !prev) || (la && !loadout) {
            return false;
        }
        if (dp && da != pa) || (pl && pa != la) || (dl && da != la) {
            return false;
        }
        true
    }
}

/// The decision table: which actions reconcile one path, given its signature.
///
/// Ignored paths short-circuit to `DO_NOTHING` before anything else is
/// considered; the engine must never mutate them in either direction.
pub fn map_actions(sig: Signature) -> Actions {
    if sig.contains(Signature::PATH_IS_IGNORED) {
        return Actions::DO_NOTHING;
    }

    let disk = sig.contains(Signature::DISK_EXISTS);
    let prev = sig.contains(Signature::PREV_EXISTS);
    let loadout = sig.contains(Signature::LOADOUT_EXISTS);
    let dp = sig.contains(Signature::DISK_EQUALS_PREV);
    let pl = sig.contains(Signature::PREV_EQUALS_LOADOUT);
    let dl = sig.contains(Signature::DISK_EQUALS_LOADOUT);
    let da = sig.contains(Signature::DISK_ARCHIVED);
    let pa = sig.contains(Signature::PREV_ARCHIVED);
    let la = sig.contains(Signature::LOADOUT_ARCHIVED);

    match (disk, prev, loadout) {
        (false, false, false) => Actions::DO_NOTHING,

        // Only the loadout wants a file here.
        (false, false, true) => extract_or_warn(la),

        // A file we once synced is gone from both disk and loadout.
        (false, true, false) => Actions::DO_NOTHING,

        // Deleted on disk while the loadout still wants it.
        (false, true, true) => {
            if pl {
                // The user deleted exactly what the loadout placed: fold the
                // deletion back into the loadout, but only once the bytes are
                // safely archived.
                if pa {
                    Actions::REMOVE_FROM_LOADOUT
                } else {
                    Actions::WARN_UNABLE_TO_EXTRACT
                }
            } else {
                // The loadout has since changed its mind about this path;
                // restore the new file if we can.
                extract_or_warn(la)
            }
        }

        // A file appeared that nothing accounts for.
        (true, false, false) => backup_then(da, Actions::INGEST_FROM_DISK),

        (true, false, true) => {
            if dl {
                // Disk already matches the loadout; just make sure the bytes
                // are archived.
                backup_then(da, Actions::DO_NOTHING)
            } else {
                // New disk file shadowing a loadout entry: the disk wins and
                // is folded in.
                backup_then(da, Actions::INGEST_FROM_DISK)
            }
        }

        // Loadout dropped the path; disk may have drifted since last sync.
        (true, true, false) => backup_then(da, Actions::DELETE_FROM_DISK),

        (true, true, true) => match (dp, pl, dl) {
            // All three agree.
            (true, true, true) => backup_then(da, Actions::DO_NOTHING),
            // Disk untouched, loadout updated: swap the file out.
            (true, false, false) => {
                if la {
                    backup_then(da, Actions::DELETE_FROM_DISK | Actions::EXTRACT_TO_DISK)
                } else {
                    Actions::WARN_UNABLE_TO_EXTRACT
                }
            }
            // Disk edited back to exactly what the loadout wants.
            (false, false, true) => backup_then(da, Actions::DO_NOTHING),
            // Disk edited while the loadout stayed put: fold the edit in.
            (false, true, false) => backup_then(da, Actions::INGEST_FROM_DISK),
            // Three different files: disk edits race a loadout update.
            (false, false, false) => match (da, pa, la) {
                (false, _, false) => Actions::WARN_CONFLICT,
                (true, false, false) => Actions::WARN_UNABLE_TO_EXTRACT,
                (false, false, true) | (true, true, false) | (false, true, true) => {
                    Actions::BACKUP_FILE | Actions::INGEST_FROM_DISK
                }
                (true, false, true) => Actions::WARN_CONFLICT,
                (true, true, true) => Actions::INGEST_FROM_DISK,
            },
            // Two equalities alone are unreachable (transitivity).
            _ => Actions::DO_NOTHING,
        },
    }
}

fn extract_or_warn(loadout_archived: bool) -> Actions {
    if loadout_archived {
        Actions::EXTRACT_TO_DISK
    } else {
        Actions::WARN_UNABLE_TO_EXTRACT
    }
}

fn backup_then(disk_archived: bool, actions: Actions) -> Actions {
    if disk_archived {
        actions
    } else {
        (actions | Actions::BACKUP_FILE) - Actions::DO_NOTHING
    }
}
