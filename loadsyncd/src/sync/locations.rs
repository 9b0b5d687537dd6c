use std::path::{Path, PathBuf};

use thiserror::Error;

use loadsync_core::{GamePath, LocationId, PathError};

#[derive(Debug, Error)]
pub enum LocationsError {
    #[error("unknown location: {0}")]
    UnknownLocation(LocationId),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

/// Maps logical location ids to their roots on disk.
///
/// Registration order breaks ties when roots nest: the longest matching root
/// wins when converting an absolute path back to a `GamePath`.
#[derive(Debug, Clone, Default)]
pub struct LocationsRegister {
    roots: Vec<(LocationId, PathBuf)>,
}

impl LocationsRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, location: LocationId, root: impl Into<PathBuf>) {
        self.roots.push((location, root.into()));
    }

    pub fn roots(&self) -> impl Iterator<Item = (&LocationId, &Path)> {
        self.roots.iter().map(|(id, root)| (id, root.as_path()))
    }

    pub fn root_of(&self, location: &LocationId) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(id, _)| id == location)
            .map(|(_, root)| root.as_path())
    }

    /// Absolute path for a `GamePath`. The relative part is already
    /// normalized and non-escaping, so a plain join is safe.
    pub fn resolve(&self, path: &GamePath) -> Result<PathBuf, LocationsError> {
        let root = self
            .root_of(path.location())
            .ok_or_else(|| LocationsError::UnknownLocation(path.location().clone()))?;
        Ok(root.join(path.path()))
    }

    /// Converts an absolute path back into a `GamePath`, picking the longest
    /// registered root that contains it.
    pub fn to_game_path(&self, path: &Path) -> Option<GamePath> {
        let (location, rest) = self
            .roots
            .iter()
            .filter_map(|(id, root)| path.strip_prefix(root).ok().map(|rest| (id, root, rest)))
            .max_by_key(|(_, root, _)| root.as_os_str().len())
            .map(|(id, _, rest)| (id, rest))?;
        let relative = rest.to_str()?;
        GamePath::new(location.clone(), relative).ok()
    }
}
