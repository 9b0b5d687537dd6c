use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Identifies a logical file root, e.g. `game`, `saves`, `appdata`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A normalized relative path inside a location root.
///
/// The stored form is forward-slash separated with no leading slash and no
/// `.`/`..` components, so two `GamePath`s compare equal exactly when they
/// name the same file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GamePath {
    location: LocationId,
    path: String,
}

impl GamePath {
    pub fn new(location: LocationId, path: impl AsRef<str>) -> Result<Self, PathError> {
        let normalized = normalize(path.as_ref())?;
        Ok(Self {
            location,
            path: normalized,
        })
    }

    pub fn location(&self) -> &LocationId {
        &self.location
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Parent directory of this path, or `None` at the location root.
    pub fn parent(&self) -> Option<GamePath> {
        let (dir, _) = self.path.rsplit_once('/')?;
        Some(GamePath {
            location: self.location.clone(),
            path: dir.to_string(),
        })
    }

    /// Whether `self` lives under the directory `prefix` (same location).
    pub fn is_under(&self, prefix: &GamePath) -> bool {
        self.location == prefix.location
            && self.path.len() > prefix.path.len()
            && self.path.starts_with(&prefix.path)
            && self.path.as_bytes()[prefix.path.len()] == b'/'
    }
}

impl fmt::Display for GamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location, self.path)
    }
}

fn normalize(raw: &str) -> Result<String, PathError> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" => continue,
            "." | ".." => return Err(PathError::UnsupportedComponent(part.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Paths the engine never touches in either direction.
///
/// Exact entries match single files; directory entries match everything
/// underneath them.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    files: BTreeSet<GamePath>,
    dirs: Vec<GamePath>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: GamePath) {
        self.files.insert(path);
    }

    pub fn add_dir(&mut self, path: GamePath) {
        self.dirs.push(path);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    pub fn is_ignored(&self, path: &GamePath) -> bool {
        self.files.contains(path) || self.dirs.iter().any(|dir| path.is_under(dir))
    }
}
