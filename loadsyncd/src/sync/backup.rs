use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use thiserror::Error;
use tokio::sync::Semaphore;

use loadsync_core::Hash;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no archived content for hash {0}")]
    MissingContent(Hash),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

impl BackupError {
    fn io(path: &Path, source: io::Error) -> Self {
        BackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One file to archive: where its bytes currently live and what they hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub source: PathBuf,
    pub hash: Hash,
    pub size: u64,
}

/// Content-addressed byte storage. The engine's safety invariant rests on
/// this contract: `have_file` must be true before any action destroys the
/// last copy of a file's bytes.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn have_file(&self, hash: Hash) -> Result<bool, BackupError>;

    /// Archives every request. With `deduplicate` set, requests whose hash
    /// is already stored are skipped without reading the source.
    async fn backup_files(
        &self,
        requests: Vec<BackupRequest>,
        deduplicate: bool,
    ) -> Result<(), BackupError>;

    /// Writes the archived bytes for `hash` to `target`, creating parent
    /// directories as needed.
    async fn extract_file(&self, hash: Hash, target: &Path) -> Result<(), BackupError>;
}

/// Flat content-addressed directory: one file per digest, named by its
/// 16-hex-digit hash. Writes go through a temp file and rename, so a
/// half-written archive entry is never visible under its final name.
pub struct LocalBackupStore {
    root: PathBuf,
    limit: Arc<Semaphore>,
}

impl LocalBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_concurrency(root, 4)
    }

    pub fn with_concurrency(root: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            root: root.into(),
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    fn content_path(&self, hash: Hash) -> PathBuf {
        self.root.join(hash.to_string())
    }

    async fn archive_one(&self, request: &BackupRequest) -> Result<(), BackupError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackupError::ConcurrencyClosed)?;

        let target = self.content_path(request.hash);
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| BackupError::io(&self.root, err))?;

        let staging = self.root.join(format!("{}.partial", request.hash));
        tokio::fs::copy(&request.source, &staging)
            .await
            .map_err(|err| BackupError::io(&request.source, err))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|err| BackupError::io(&target, err))?;
        Ok(())
    }
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    async fn have_file(&self, hash: Hash) -> Result<bool, BackupError> {
        let path = self.content_path(hash);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| BackupError::io(&path, err))
    }

    async fn backup_files(
        &self,
        requests: Vec<BackupRequest>,
        deduplicate: bool,
    ) -> Result<(), BackupError> {
        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            if deduplicate && self.have_file(request.hash).await? {
                continue;
            }
            pending.push(request);
        }
        try_join_all(
            pending
                .iter()
                .map(|request| self.archive_one(request)),
        )
        .await?;
        Ok(())
    }

    async fn extract_file(&self, hash: Hash, target: &Path) -> Result<(), BackupError> {
        let source = self.content_path(hash);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| BackupError::io(parent, err))?;
        }
        match tokio::fs::copy(&source, target).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(BackupError::MissingContent(hash))
            }
            Err(err) => Err(BackupError::io(target, err)),
        }
    }
}
