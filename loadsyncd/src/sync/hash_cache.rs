use std::collections::HashMap;
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt, stream};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use twox_hash::XxHash64;

use loadsync_core::{FileEntry, Hash};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("concurrency limiter is closed")]
    LimiterClosed,
    #[error("indexing was cancelled")]
    Cancelled,
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A cached digest, valid only while the file keeps this size and mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedEntry {
    pub hash: Hash,
    pub size: u64,
    pub modified: i64,
}

/// One indexed file: its absolute path plus the validated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedEntry {
    pub path: PathBuf,
    pub entry: FileEntry,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub hash_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hash_concurrency: read_limit("LOADSYNC_HASH_CONCURRENCY", 8),
        }
    }
}

/// Process-wide xxHash64 cache keyed by absolute path.
///
/// The mutex is held only around map access; hashing itself runs outside it,
/// fanned out under the semaphore.
#[derive(Clone)]
pub struct FileHashCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    map: Mutex<HashMap<PathBuf, CachedEntry>>,
    limiter: Semaphore,
    hash_concurrency: usize,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let concurrency = config.hash_concurrency.max(1);
        Self {
            inner: Arc::new(CacheInner {
                map: Mutex::new(HashMap::new()),
                limiter: Semaphore::new(concurrency),
                hash_concurrency: concurrency,
            }),
        }
    }

    /// Cache lookup only; the caller decides whether size/mtime still match.
    pub fn try_get_cached(&self, path: &Path) -> Option<CachedEntry> {
        self.inner.map.lock().expect("cache lock").get(path).copied()
    }

    pub fn put_cached(&self, entries: impl IntoIterator<Item = (PathBuf, CachedEntry)>) {
        self.inner.map.lock().expect("cache lock").extend(entries);
    }

    /// Validates the cached digest against the file's current size and
    /// mtime, rehashing on any mismatch.
    pub async fn index_file(&self, path: &Path) -> Result<HashedEntry, CacheError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| CacheError::io(path, err))?;
        let size = meta.len();
        let modified = meta
            .modified()
            .map_err(|err| CacheError::io(path, err))
            .map(system_time_secs)?;

        if let Some(cached) = self.try_get_cached(path)
            && cached.size == size
            && cached.modified == modified
        {
            return Ok(HashedEntry {
                path: path.to_path_buf(),
                entry: FileEntry {
                    hash: cached.hash,
                    size,
                    modified,
                },
            });
        }

        let _permit = self
            .inner
            .limiter
            .acquire()
            .await
            .map_err(|_| CacheError::LimiterClosed)?;
        let hash = hash_file(path).await.map_err(|err| CacheError::io(path, err))?;

        self.put_cached([(
            path.to_path_buf(),
            CachedEntry {
                hash,
                size,
                modified,
            },
        )]);
        Ok(HashedEntry {
            path: path.to_path_buf(),
            entry: FileEntry {
                hash,
                size,
                modified,
            },
        })
    }

    pub fn index_folder(
        &self,
        root: PathBuf,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<HashedEntry, CacheError>> + Send + use<> {
        self.index_folders(vec![root], cancel)
    }

    /// Streams one result per regular file under the given roots, walking
    /// the directories lazily as the stream is consumed. An unreadable file
    /// yields a per-entry error and the walk continues; a fired cancellation
    /// token fails every remaining entry.
    pub fn index_folders(
        &self,
        roots: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<HashedEntry, CacheError>> + Send + use<> {
        let cache = self.clone();
        let concurrency = self.inner.hash_concurrency;
        let files = roots.into_iter().flat_map(|root| {
            walkdir::WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
                    Ok(_) => None,
                    Err(err) => Some(Err(CacheError::from(err))),
                })
        });
        stream::iter(files)
            .map(move |listed| {
                let cache = cache.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                    cache.index_file(&listed?).await
                }
            })
            .buffer_unordered(concurrency)
    }
}

impl Default for FileHashCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn hash_file(path: &Path) -> io::Result<Hash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = XxHash64::with_seed(0);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(Hash(hasher.finish()))
}

fn system_time_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

fn read_limit(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
