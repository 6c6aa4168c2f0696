//! Artifact cache for interpreter binaries
//!
//! Keeps at most `capacity` versions on disk under `<root>/<version>/bpftrace`
//! and evicts the least recently used one when a new version is added.
//! Lookups, fetches and evictions are serialized under one lock, so
//! concurrent requests for a missing version share a single fetch.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::download::Fetcher;
use crate::error::{EvalError, EvalResult};

/// File name of the interpreter inside a version directory
pub const ARTIFACT_NAME: &str = "bpftrace";

pub struct ArtifactCache {
    root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    /// Version -> artifact path, in recency order
    entries: Mutex<LruCache<String, PathBuf>>,
}

impl ArtifactCache {
    /// Create the cache, making sure the root directory exists
    pub async fn new(
        root: impl AsRef<Path>,
        capacity: usize,
        fetcher: Arc<dyn Fetcher>,
    ) -> EvalResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| EvalError::io(format!("Failed to create cache dir {:?}", root), e))?;

        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            root,
            fetcher,
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Expected on-disk location of a version's artifact
    pub fn artifact_path(&self, version: &str) -> PathBuf {
        self.root.join(version).join(ARTIFACT_NAME)
    }

    /// Return the local path for `version`, fetching it if necessary
    pub async fn resolve(&self, version: &str) -> EvalResult<PathBuf> {
        validate_version(version)?;

        let mut entries = self.entries.lock().await;

        if let Some(path) = entries.get(version) {
            debug!("Cache hit for version {}", version);
            return Ok(path.clone());
        }

        let path = self.artifact_path(version);
        if fs::try_exists(&path).await.unwrap_or(false) {
            info!("Found existing artifact for version {} at {:?}", version, path);
        } else {
            self.download(version, &path).await?;
            info!("Downloaded version {} to {:?}", version, path);
        }

        self.insert(&mut entries, version, path.clone()).await;
        Ok(path)
    }

    /// Tracked versions, most recently used first
    #[cfg(test)]
    pub async fn versions(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.iter().map(|(version, _)| version.clone()).collect()
    }

    async fn insert(&self, entries: &mut LruCache<String, PathBuf>, version: &str, path: PathBuf) {
        if entries.len() == entries.cap().get() {
            if let Some((oldest, _)) = entries.pop_lru() {
                let dir = self.root.join(&oldest);
                info!("Evicting version {} from cache", oldest);
                if let Err(e) = fs::remove_dir_all(&dir).await {
                    warn!("Failed to remove evicted artifact {:?}: {}", dir, e);
                }
            }
        }

        entries.put(version.to_string(), path);
        debug!("Cache holds {} version(s)", entries.len());
    }

    async fn download(&self, version: &str, path: &Path) -> EvalResult<()> {
        let dir = self.root.join(version);

        let result = async {
            let bytes = self.fetcher.fetch(version).await?;
            write_executable(&dir, path, &bytes).await
        }
        .await;

        if result.is_err() {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to clean up {:?} after failed fetch: {}", dir, e);
                }
            }
        }
        result
    }
}

/// Write `bytes` next to `path` and rename into place once it is executable
async fn write_executable(dir: &Path, path: &Path, bytes: &[u8]) -> EvalResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| EvalError::io("Failed to create artifact dir", e))?;

    let partial = path.with_extension("part");
    fs::write(&partial, bytes)
        .await
        .map_err(|e| EvalError::io("Failed to write artifact", e))?;
    fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| EvalError::io("Failed to mark artifact executable", e))?;
    fs::rename(&partial, path)
        .await
        .map_err(|e| EvalError::io("Failed to move artifact into place", e))?;
    Ok(())
}

/// Versions name a single directory under the cache root
fn validate_version(version: &str) -> EvalResult<()> {
    let valid = !version.is_empty()
        && !version.starts_with('.')
        && !version.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(EvalError::InvalidVersion(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Serves fixed payloads; versions starting with "missing" fail
    struct FakeFetcher {
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, version: &str) -> EvalResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if version.starts_with("missing") {
                return Err(EvalError::FetchFailed("bad status: 404 Not Found".into()));
            }
            Ok(format!("#!/bin/sh\necho {}\n", version).into_bytes())
        }
    }

    async fn cache_with(capacity: usize) -> (tempfile::TempDir, Arc<FakeFetcher>, ArtifactCache) {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new();
        let cache = ArtifactCache::new(dir.path(), capacity, fetcher.clone())
            .await
            .unwrap();
        (dir, fetcher, cache)
    }

    #[tokio::test]
    async fn test_fetches_once_and_marks_executable() {
        let (_dir, fetcher, cache) = cache_with(2).await;

        let path = assert_ok!(cache.resolve("v1").await);
        assert_eq!(path, cache.artifact_path("v1"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(!path.with_extension("part").exists());

        assert_ok!(cache.resolve("v1").await);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_hit_moves_to_front_without_side_effects() {
        let (_dir, fetcher, cache) = cache_with(3).await;
        for v in ["a", "b", "c"] {
            assert_ok!(cache.resolve(v).await);
        }
        assert_eq!(cache.versions().await, vec!["c", "b", "a"]);

        assert_ok!(cache.resolve("a").await);
        assert_eq!(cache.versions().await, vec!["a", "c", "b"]);
        assert_eq!(fetcher.calls(), 3);
        for v in ["a", "b", "c"] {
            assert!(cache.artifact_path(v).exists());
        }
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (dir, _fetcher, cache) = cache_with(2).await;
        assert_ok!(cache.resolve("a").await);
        assert_ok!(cache.resolve("b").await);
        assert_ok!(cache.resolve("a").await);
        assert_ok!(cache.resolve("c").await);

        assert_eq!(cache.versions().await, vec!["c", "a"]);
        assert!(!dir.path().join("b").exists());
        assert!(cache.artifact_path("a").exists());
        assert!(cache.artifact_path("c").exists());
    }

    #[tokio::test]
    async fn test_entry_count_never_exceeds_capacity() {
        let (dir, _fetcher, cache) = cache_with(3).await;
        let sequence = ["a", "b", "a", "c", "d", "e", "b", "a", "f", "c", "c", "g"];
        for v in sequence {
            assert_ok!(cache.resolve(v).await);
            let versions = cache.versions().await;
            assert!(versions.len() <= 3);
            assert_eq!(versions[0], v);

            let on_disk = std::fs::read_dir(dir.path()).unwrap().count();
            assert!(on_disk <= versions.len());
        }
    }

    #[tokio::test]
    async fn test_registers_existing_artifact_without_fetching() {
        let (_dir, fetcher, cache) = cache_with(2).await;
        let path = cache.artifact_path("v0.21.0");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        assert_eq!(assert_ok!(cache.resolve("v0.21.0").await), path);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(cache.versions().await, vec!["v0.21.0"]);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_entry() {
        let (dir, fetcher, cache) = cache_with(2).await;
        assert_ok!(cache.resolve("a").await);

        let err = assert_err!(cache.resolve("missing-1").await);
        assert!(matches!(err, EvalError::FetchFailed(_)));
        assert_eq!(cache.versions().await, vec!["a"]);
        assert!(!dir.path().join("missing-1").exists());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejects_versions_escaping_root() {
        let (_dir, fetcher, cache) = cache_with(2).await;
        for version in ["", "..", "../etc", "a/b", ".hidden"] {
            let err = assert_err!(cache.resolve(version).await);
            assert!(matches!(err, EvalError::InvalidVersion(_)));
        }
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let (_dir, fetcher, cache) = cache_with(2).await;
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve("shared").await })
            })
            .collect();
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }
        assert_eq!(fetcher.calls(), 1);
    }
}
