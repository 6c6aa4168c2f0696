//! Shared fixtures for tests that run real processes

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cache::{ArtifactCache, ARTIFACT_NAME};
use crate::download::Fetcher;
use crate::error::{EvalError, EvalResult};
use crate::evaluate::Evaluator;

/// Stands in for the interpreter: runs the `-e` argument as shell code
const FAKE_INTERPRETER: &str = "#!/bin/sh\n[ \"$1\" = \"-e\" ] && shift\neval \"$1\"\n";

/// Fetcher for which every version is unknown
pub struct NoReleases {
    calls: AtomicUsize,
}

impl NoReleases {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for NoReleases {
    async fn fetch(&self, version: &str) -> EvalResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EvalError::FetchFailed(format!("bad status: 404 Not Found ({})", version)))
    }
}

/// Evaluator whose cache already holds version `v1` (the fake interpreter).
/// Network isolation is off so tests run unprivileged.
pub async fn fake_evaluator(
    max_timeout_ms: u64,
) -> (tempfile::TempDir, Arc<NoReleases>, Evaluator) {
    let cache_dir = tempfile::tempdir().unwrap();
    let artifact = cache_dir.path().join("v1").join(ARTIFACT_NAME);
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    std::fs::write(&artifact, FAKE_INTERPRETER).unwrap();
    std::fs::set_permissions(&artifact, std::fs::Permissions::from_mode(0o755)).unwrap();

    let fetcher = Arc::new(NoReleases {
        calls: AtomicUsize::new(0),
    });
    let cache = ArtifactCache::new(cache_dir.path(), 2, fetcher.clone())
        .await
        .unwrap();
    (cache_dir, fetcher, Evaluator::new(Arc::new(cache), max_timeout_ms, false))
}
