//! Per-request working directory
//!
//! A workspace is a fresh temporary directory holding the caller's auxiliary
//! files. It is removed when the [`Workspace`] is dropped, which covers every
//! exit path of the request including unwinding.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::debug;

use crate::error::{EvalError, EvalResult};

const WORKSPACE_PREFIX: &str = "bpftrace-";

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a workspace and materialize `files` into it.
    ///
    /// Every path is validated before anything is written, so a traversal
    /// attempt never leaves partial output behind.
    pub async fn build(files: &BTreeMap<String, String>) -> EvalResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir()
            .map_err(|e| EvalError::io("Failed to create temp dir", e))?;

        let targets = files
            .iter()
            .map(|(name, content)| resolve_in(dir.path(), name).map(|target| (target, content)))
            .collect::<EvalResult<Vec<_>>>()?;

        for (target, content) in targets {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EvalError::io("Failed to create dir for file", e))?;
            }
            fs::write(&target, content)
                .await
                .map_err(|e| EvalError::io("Failed to write file", e))?;
        }

        debug!("Staged {} file(s) in {:?}", files.len(), dir.path());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Join `relative` onto `root`, rejecting anything that does not resolve
/// strictly inside `root`.
pub fn resolve_in(root: &Path, relative: &str) -> EvalResult<PathBuf> {
    let invalid = || EvalError::InvalidPath(relative.to_string());

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(invalid());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(root.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_in_accepts_nested_paths() {
        let root = Path::new("/tmp/ws");
        assert_eq!(resolve_in(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(resolve_in(root, "./a/../c.txt").unwrap(), root.join("c.txt"));
    }

    #[test]
    fn test_resolve_in_rejects_escapes() {
        let root = Path::new("/tmp/ws");
        for bad in ["../../etc/passwd", "/etc/passwd", "a/../../x", "", ".", "a/.."] {
            assert!(
                matches!(resolve_in(root, bad), Err(EvalError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_build_materializes_nested_files() {
        let ws = Workspace::build(&files(&[("a/b.txt", "hello"), ("top.bt", "x")]))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.path().join("a/b.txt")).unwrap(),
            "hello"
        );
        assert_eq!(std::fs::read_to_string(ws.path().join("top.bt")).unwrap(), "x");
        assert!(ws
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(WORKSPACE_PREFIX));
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_any_write() {
        // a valid entry alongside the bad one does not change the outcome
        let result = Workspace::build(&files(&[("a.txt", "ok"), ("../../etc/passwd", "x")])).await;
        let err = assert_err!(result);
        assert!(matches!(err, EvalError::InvalidPath(ref p) if p == "../../etc/passwd"));
    }

    #[tokio::test]
    async fn test_removed_on_drop() {
        let ws = Workspace::build(&files(&[("f", "1")])).await.unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.exists());
        drop(ws);
        assert!(!path.exists());
    }
}
