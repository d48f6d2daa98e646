//! Advisory per-scope lock under `reports/loops/<ticket>/<scope>/.lock`.
//!
//! The lock only guards against two loop drivers racing on the same scope;
//! a stale file from a crashed run is reclaimed after its TTL.

use crate::error::{AiddError, Result};
use crate::io;
use crate::paths;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const STALE_AFTER: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug)]
pub struct ScopeLock {
    path: PathBuf,
}

impl ScopeLock {
    /// Acquire the lock, failing with `ScopeLocked` when another live
    /// invocation holds it.
    pub fn acquire(root: &Path, ticket: &str, scope_key: &str) -> Result<Self> {
        let path = paths::scope_lock_path(root, ticket, scope_key);
        if let Some(parent) = path.parent() {
            io::ensure_dir(parent)?;
        }
        if let Ok(meta) = std::fs::metadata(&path) {
            let stale = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .map(|age| age > STALE_AFTER)
                .unwrap_or(false);
            if stale {
                let _ = std::fs::remove_file(&path);
            }
        }
        let file = std::fs::OpenOptions::new().write(true).create_new(true).open(&path);
        match file {
            Ok(file) => {
                let payload = json!({
                    "pid": std::process::id(),
                    "acquired_at": io::utc_timestamp(),
                });
                use std::io::Write;
                let mut file = file;
                let _ = writeln!(file, "{payload}");
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(AiddError::ScopeLocked(scope_key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let lock = ScopeLock::acquire(root, "L-1", "iteration_id_I1").unwrap();
        let second = ScopeLock::acquire(root, "L-1", "iteration_id_I1");
        assert!(matches!(second, Err(AiddError::ScopeLocked(_))));
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
        ScopeLock::acquire(root, "L-1", "iteration_id_I1").unwrap();
    }

    #[test]
    fn different_scopes_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let _a = ScopeLock::acquire(root, "L-2", "iteration_id_I1").unwrap();
        let _b = ScopeLock::acquire(root, "L-2", "iteration_id_I2").unwrap();
    }
}
