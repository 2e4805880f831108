//! Process-level exclusivity for mutating commands.
//!
//! Every mutating command holds an exclusive advisory lock on
//! `.cobbler/orchestrator.lock` for its whole duration. The OS drops the lock
//! when the process dies, so a persisted `Running` trail with no lock holder
//! is known to be interrupted.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::CobblerError;

#[derive(Debug)]
pub struct OrchestratorLock {
    file: File,
    path: PathBuf,
}

impl OrchestratorLock {
    /// Acquire the lock without blocking.
    ///
    /// Fails with `TrailBusy` (naming `subject`) if another process holds it.
    pub fn acquire(path: &Path, subject: &str) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.try_lock_exclusive().map_err(|err| {
            warn!(path = %path.display(), error = %err, "orchestrator lock is held");
            anyhow::Error::new(CobblerError::TrailBusy {
                name: subject.to_string(),
                detail: format!("another cobbler process holds {}", path.display()),
            })
        })?;
        debug!(path = %path.display(), "orchestrator lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// True if some other handle currently holds the lock.
    ///
    /// Used by read-only commands to tell a live `Running` trail from an
    /// interrupted one.
    pub fn is_held(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let file = open_lock_file(path)?;
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }
}

impl Drop for OrchestratorLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release orchestrator lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".cobbler/orchestrator.lock");

        let guard = OrchestratorLock::acquire(&path, "demo").expect("first acquire");
        assert!(OrchestratorLock::is_held(&path).expect("is_held"));
        let err = OrchestratorLock::acquire(&path, "demo").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CobblerError>(),
            Some(CobblerError::TrailBusy { .. })
        ));

        drop(guard);
        assert!(!OrchestratorLock::is_held(&path).expect("is_held"));
        OrchestratorLock::acquire(&path, "demo").expect("reacquire");
    }

    #[test]
    fn missing_lock_file_is_not_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!OrchestratorLock::is_held(&temp.path().join("none.lock")).expect("is_held"));
    }
}
