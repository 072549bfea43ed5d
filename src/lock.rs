//! Process-exclusion lock for a queue directory.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};

/// Sentinel file carrying the advisory lock inside the queue directory.
pub(crate) const LOCK_FILE_NAME: &str = "queue.lock";

/// Advisory exclusive lock on a queue directory, held for the queue's
/// lifetime.
///
/// Acquisition fails with [`QueueError::AlreadyLocked`] while any other live
/// queue (in this process or another) holds the lock. flock state rides on
/// the open file description, so a second open of the same directory in the
/// same process contends just like a second process does.
#[derive(Debug)]
pub(crate) struct DirLock {
    file: Option<File>,
    path: PathBuf,
}

impl DirLock {
    /// Take the exclusive lock on `dir`, creating the sentinel file if
    /// needed.
    pub(crate) fn acquire(dir: &Path) -> QueueResult<Self> {
        let sentinel = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&sentinel)?;
        file.try_lock_exclusive().map_err(|err| {
            if err.kind() == fs2::lock_contended_error().kind() {
                QueueError::AlreadyLocked {
                    path: dir.to_path_buf(),
                }
            } else {
                QueueError::Io(err)
            }
        })?;
        debug!(dir = %dir.display(), "acquired queue directory lock");
        Ok(Self {
            file: Some(file),
            path: sentinel,
        })
    }

    /// Release the lock. Safe to call more than once.
    pub(crate) fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.unlock() {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to release queue directory lock"
                );
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_contends() {
        let dir = TempDir::new().expect("tempdir");
        let _held = DirLock::acquire(dir.path()).expect("first acquire");

        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, QueueError::AlreadyLocked { .. }));
    }

    #[test]
    fn release_frees_the_lock_and_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let mut held = DirLock::acquire(dir.path()).expect("first acquire");
        held.release();
        held.release();

        let reacquired = DirLock::acquire(dir.path());
        assert!(reacquired.is_ok());
    }

    #[test]
    fn drop_frees_the_lock() {
        let dir = TempDir::new().expect("tempdir");
        {
            let _held = DirLock::acquire(dir.path()).expect("first acquire");
        }
        assert!(DirLock::acquire(dir.path()).is_ok());
    }
}
