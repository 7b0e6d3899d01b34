// # Run Lock
//
// Exclusive, non-blocking OS file lock on `<state_dir>/govedits.lock`.
// Two watchers sharing a state directory would race on the same cursor
// documents, so the second one refuses to start.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Error;

/// File name of the lock inside the state directory
pub const LOCK_FILE_NAME: &str = "govedits.lock";

/// Held run lock; released when dropped
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock in `state_dir`
    ///
    /// Fails with [`Error::AlreadyRunning`] when another process holds it.
    pub fn acquire(state_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = state_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::config(format!(
                "Failed to create state directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(Error::AlreadyRunning(format!(
                    "{} is held by another process",
                    path.display()
                )));
            }
            Err(TryLockError::Error(e)) => return Err(Error::Io(e)),
        }

        // pid is informational only
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        tracing::debug!(path = %path.display(), "Run lock acquired");
        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let dir = tempdir().unwrap();
        let first = RunLock::acquire(dir.path()).unwrap();
        assert!(first.path().ends_with(LOCK_FILE_NAME));

        let second = RunLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::AlreadyRunning(_))));

        drop(first);
        assert!(RunLock::acquire(dir.path()).is_ok());
    }
}
