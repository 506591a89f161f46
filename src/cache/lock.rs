//! Cross-process cache entry locks
//!
//! One lock file per cache entry under `<cache_root>/locks/`. Locks are
//! exclusive and advisory at the OS level (POSIX `flock`, Windows
//! `LockFileEx` via the `fslock` crate) but treated as mandatory by
//! convention: nothing touches an incomplete entry without holding its
//! lock. The OS releases the lock when the holding process dies, so a
//! crashed builder never wedges the cache.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// An exclusive lock on one cache entry, released on drop.
pub struct EntryLock {
    file: fslock::LockFile,
    path: PathBuf,
}

impl EntryLock {
    /// Open (creating if needed) and exclusively lock the given lock file.
    /// Blocks until the current holder releases.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = fslock::LockFile::open(path.as_os_str())
            .map_err(|e| Error::Cache(format!("open lock file {}: {}", path.display(), e)))?;
        file.lock()
            .map_err(|e| Error::Cache(format!("acquire lock {}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        // fslock unlocks on drop of the inner handle; unlock explicitly so
        // errors surface in debug builds at least via best effort.
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("locks").join("packages.local.x@v1.lock");
        let lock = EntryLock::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
        drop(lock);
    }

    #[test]
    fn test_reacquire_after_release() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("entry.lock");
        drop(EntryLock::acquire(&lock_path).unwrap());
        // A released lock is immediately acquirable again.
        let second = EntryLock::acquire(&lock_path).unwrap();
        assert_eq!(second.path(), lock_path);
    }
}
