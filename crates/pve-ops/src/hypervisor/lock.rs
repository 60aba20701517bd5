//! Host-wide lock around VM id allocation.
//!
//! `pvesh get /cluster/nextid` hands the same id to every caller until a VM
//! with that id exists, so two operators provisioning at once would collide.
//! The lock is held from asking for an id until `qm create` has returned.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Lock file name inside the configured lock directory.
pub const LOCK_FILE_NAME: &str = "pve-ops-vmid.lock";

/// Exclusive lock released on drop.
#[derive(Debug)]
pub struct VmIdLock {
    file: File,
    path: PathBuf,
}

impl VmIdLock {
    /// Block until the allocation lock in `dir` is held.
    ///
    /// # Errors
    /// Returns [`ProvisionError::LockFailed`] if the lock file cannot be
    /// opened or locked.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let lock_err = |source| ProvisionError::LockFailed {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;

        debug!(path = %path.display(), "Waiting for VM id allocation lock");
        file.lock_exclusive().map_err(lock_err)?;
        debug!(path = %path.display(), "VM id allocation lock held");

        Ok(Self { file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VmIdLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "VM id allocation lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let lock = VmIdLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());

        let other = File::open(lock.path()).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(lock);
        assert!(other.try_lock_exclusive().is_ok());
    }
}
