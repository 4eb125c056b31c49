//! Advisory locking for the resume cache file
//!
//! Uses fd-lock for a non-blocking exclusive lock. The lock is held for as
//! long as the [`CacheLock`] lives and is released when its file handle
//! closes.
//!
//! Saving the state renames a new file over the cache path, so a handle
//! opened just before a save may refer to an unlinked inode. A lock only
//! counts if the locked file is still the one at the path.

use super::state::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Attempts to lock the file at the path before giving up
const MAX_LOCK_ATTEMPTS: usize = 8;

/// Exclusive lock on an open cache file
pub struct CacheLock {
    #[allow(dead_code)]
    lock: RwLock<File>,
}

impl CacheLock {
    /// Open or create `path` (owner-only) and lock it without blocking.
    ///
    /// Returns [`ResumeError::Conflict`] if another process holds the lock.
    /// If the file is replaced between opening and locking, it is reopened.
    pub fn try_acquire(path: &Path) -> Result<Self, ResumeError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            match Self::lock_file(Self::open(path)?, path) {
                Err(ResumeError::StaleLock(_)) => {
                    debug!(path = %path.display(), attempt, "Cache file replaced while locking; reopening");
                }
                result => return result,
            }
        }

        Err(ResumeError::LockError(format!(
            "{} kept being replaced while locking",
            path.display()
        )))
    }

    fn open(path: &Path) -> Result<File, ResumeError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
            .open(path)
            .map_err(|e| ResumeError::LockError(format!("Failed to open cache file: {e}")))
    }

    /// Lock an already open file without blocking.
    ///
    /// Fails with [`ResumeError::StaleLock`] if `file` is no longer the file
    /// at `path` once locked.
    pub fn lock_file(file: File, path: &Path) -> Result<Self, ResumeError> {
        let mut lock = RwLock::new(file);

        match lock.try_write() {
            Ok(guard) => {
                if !is_current(&guard, path)? {
                    // The guard unlocks on drop; nobody else may see this lock.
                    return Err(ResumeError::StaleLock(path.to_path_buf()));
                }
                // Keep the lock past the guard; it is released when the file closes.
                std::mem::forget(guard);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(ResumeError::Conflict(path.to_path_buf()));
            }
            Err(e) => {
                return Err(ResumeError::LockError(format!("Failed to acquire lock: {e}")));
            }
        }

        Ok(Self { lock })
    }
}

/// Whether `file` is the file currently linked at `path`
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> Result<bool, ResumeError> {
    use std::os::unix::fs::MetadataExt;

    let held = file
        .metadata()
        .map_err(|e| ResumeError::LockError(format!("Failed to stat locked file: {e}")))?;
    match std::fs::metadata(path) {
        Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ResumeError::LockError(format!("Failed to stat cache file: {e}"))),
    }
}

#[cfg(not(unix))]
fn is_current(_file: &File, _path: &Path) -> Result<bool, ResumeError> {
    Ok(true)
}
