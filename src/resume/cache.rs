//! Resume cache file
//!
//! One locked file per session key. Every save writes a complete new state
//! to a temp file in the same directory and renames it over the old one, so
//! a crash at any point leaves either the previous or the new state on disk,
//! never a mix.

use super::lock::CacheLock;
use super::state::{ResumeError, SessionState, MAX_STATE_FILE_SIZE};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Points in [`ResumeCache::save`] where a test can inject a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavePhase {
    /// Temp file written, synced and locked; not yet renamed
    Staged,
    /// Temp file renamed over the cache file
    Committed,
}

/// Locked, atomically replaced session state file
pub struct ResumeCache {
    path: PathBuf,
    lock: CacheLock,
}

impl ResumeCache {
    /// Create the cache directory with owner-only permissions if missing
    pub fn setup_user_cache(dir: &Path) -> Result<(), ResumeError> {
        if dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(dir).map_err(|e| {
            ResumeError::IoError(format!("Failed to create cache directory {}: {e}", dir.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| ResumeError::IoError(e.to_string()))?;
        }
        debug!(path = %dir.display(), "Created cache directory");
        Ok(())
    }

    /// Open or create the cache file at `path` and lock it.
    ///
    /// Fails immediately with [`ResumeError::Conflict`] if another process
    /// holds the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, ResumeError> {
        let path = path.into();
        let lock = CacheLock::try_acquire(&path)?;
        debug!(path = %path.display(), "Acquired resume cache lock");
        Ok(Self { path, lock })
    }

    /// Path of the cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last saved state.
    ///
    /// Returns `Ok(None)` for a fresh (empty) cache file.
    pub fn load(&self) -> Result<Option<SessionState>, ResumeError> {
        let metadata =
            std::fs::metadata(&self.path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        if metadata.len() == 0 {
            return Ok(None);
        }
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents = std::fs::read(&self.path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        let state = SessionState::from_json(&contents)?;

        info!(
            path = %self.path.display(),
            bytes_written = state.bytes_written(),
            seen_inputs = state.seen_inputs().len(),
            updated_at = state.updated_at(),
            "Session state loaded"
        );
        Ok(Some(state))
    }

    /// Replace the saved state with `state`.
    ///
    /// On error before the rename the temp file is removed and the previous
    /// state stays in place.
    pub fn save(&mut self, state: &SessionState) -> Result<(), ResumeError> {
        self.save_with(state, |_| Ok(()))
    }

    fn save_with<F>(&mut self, state: &SessionState, mut fault: F) -> Result<(), ResumeError>
    where
        F: FnMut(SavePhase) -> std::io::Result<()>,
    {
        let json = state.to_json()?;

        let parent_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;

        temp_file
            .write_all(&json)
            .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;
        temp_file
            .flush()
            .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;

        // Lock through a second handle so the lock outlives the temp file
        // wrapper and moves with the renamed file.
        let handle = temp_file
            .as_file()
            .try_clone()
            .map_err(|e| ResumeError::IoError(format!("Failed to clone temp file handle: {e}")))?;
        let new_lock = CacheLock::lock_file(handle, temp_file.path())?;

        fault(SavePhase::Staged)
            .map_err(|e| ResumeError::IoError(format!("Failed before commit: {e}")))?;

        temp_file
            .persist(&self.path)
            .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;
        self.lock = new_lock;

        // Fsync parent directory to ensure the rename is durable
        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        fault(SavePhase::Committed)
            .map_err(|e| ResumeError::IoError(format!("Failed after commit: {e}")))?;

        debug!(
            path = %self.path.display(),
            bytes_written = state.bytes_written(),
            "Session state saved"
        );
        Ok(())
    }

    /// Remove the cache file and release the lock.
    ///
    /// A file that is already gone counts as removed.
    pub fn destroy(self) -> Result<(), ResumeError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        }
        info!(path = %self.path.display(), "Resume cache destroyed");
        Ok(())
    }

    /// Discard saved progress: destroy the file and lock a fresh one at the
    /// same path
    pub fn restart(self) -> Result<Self, ResumeError> {
        let path = self.path.clone();
        self.destroy()?;
        Self::acquire(path)
    }
}
