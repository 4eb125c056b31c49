//! Session key derivation
//!
//! The key names the resume cache file. Rerunning with the same logical
//! arguments yields the same key and so resumes the same session; changing
//! any argument that affects the resulting collection yields a new key.

use crate::ManifestDepth;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Endpoint identity used when no catalog host is configured
pub const NO_HOST: &str = "!nohost";

/// Stable identifier of an upload session (64 hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an invocation.
    ///
    /// Paths are canonicalized and sorted, so argument order does not matter.
    /// The manifest depth only counts when some input is a directory;
    /// otherwise the filename override counts, if given.
    pub fn derive(
        endpoint: &str,
        paths: &[PathBuf],
        max_depth: ManifestDepth,
        filename: Option<&str>,
    ) -> Self {
        let mut canonical: Vec<PathBuf> = paths.iter().map(|p| canonical_path(p)).collect();
        canonical.sort();

        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        hasher.update([0u8]);
        for path in &canonical {
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }

        if canonical.iter().any(|p| p.is_dir()) {
            hasher.update(b"depth:");
            hasher.update(max_depth.as_arg().to_string().as_bytes());
        } else if let Some(name) = filename {
            hasher.update(b"filename:");
            hasher.update(name.as_bytes());
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Hex form of the key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Location of the cache file for this key inside `cache_dir`
    pub fn path_in(&self, cache_dir: impl AsRef<Path>) -> PathBuf {
        cache_dir.as_ref().join(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve symlinks where possible; fall back to an absolute path, then to
/// the path as given
fn canonical_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
