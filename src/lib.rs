//! # collection-put
//!
//! Resumable upload of local files and directories into a content-addressed
//! collection store.
//!
//! An upload can run for a long time and move many gigabytes. If it is
//! interrupted, rerunning the same command picks up where it left off: data
//! already stored is not sent again and inputs already queued are not queued
//! twice.
//!
//! ## Architecture
//!
//! - [`cache_key`] - Derives the session key from the invocation arguments
//! - [`resume`] - Locked, atomically replaced session state file
//! - [`upload`] - Upload session, progress reporting and configuration
//! - [`signal`] - Scoped SIGINT/SIGTERM/SIGQUIT handling that forces a checkpoint
//! - [`writer`] - Collection writer contract and the local block-store writer
//! - [`catalog`] - Registration of finished collections with the catalog service
//! - [`cli`] - Command-line interface
//!
//! ## Resuming
//!
//! ```no_run
//! use collection_put::cache_key::CacheKey;
//! use collection_put::resume::ResumeCache;
//! use collection_put::upload::{UploadInput, UploadSession};
//! use collection_put::writer::LocalBlockWriter;
//! use collection_put::ManifestDepth;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = vec!["./data".into()];
//! let key = CacheKey::derive("!nohost", &paths, ManifestDepth::Unlimited, None);
//! let cache = ResumeCache::acquire(key.path_in("/tmp/put-cache"))?;
//!
//! let writer = LocalBlockWriter::new("/tmp/blocks")?;
//! let mut session = UploadSession::from_cache(cache, writer);
//! session.upload(&UploadInput::from_paths(&paths, ManifestDepth::Unlimited, None))?;
//! println!("{}", session.manifest_text());
//! session.destroy_cache()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session key derivation
pub mod cache_key;

/// Collection registration with the catalog service
pub mod catalog;

/// CLI command implementation
pub mod cli;

/// Persistent, locked session state
pub mod resume;

/// Signal-triggered checkpointing
pub mod signal;

/// Upload session orchestration
pub mod upload;

/// Collection writers
pub mod writer;

/// How deep a directory tree is represented in the manifest
///
/// Directories deeper than the limit are folded into the stream at the
/// limit, with their relative path kept in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ManifestDepth {
    /// One stream per directory that contains files
    #[default]
    Unlimited,
    /// At most this many directory levels below the root become streams
    Limited(usize),
}

impl ManifestDepth {
    /// Build from the command-line convention where any negative value
    /// means unlimited
    pub fn from_arg(value: i64) -> Self {
        if value < 0 {
            Self::Unlimited
        } else {
            Self::Limited(value as usize)
        }
    }

    /// Command-line representation, `-1` for unlimited
    pub fn as_arg(&self) -> i64 {
        match self {
            Self::Unlimited => -1,
            Self::Limited(depth) => *depth as i64,
        }
    }
}

impl fmt::Display for ManifestDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_arg())
    }
}

impl FromStr for ManifestDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self::from_arg)
            .map_err(|_| format!("Invalid manifest depth: {s}"))
    }
}

/// Kind of input recorded in the session's seen-input list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// A single file (or stream such as stdin)
    File,
    /// A directory tree
    Directory,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
        }
    }
}
