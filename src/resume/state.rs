//! Persisted upload session state
//!
//! A [`SessionState`] is the complete checkpoint of an upload: the writer's
//! snapshot, the number of bytes confirmed stored, and every input already
//! handed to the writer. It is always written and read as a whole.

use crate::writer::WriterState;
use crate::InputKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Current session state schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed state file size (256 MB). The state can carry up to one
/// buffered block in base64.
pub const MAX_STATE_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// An input already handed to the writer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeenInput {
    /// File or directory
    pub kind: InputKind,
    /// Source path exactly as given on the command line
    pub source: String,
    /// File name or stream name in the manifest
    pub dest: String,
}

impl SeenInput {
    /// Build a seen-input record
    pub fn new(kind: InputKind, source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            dest: dest.into(),
        }
    }
}

/// Checkpoint of an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    schema_version: String,
    writer_state: WriterState,
    bytes_written: u64,
    seen_inputs: Vec<SeenInput>,
    updated_at: i64,
}

impl SessionState {
    /// Create a state snapshot
    pub fn new(writer_state: WriterState, bytes_written: u64, seen_inputs: Vec<SeenInput>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            writer_state,
            bytes_written,
            seen_inputs,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Get the writer snapshot
    pub fn writer_state(&self) -> &WriterState {
        &self.writer_state
    }

    /// Get the number of bytes confirmed stored
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Get the inputs already handed to the writer
    pub fn seen_inputs(&self) -> &[SeenInput] {
        &self.seen_inputs
    }

    /// Get the time of the snapshot (Unix milliseconds)
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Split into writer snapshot, byte count and seen inputs
    pub fn into_parts(self) -> (WriterState, u64, Vec<SeenInput>) {
        (self.writer_state, self.bytes_written, self.seen_inputs)
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            warn!(
                found_version = %self.schema_version,
                expected_version = SCHEMA_VERSION,
                "Session state schema version mismatch"
            );
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn to_json(&self) -> Result<Vec<u8>, ResumeError> {
        serde_json::to_vec(self).map_err(|e| ResumeError::SerializationError(e.to_string()))
    }

    /// Deserialize from JSON bytes and check the schema version
    pub fn from_json(bytes: &[u8]) -> Result<Self, ResumeError> {
        let state: SessionState = serde_json::from_slice(bytes).map_err(|e| {
            warn!(error = %e, "Failed to deserialize session state");
            ResumeError::DeserializationError(e.to_string())
        })?;
        state.validate_schema_version()?;
        Ok(state)
    }
}

/// Errors related to the resume cache
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Another process holds the cache lock
    #[error("{} locked: another process is already uploading this data", .0.display())]
    Conflict(PathBuf),

    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// The locked file is no longer the one at the cache path
    #[error("{} was replaced while it was being locked", .0.display())]
    StaleLock(PathBuf),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}

impl ResumeError {
    /// Whether the error means the stored state is unusable and a fresh
    /// session should start instead
    pub fn is_unusable_state(&self) -> bool {
        matches!(
            self,
            Self::SchemaVersionMismatch { .. }
                | Self::StateTooLarge { .. }
                | Self::DeserializationError(_)
        )
    }
}
