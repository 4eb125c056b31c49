//! Collection writer contract
//!
//! The upload session never touches block storage directly. It drives a
//! [`CollectionWriter`], which queues inputs, reads them in bounded steps,
//! flushes full blocks to the backend and reports how many bytes each
//! flush made durable.

use crate::ManifestDepth;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod local;

pub use local::LocalBlockWriter;

/// Collection writer errors
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// IO error while reading inputs or storing blocks
    #[error("IO error: {0}")]
    IoError(String),

    /// Saved state refers to inputs that changed since it was taken
    #[error("stale writer state: {0}")]
    StaleState(String),

    /// Saved state was produced by a different writer or format version
    #[error("incompatible writer state: expected {expected}, found {found}")]
    IncompatibleState {
        /// Kind and version this writer understands
        expected: String,
        /// Kind and version found in the state
        found: String,
    },

    /// Saved state could not be decoded
    #[error("malformed writer state: {0}")]
    MalformedState(String),

    /// Operation not valid in the writer's current state
    #[error("invalid writer operation: {0}")]
    InvalidOperation(String),
}

impl WriterError {
    /// Whether this error means a saved state should be discarded rather than
    /// treated as a failure.
    pub fn is_unusable_state(&self) -> bool {
        matches!(
            self,
            Self::StaleState(_) | Self::IncompatibleState { .. } | Self::MalformedState(_)
        )
    }
}

/// Result type for writer operations
pub type WriterResult<T> = Result<T, WriterError>;

/// Versioned snapshot of a writer's internals.
///
/// `buffer` carries bytes that were read but not yet flushed; it travels as
/// base64 so the session state stays plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterState {
    /// Writer implementation that produced the state
    pub kind: String,
    /// Format version of `body`
    pub version: u32,
    /// Buffered, unflushed data
    #[serde(with = "base64_bytes")]
    pub buffer: Vec<u8>,
    /// Implementation-specific queue and stream bookkeeping
    pub body: serde_json::Value,
}

impl WriterState {
    /// Check that this state was produced by the given writer kind and version.
    pub fn ensure_compatible(&self, kind: &str, version: u32) -> WriterResult<()> {
        if self.kind != kind || self.version != version {
            return Err(WriterError::IncompatibleState {
                expected: format!("{kind}/{version}"),
                found: format!("{}/{}", self.kind, self.version),
            });
        }
        Ok(())
    }
}

/// Writer that turns local inputs into a manifest of stored blocks.
///
/// Queueing methods only record work. Bytes move when the caller drives
/// [`advance_queue`](Self::advance_queue) and [`flush_data`](Self::flush_data);
/// every method that stores data returns the number of bytes it made
/// durable, and only those counts may be reported as progress.
pub trait CollectionWriter {
    /// Queue a single file under `dest_name` in the current stream
    fn write_file(&mut self, source: &Path, dest_name: &str) -> WriterResult<()>;

    /// Queue every regular file below `path`, starting at `stream_name`
    fn write_directory_tree(
        &mut self,
        path: &Path,
        stream_name: &str,
        max_depth: ManifestDepth,
    ) -> WriterResult<()>;

    /// Queue a stream boundary; subsequent files go to a new stream `name`
    fn start_new_stream(&mut self, name: &str) -> WriterResult<()>;

    /// Perform one bounded step of queued work.
    ///
    /// Returns `None` when nothing is queued, otherwise the number of bytes
    /// the step flushed to the backend (often zero).
    fn advance_queue(&mut self) -> WriterResult<Option<u64>>;

    /// Whether at least one full block is buffered
    fn needs_flush(&self) -> bool;

    /// Store up to one block of buffered data; returns bytes made durable
    fn flush_data(&mut self) -> WriterResult<u64>;

    /// Flush everything buffered and close the current stream
    fn finish_current_stream(&mut self) -> WriterResult<u64>;

    /// Snapshot the writer's internals
    fn dump_state(&self) -> WriterResult<WriterState>;

    /// Replace the writer's internals with a snapshot.
    ///
    /// Either the whole state is applied or the writer is left untouched.
    fn restore_from_state(&mut self, state: WriterState) -> WriterResult<()>;

    /// Manifest text for all finished streams
    fn manifest_text(&self) -> String;

    /// Locators of every stored data block, in order
    fn data_locators(&self) -> Vec<String>;

    /// Store the manifest and return the collection identifier
    fn finish(&mut self) -> WriterResult<String>;
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
