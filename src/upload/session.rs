//! Upload session: the resumable write loop
//!
//! Wraps a [`CollectionWriter`] and a [`ResumeCache`]. The session counts
//! only bytes the writer confirms stored, remembers every input it has
//! queued so a rerun does not queue it again, and can snapshot all of that
//! into the cache at any step boundary.

use super::config::CHECKPOINT_INTERVAL_BYTES;
use super::progress::Reporter;
use crate::resume::{ResumeCache, ResumeError, SeenInput, SessionState};
use crate::signal::SharedInterruption;
use crate::writer::{CollectionWriter, WriterError};
use crate::{InputKind, ManifestDepth};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Upload session errors
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Resume cache error
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Collection writer error
    #[error("writer error: {0}")]
    WriterError(#[from] WriterError),

    /// Stopped by a signal after saving a checkpoint
    #[error("interrupted by signal {signal}; progress saved")]
    Interrupted {
        /// Signal number received
        signal: i32,
    },
}

impl UploadError {
    /// Whether a saved state was rejected as malformed, stale or from
    /// another format version
    pub fn is_unusable_state(&self) -> bool {
        match self {
            Self::ResumeError(e) => e.is_unusable_state(),
            Self::WriterError(e) => e.is_unusable_state(),
            Self::Interrupted { .. } => false,
        }
    }
}

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Outcome of offering an input to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    /// First time this input was seen; it has been queued
    Accept,
    /// Already queued in this session; nothing to do
    Skip,
}

/// One command-line input, resolved to what the writer should do with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadInput {
    /// A file (or stream) stored under `dest_name` in its own stream
    File {
        /// Path to read
        path: PathBuf,
        /// Name in the manifest
        dest_name: String,
    },
    /// A directory tree stored from the root stream down
    Directory {
        /// Root of the tree
        path: PathBuf,
        /// Manifest depth limit
        max_depth: ManifestDepth,
    },
}

impl UploadInput {
    /// Resolve command-line paths.
    ///
    /// Directories become tree inputs; anything else is a file named
    /// `filename` if given, else by its base name.
    pub fn from_paths(paths: &[PathBuf], max_depth: ManifestDepth, filename: Option<&str>) -> Vec<Self> {
        paths
            .iter()
            .map(|path| {
                if path.is_dir() {
                    Self::Directory {
                        path: path.clone(),
                        max_depth,
                    }
                } else {
                    let dest_name = filename.map(str::to_string).unwrap_or_else(|| {
                        path.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.to_string_lossy().into_owned())
                    });
                    Self::File {
                        path: path.clone(),
                        dest_name,
                    }
                }
            })
            .collect()
    }
}

/// Resumable upload session
pub struct UploadSession<W: CollectionWriter> {
    writer: W,
    cache: ResumeCache,
    bytes_written: u64,
    checkpointed_bytes: u64,
    seen_inputs: Vec<SeenInput>,
    bytes_expected: Option<u64>,
    reporter: Option<Reporter>,
    interruption: Option<SharedInterruption>,
    checkpoint_interval: Option<u64>,
}

impl<W: CollectionWriter> UploadSession<W> {
    /// Start a fresh session bound to `cache`
    pub fn new(cache: ResumeCache, writer: W) -> Self {
        Self {
            writer,
            cache,
            bytes_written: 0,
            checkpointed_bytes: 0,
            seen_inputs: Vec::new(),
            bytes_expected: None,
            reporter: None,
            interruption: None,
            checkpoint_interval: Some(CHECKPOINT_INTERVAL_BYTES),
        }
    }

    /// Restore the session saved in `cache`, or start fresh.
    ///
    /// A state that cannot be used (malformed, another schema or writer
    /// version, inputs changed on disk) is discarded with a warning; the new
    /// session keeps the same cache and lock.
    pub fn from_cache(cache: ResumeCache, mut writer: W) -> Self {
        let restored = Self::restore(&cache, &mut writer);
        let mut session = Self::new(cache, writer);

        match restored {
            Ok(Some((bytes_written, seen_inputs))) => {
                info!(
                    bytes_written,
                    seen_inputs = seen_inputs.len(),
                    "Restored upload session"
                );
                session.bytes_written = bytes_written;
                session.checkpointed_bytes = bytes_written;
                session.seen_inputs = seen_inputs;
            }
            Ok(None) => debug!("No saved session; starting fresh"),
            Err(e) if e.is_unusable_state() => warn!(
                error = %e,
                path = %session.cache.path().display(),
                "Discarding unusable resume state; starting fresh"
            ),
            Err(e) => warn!(
                error = %e,
                path = %session.cache.path().display(),
                "Failed to read resume state; starting fresh"
            ),
        }
        session
    }

    fn restore(cache: &ResumeCache, writer: &mut W) -> UploadResult<Option<(u64, Vec<SeenInput>)>> {
        let Some(state) = cache.load()? else {
            return Ok(None);
        };
        let (writer_state, bytes_written, seen_inputs) = state.into_parts();
        writer.restore_from_state(writer_state)?;
        Ok(Some((bytes_written, seen_inputs)))
    }

    /// Report progress through `reporter`
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Set the expected total passed to the reporter
    pub fn with_bytes_expected(mut self, bytes_expected: Option<u64>) -> Self {
        self.bytes_expected = bytes_expected;
        self
    }

    /// Poll `interruption` between work steps
    pub fn with_interruption(mut self, interruption: SharedInterruption) -> Self {
        self.interruption = Some(interruption);
        self
    }

    /// Checkpoint after this many flushed bytes; `None` checkpoints only on
    /// interruption or failure
    pub fn with_checkpoint_interval(mut self, interval: Option<u64>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Bytes confirmed stored
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Expected total, if known
    pub fn bytes_expected(&self) -> Option<u64> {
        self.bytes_expected
    }

    /// Inputs already queued in this session
    pub fn seen_inputs(&self) -> &[SeenInput] {
        &self.seen_inputs
    }

    /// Whether this session continues a previous upload
    pub fn is_resuming(&self) -> bool {
        self.bytes_written > 0
    }

    /// The wrapped writer
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// The session's cache
    pub fn cache(&self) -> &ResumeCache {
        &self.cache
    }

    /// Record an input; [`InputDisposition::Skip`] if the exact
    /// `(kind, source, dest)` triple was recorded before.
    ///
    /// Sources are compared as given, without resolving the path.
    pub fn record_new_input(&mut self, kind: InputKind, source: &str, dest: &str) -> InputDisposition {
        let input = SeenInput::new(kind, source, dest);
        if self.seen_inputs.contains(&input) {
            return InputDisposition::Skip;
        }
        self.seen_inputs.push(input);
        InputDisposition::Accept
    }

    /// Queue a file in a new stream, unless it was queued before
    pub fn write_file(&mut self, path: &Path, dest_name: &str) -> UploadResult<InputDisposition> {
        let source = path.to_string_lossy();
        if self.record_new_input(InputKind::File, &source, dest_name) == InputDisposition::Skip {
            debug!(source = %source, dest = dest_name, "Skipping file already queued");
            return Ok(InputDisposition::Skip);
        }

        let queued = self
            .writer
            .start_new_stream(".")
            .and_then(|()| self.writer.write_file(path, dest_name));
        if let Err(e) = queued {
            self.seen_inputs.pop();
            return Err(e.into());
        }
        Ok(InputDisposition::Accept)
    }

    /// Queue a directory tree, unless it was queued before
    pub fn write_directory_tree(
        &mut self,
        path: &Path,
        stream_name: &str,
        max_depth: ManifestDepth,
    ) -> UploadResult<InputDisposition> {
        let source = path.to_string_lossy();
        if self.record_new_input(InputKind::Directory, &source, stream_name) == InputDisposition::Skip {
            debug!(source = %source, stream = stream_name, "Skipping directory already queued");
            return Ok(InputDisposition::Skip);
        }

        if let Err(e) = self.writer.write_directory_tree(path, stream_name, max_depth) {
            self.seen_inputs.pop();
            return Err(e.into());
        }
        Ok(InputDisposition::Accept)
    }

    /// Run queued writer work until the queue is empty.
    ///
    /// Checks for a pending interruption before every step; if one is found,
    /// saves a checkpoint and returns [`UploadError::Interrupted`].
    pub fn do_queued_work(&mut self) -> UploadResult<()> {
        loop {
            self.checkpoint_if_interrupted()?;

            if self.writer.needs_flush() {
                let flushed = self.writer.flush_data()?;
                self.record_flushed(flushed)?;
                continue;
            }

            match self.writer.advance_queue()? {
                Some(flushed) => self.record_flushed(flushed)?,
                None => return Ok(()),
            }
        }
    }

    /// Finish work restored from the cache, queue and write each input, then
    /// flush and close the current stream.
    ///
    /// On any failure other than an interruption (which has already saved
    /// its checkpoint), a checkpoint is attempted before the error is
    /// returned. A signal seen after the final flush still interrupts.
    pub fn upload(&mut self, inputs: &[UploadInput]) -> UploadResult<()> {
        let result = self.run_inputs(inputs);

        if let Err(e) = &result {
            if !matches!(e, UploadError::Interrupted { .. }) {
                warn!(error = %e, "Upload failed; saving checkpoint");
                if let Err(save_error) = self.cache_state() {
                    warn!(error = %save_error, "Failed to save checkpoint after upload failure");
                }
            }
        }
        result
    }

    fn run_inputs(&mut self, inputs: &[UploadInput]) -> UploadResult<()> {
        self.do_queued_work()?;
        for input in inputs {
            match input {
                UploadInput::File { path, dest_name } => {
                    self.write_file(path, dest_name)?;
                }
                UploadInput::Directory { path, max_depth } => {
                    self.write_directory_tree(path, ".", *max_depth)?;
                }
            }
            self.do_queued_work()?;
        }
        self.finish_current_stream()?;
        self.checkpoint_if_interrupted()
    }

    fn record_flushed(&mut self, bytes: u64) -> UploadResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.bytes_written += bytes;
        self.report_progress();

        if let Some(interval) = self.checkpoint_interval {
            if self.bytes_written - self.checkpointed_bytes >= interval {
                self.cache_state()?;
            }
        }
        Ok(())
    }

    /// Save a checkpoint and return [`UploadError::Interrupted`] if a signal
    /// is pending
    pub fn checkpoint_if_interrupted(&mut self) -> UploadResult<()> {
        let Some(signal) = self.interruption.as_ref().and_then(|i| i.pending()) else {
            return Ok(());
        };
        warn!(
            signal,
            bytes_written = self.bytes_written,
            "Interrupted; saving checkpoint"
        );
        self.cache_state()?;
        Err(UploadError::Interrupted { signal })
    }

    /// Save the writer snapshot, byte count and seen inputs to the cache
    pub fn cache_state(&mut self) -> UploadResult<()> {
        let state = SessionState::new(
            self.writer.dump_state()?,
            self.bytes_written,
            self.seen_inputs.clone(),
        );
        self.cache.save(&state)?;
        self.checkpointed_bytes = self.bytes_written;
        Ok(())
    }

    /// Invoke the reporter, if any, with the current counts
    pub fn report_progress(&mut self) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter(self.bytes_written, self.bytes_expected);
        }
    }

    /// Flush and close the current stream
    pub fn finish_current_stream(&mut self) -> UploadResult<()> {
        let flushed = self.writer.finish_current_stream()?;
        self.record_flushed(flushed)
    }

    /// Manifest of all finished streams
    pub fn manifest_text(&self) -> String {
        self.writer.manifest_text()
    }

    /// Locators of all stored data blocks
    pub fn data_locators(&self) -> Vec<String> {
        self.writer.data_locators()
    }

    /// Close the last stream, store the manifest and return the collection id
    pub fn finish(&mut self) -> UploadResult<String> {
        self.finish_current_stream()?;
        Ok(self.writer.finish()?)
    }

    /// End the session, removing its cache file
    pub fn destroy_cache(self) -> UploadResult<()> {
        self.cache.destroy()?;
        Ok(())
    }
}
