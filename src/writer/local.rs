//! Local block-store writer
//!
//! Stores data blocks as files named by their SHA-256 digest under a store
//! directory. Inputs are read in bounded chunks so the session can observe
//! interrupts and checkpoint between steps.

use super::{CollectionWriter, WriterError, WriterResult, WriterState};
use crate::upload::config::{DEFAULT_BLOCK_SIZE, READ_CHUNK_SIZE};
use crate::ManifestDepth;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Writer kind recorded in [`WriterState::kind`]
pub const LOCAL_WRITER_KIND: &str = "local-block";

/// Body format version recorded in [`WriterState::version`]
pub const LOCAL_WRITER_VERSION: u32 = 1;

/// Size and modification time of a regular file when it was queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Fingerprint {
    size: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

impl Fingerprint {
    /// Fingerprint a path; `None` for anything that is not a regular file
    fn of(path: &Path) -> WriterResult<Option<Self>> {
        let metadata = fs::metadata(path)
            .map_err(|e| WriterError::IoError(format!("Failed to stat {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Ok(Some(Self {
            size: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QueuedFile {
    source: PathBuf,
    dest_name: String,
    /// Bytes of this file already moved into the buffer
    offset: u64,
    fingerprint: Option<Fingerprint>,
}

impl QueuedFile {
    fn new(source: &Path, dest_name: &str) -> WriterResult<Self> {
        Ok(Self {
            source: source.to_path_buf(),
            dest_name: dest_name.to_string(),
            offset: 0,
            fingerprint: Fingerprint::of(source)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum QueueEntry {
    Stream { name: String },
    File(QueuedFile),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FileSegment {
    position: u64,
    length: u64,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StreamState {
    name: String,
    locators: Vec<String>,
    files: Vec<FileSegment>,
    /// Bytes assigned to this stream, flushed or buffered
    length: u64,
}

impl StreamState {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locators: Vec::new(),
            files: Vec::new(),
            length: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.length == 0
    }

    fn manifest_line(&self) -> String {
        let mut parts = vec![escape_name(&self.name)];
        if self.locators.is_empty() {
            parts.push(empty_block_locator());
        } else {
            parts.extend(self.locators.iter().cloned());
        }
        for file in &self.files {
            parts.push(format!(
                "{}:{}:{}",
                file.position,
                file.length,
                escape_name(&file.name)
            ));
        }
        format!("{}\n", parts.join(" "))
    }
}

/// Serialized part of the writer, everything except the buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Body {
    queue: VecDeque<QueueEntry>,
    current: StreamState,
    finished_streams: Vec<String>,
    locators: Vec<String>,
}

/// Collection writer backed by a local block directory
pub struct LocalBlockWriter {
    store_dir: PathBuf,
    block_size: usize,
    read_chunk: usize,
    buffer: Vec<u8>,
    body: Body,
    reader: Option<File>,
}

impl LocalBlockWriter {
    /// Create a writer storing blocks under `store_dir`, creating it if needed
    pub fn new(store_dir: impl Into<PathBuf>) -> WriterResult<Self> {
        let store_dir = store_dir.into();
        fs::create_dir_all(&store_dir).map_err(|e| {
            WriterError::IoError(format!(
                "Failed to create store directory {}: {e}",
                store_dir.display()
            ))
        })?;
        Ok(Self {
            store_dir,
            block_size: DEFAULT_BLOCK_SIZE,
            read_chunk: READ_CHUNK_SIZE,
            buffer: Vec::new(),
            body: Body {
                queue: VecDeque::new(),
                current: StreamState::named("."),
                finished_streams: Vec::new(),
                locators: Vec::new(),
            },
            reader: None,
        })
    }

    /// Set the block size (minimum 1 byte)
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Set how many bytes a single queue step reads (minimum 1 byte)
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    /// Directory holding stored blocks
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Number of buffered, unflushed bytes
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn store_block(&self, data: &[u8]) -> WriterResult<String> {
        let digest = hex::encode(Sha256::digest(data));
        let locator = format!("{digest}+{}", data.len());
        let block_path = self.store_dir.join(&digest);

        if block_path.exists() {
            trace!(locator = %locator, "Block already stored");
            return Ok(locator);
        }

        let mut temp = tempfile::NamedTempFile::new_in(&self.store_dir)
            .map_err(|e| WriterError::IoError(format!("Failed to create block file: {e}")))?;
        temp.write_all(data)
            .map_err(|e| WriterError::IoError(format!("Failed to write block: {e}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| WriterError::IoError(format!("Failed to sync block: {e}")))?;
        temp.persist(&block_path)
            .map_err(|e| WriterError::IoError(format!("Failed to persist block: {e}")))?;

        debug!(locator = %locator, "Stored block");
        Ok(locator)
    }

    /// Flush the buffer completely and move the current stream to the
    /// finished list
    fn close_stream(&mut self, next_name: &str) -> WriterResult<u64> {
        if let Some(QueueEntry::File(file)) = self.body.queue.front() {
            if file.offset > 0 {
                return Err(WriterError::InvalidOperation(format!(
                    "cannot close stream while {} is partially read",
                    file.source.display()
                )));
            }
        }

        let mut flushed = 0;
        while !self.buffer.is_empty() {
            flushed += self.flush_data()?;
        }

        let current = std::mem::replace(&mut self.body.current, StreamState::named(next_name));
        if !current.is_empty() {
            self.body.finished_streams.push(current.manifest_line());
        }
        Ok(flushed)
    }

    /// Read the next chunk of the front file, or finish it on EOF
    fn read_front_file(&mut self) -> WriterResult<()> {
        let Some(QueueEntry::File(file)) = self.body.queue.front_mut() else {
            return Ok(());
        };

        if self.reader.is_none() {
            let mut handle = File::open(&file.source).map_err(|e| {
                WriterError::IoError(format!("Failed to open {}: {e}", file.source.display()))
            })?;
            if file.offset > 0 && file.fingerprint.is_some() {
                handle.seek(SeekFrom::Start(file.offset)).map_err(|e| {
                    WriterError::IoError(format!("Failed to seek {}: {e}", file.source.display()))
                })?;
            }
            self.reader = Some(handle);
        }

        // A signal interrupting a blocked read (EINTR) ends the step without
        // progress, so the caller gets to poll for it.
        let mut chunk = vec![0u8; self.read_chunk];
        let read = match self.reader.as_mut().map(|reader| reader.read(&mut chunk)) {
            Some(Ok(read)) => read,
            Some(Err(e)) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Some(Err(e)) => {
                return Err(WriterError::IoError(format!(
                    "Failed to read {}: {e}",
                    file.source.display()
                )))
            }
            None => 0,
        };

        if read > 0 {
            self.buffer.extend_from_slice(&chunk[..read]);
            file.offset += read as u64;
            self.body.current.length += read as u64;
            return Ok(());
        }

        let segment = FileSegment {
            position: self.body.current.length - file.offset,
            length: file.offset,
            name: file.dest_name.clone(),
        };
        trace!(source = %file.source.display(), length = segment.length, "Finished reading input");
        self.body.current.files.push(segment);
        self.body.queue.pop_front();
        self.reader = None;
        Ok(())
    }

    fn verify_queue(queue: &VecDeque<QueueEntry>) -> WriterResult<()> {
        for entry in queue {
            let QueueEntry::File(file) = entry else {
                continue;
            };
            match &file.fingerprint {
                Some(saved) => {
                    let current = Fingerprint::of(&file.source).map_err(|_| {
                        WriterError::StaleState(format!("{} is no longer readable", file.source.display()))
                    })?;
                    if current.as_ref() != Some(saved) {
                        return Err(WriterError::StaleState(format!(
                            "{} changed since it was queued",
                            file.source.display()
                        )));
                    }
                }
                None if file.offset > 0 => {
                    return Err(WriterError::StaleState(format!(
                        "{} is not a regular file and was partially read",
                        file.source.display()
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl CollectionWriter for LocalBlockWriter {
    fn write_file(&mut self, source: &Path, dest_name: &str) -> WriterResult<()> {
        let entry = QueuedFile::new(source, dest_name)?;
        self.body.queue.push_back(QueueEntry::File(entry));
        Ok(())
    }

    fn write_directory_tree(
        &mut self,
        path: &Path,
        stream_name: &str,
        max_depth: ManifestDepth,
    ) -> WriterResult<()> {
        let mut streams: BTreeMap<String, Vec<(String, PathBuf)>> = BTreeMap::new();

        for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                WriterError::IoError(format!("Failed to walk {}: {e}", path.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            let mut parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let Some(file_name) = parts.pop() else {
                continue;
            };

            let split = match max_depth {
                ManifestDepth::Unlimited => parts.len(),
                ManifestDepth::Limited(depth) => depth.min(parts.len()),
            };
            let stream = std::iter::once(stream_name.to_string())
                .chain(parts[..split].iter().cloned())
                .collect::<Vec<_>>()
                .join("/");
            let name = parts[split..]
                .iter()
                .cloned()
                .chain(std::iter::once(file_name))
                .collect::<Vec<_>>()
                .join("/");

            streams
                .entry(stream)
                .or_default()
                .push((name, entry.path().to_path_buf()));
        }

        debug!(
            path = %path.display(),
            streams = streams.len(),
            "Queued directory tree"
        );

        // All or nothing: the queue only grows once every file was stat'ed.
        let mut entries = Vec::new();
        for (stream, files) in streams {
            entries.push(QueueEntry::Stream { name: stream });
            for (name, source) in files {
                entries.push(QueueEntry::File(QueuedFile::new(&source, &name)?));
            }
        }
        self.body.queue.extend(entries);
        Ok(())
    }

    fn start_new_stream(&mut self, name: &str) -> WriterResult<()> {
        self.body.queue.push_back(QueueEntry::Stream {
            name: name.to_string(),
        });
        Ok(())
    }

    fn advance_queue(&mut self) -> WriterResult<Option<u64>> {
        match self.body.queue.front() {
            None => Ok(None),
            Some(QueueEntry::Stream { name }) => {
                let name = name.clone();
                self.body.queue.pop_front();
                let flushed = self.close_stream(&name)?;
                Ok(Some(flushed))
            }
            Some(QueueEntry::File(_)) => {
                self.read_front_file()?;
                Ok(Some(0))
            }
        }
    }

    fn needs_flush(&self) -> bool {
        self.buffer.len() >= self.block_size
    }

    fn flush_data(&mut self) -> WriterResult<u64> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let take = self.block_size.min(self.buffer.len());
        let locator = self.store_block(&self.buffer[..take])?;
        self.buffer.drain(..take);
        self.body.current.locators.push(locator.clone());
        self.body.locators.push(locator);
        Ok(take as u64)
    }

    fn finish_current_stream(&mut self) -> WriterResult<u64> {
        let name = self.body.current.name.clone();
        self.close_stream(&name)
    }

    fn dump_state(&self) -> WriterResult<WriterState> {
        let body = serde_json::to_value(&self.body)
            .map_err(|e| WriterError::MalformedState(e.to_string()))?;
        Ok(WriterState {
            kind: LOCAL_WRITER_KIND.to_string(),
            version: LOCAL_WRITER_VERSION,
            buffer: self.buffer.clone(),
            body,
        })
    }

    fn restore_from_state(&mut self, state: WriterState) -> WriterResult<()> {
        state.ensure_compatible(LOCAL_WRITER_KIND, LOCAL_WRITER_VERSION)?;
        let body: Body = serde_json::from_value(state.body)
            .map_err(|e| WriterError::MalformedState(e.to_string()))?;
        Self::verify_queue(&body.queue)?;

        debug!(
            queued = body.queue.len(),
            buffered = state.buffer.len(),
            "Restored writer state"
        );
        self.body = body;
        self.buffer = state.buffer;
        self.reader = None;
        Ok(())
    }

    fn manifest_text(&self) -> String {
        self.body.finished_streams.concat()
    }

    fn data_locators(&self) -> Vec<String> {
        self.body.locators.clone()
    }

    fn finish(&mut self) -> WriterResult<String> {
        if !self.body.queue.is_empty() {
            return Err(WriterError::InvalidOperation(
                "cannot finish with queued work remaining".to_string(),
            ));
        }
        self.finish_current_stream()?;
        let manifest = self.manifest_text();
        self.store_block(manifest.as_bytes())
    }
}

fn empty_block_locator() -> String {
    format!("{}+0", hex::encode(Sha256::digest(b"")))
}

fn escape_name(name: &str) -> String {
    name.replace('\\', "\\134").replace(' ', "\\040")
}
