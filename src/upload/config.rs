//! Upload configuration constants

use std::path::PathBuf;

/// Default block size. 64 MiB matches the block size of the storage
/// service; the final block of a stream may be shorter.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Bytes read from an input per queue step.
/// 1 MiB keeps the gap between interrupt checks short without making the
/// step loop dominate throughput.
pub const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Save a checkpoint after this many newly flushed bytes.
/// One block's worth: the buffer is nearly empty right after a flush, so
/// the checkpoint is small.
pub const CHECKPOINT_INTERVAL_BYTES: u64 = DEFAULT_BLOCK_SIZE as u64;

/// Directory name under the user cache directory
pub const CACHE_DIR_NAME: &str = "collection-put";

/// Default location of resume cache files (`~/.cache/collection-put` on Linux)
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join(CACHE_DIR_NAME)
}

/// Default location of the local block store
pub fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join(CACHE_DIR_NAME)
        .join("blocks")
}
