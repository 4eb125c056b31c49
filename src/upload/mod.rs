//! Resumable upload engine
//!
//! [`UploadSession`] drives a collection writer step by step, counting
//! confirmed bytes, reporting progress and checkpointing into the resume
//! cache.

pub mod config;
pub mod progress;
pub mod session;

pub use progress::{expected_bytes_for, machine_progress, ProgressReporter, Reporter};
pub use session::{InputDisposition, UploadError, UploadInput, UploadResult, UploadSession};
