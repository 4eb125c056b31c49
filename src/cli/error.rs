//! CLI error types and conversions

use crate::catalog::CatalogError;
use crate::resume::ResumeError;
use crate::signal::exit_code_for;
use crate::upload::UploadError;
use crate::writer::WriterError;
use std::path::PathBuf;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Another process holds the lock for this session
    #[error("Another process is already uploading this data.")]
    Conflict(PathBuf),

    /// Upload stopped by a signal after saving its checkpoint
    #[error("interrupted by signal {signal}; rerun the same command to resume")]
    Interrupted {
        /// Signal number received
        signal: i32,
    },

    /// Resume cache error
    #[error("resume error: {0}")]
    ResumeError(ResumeError),

    /// Upload error
    #[error("upload error: {0}")]
    UploadError(UploadError),

    /// Writer setup error
    #[error("writer error: {0}")]
    WriterError(#[from] WriterError),

    /// Catalog registration error
    #[error("catalog error: {0}")]
    CatalogError(#[from] CatalogError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The async runtime for catalog registration could not start
    #[error("runtime error: {0}")]
    TaskError(String),
}

impl CliError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { signal } => exit_code_for(*signal),
            _ => 1,
        }
    }
}

impl From<ResumeError> for CliError {
    fn from(error: ResumeError) -> Self {
        match error {
            ResumeError::Conflict(path) => Self::Conflict(path),
            other => Self::ResumeError(other),
        }
    }
}

impl From<UploadError> for CliError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Interrupted { signal } => Self::Interrupted { signal },
            UploadError::ResumeError(e) => e.into(),
            other => Self::UploadError(other),
        }
    }
}
