//! CLI command implementations

pub mod error;
pub mod put;

pub use error::CliError;
pub use put::{Cli, OutputMode, ProgressMode, PutPlan};
