//! Put command implementation

use crate::cache_key::{CacheKey, NO_HOST};
use crate::catalog::CatalogClient;
use crate::resume::ResumeCache;
use crate::signal::SignalCheckpointGuard;
use crate::upload::config::{default_cache_dir, default_store_dir, DEFAULT_BLOCK_SIZE};
use crate::upload::{expected_bytes_for, ProgressReporter, Reporter, UploadInput, UploadSession};
use crate::writer::LocalBlockWriter;
use crate::ManifestDepth;
use clap::{ArgGroup, Parser};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, info};

use super::CliError;

/// Printed to stderr when a saved session is picked up
pub const RESUME_MESSAGE: &str = "Resuming previous upload. Bypass with the --no-resume option.";

const STDIN_PATH: &str = "/dev/stdin";

/// Parse and validate the block size
fn parse_block_size(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if value == 0 {
        return Err("block size must be at least 1 byte".to_string());
    }
    Ok(value)
}

/// Copy data from the local filesystem into a collection
#[derive(Parser, Debug)]
#[command(name = "collection-put")]
#[command(about = "Copy files and directories into a content-addressed collection store", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("output").args(["stream", "manifest", "raw"])))]
#[command(group(ArgGroup::new("progress_mode").args(["progress", "no_progress", "batch_progress"])))]
#[command(group(ArgGroup::new("resume_mode").args(["resume", "no_resume"])))]
pub struct Cli {
    /// Local files or directories. Default: read from standard input ("-"
    /// also means standard input)
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Maximum depth of directory tree to represent in the manifest
    /// structure; deeper directories are folded into file names. -1 means
    /// unlimited
    #[arg(long, value_name = "N", default_value = "-1", allow_negative_numbers = true)]
    pub max_manifest_depth: ManifestDepth,

    /// Print the manifest text to stdout instead of registering a collection
    #[arg(long, visible_alias = "as-stream")]
    pub stream: bool,

    /// Store the manifest and print the collection id (default)
    #[arg(long, visible_aliases = ["as-manifest", "in-manifest"])]
    pub manifest: bool,

    /// Print a comma-separated list of data block locators
    #[arg(long, visible_alias = "as-raw")]
    pub raw: bool,

    /// Name for the single file given, in place of its base name
    #[arg(long, visible_alias = "use-filename", value_name = "FILENAME")]
    pub filename: Option<String>,

    /// Display human-readable progress on stderr (default if stderr is a
    /// terminal)
    #[arg(long)]
    pub progress: bool,

    /// Do not display any progress
    #[arg(long)]
    pub no_progress: bool,

    /// Display machine-readable progress on stderr
    #[arg(long)]
    pub batch_progress: bool,

    /// Continue interrupted uploads from cached state (default)
    #[arg(long)]
    pub resume: bool,

    /// Do not continue interrupted uploads from cached state
    #[arg(long)]
    pub no_resume: bool,

    /// Directory holding resume state files
    #[arg(long, env = "COLLECTION_PUT_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Directory of the local block store
    #[arg(long, env = "COLLECTION_STORE_DIR")]
    pub store_dir: Option<PathBuf>,

    /// Data block size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
    pub block_size: usize,

    /// Catalog API host; collections are registered there when set
    #[arg(long, env = "COLLECTION_API_HOST")]
    pub api_host: Option<String>,

    /// Catalog API token
    #[arg(long, env = "COLLECTION_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

/// What to print once the data is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Manifest text
    Stream,
    /// Block locators
    Raw,
    /// Stored (and optionally registered) collection id
    Manifest,
}

/// Progress display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// None
    Off,
    /// Rewritten line for terminals
    Human,
    /// One line per update for scripts
    Machine,
}

/// Validated, normalized invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPlan {
    /// Input paths, with standard input spelled `/dev/stdin`
    pub paths: Vec<PathBuf>,
    /// Filename override for a single file input
    pub filename: Option<String>,
    /// Output mode
    pub output: OutputMode,
    /// Progress mode
    pub progress: ProgressMode,
    /// Whether saved state is reused
    pub resume: bool,
}

/// Result of the blocking upload phase
enum UploadOutput {
    Stream(String),
    Raw(String),
    Collection { id: String, manifest: String },
}

impl Cli {
    /// Validate arguments and apply defaults.
    ///
    /// `stderr_is_terminal` decides whether human progress is on by default.
    pub fn plan(&self, stderr_is_terminal: bool) -> Result<PutPlan, CliError> {
        let mut paths = self.paths.clone();
        let mut filename = self.filename.clone();

        if paths.is_empty() {
            paths.push(PathBuf::from(STDIN_PATH));
        }

        if filename.is_some() && (paths.len() != 1 || paths[0].is_dir()) {
            return Err(CliError::InvalidArgument(
                "--filename argument cannot be used when storing a directory or multiple files"
                    .to_string(),
            ));
        }

        if paths.len() == 1 && paths[0].as_os_str() == "-" {
            paths[0] = PathBuf::from(STDIN_PATH);
            filename.get_or_insert_with(|| "-".to_string());
        }

        let output = if self.stream {
            OutputMode::Stream
        } else if self.raw {
            OutputMode::Raw
        } else {
            OutputMode::Manifest
        };

        if output == OutputMode::Manifest && self.api_host.is_some() && self.api_token.is_none() {
            return Err(CliError::ConfigurationError(
                "--api-token (or COLLECTION_API_TOKEN) is required with --api-host".to_string(),
            ));
        }

        let progress = if self.progress {
            ProgressMode::Human
        } else if self.batch_progress {
            ProgressMode::Machine
        } else if self.no_progress || !stderr_is_terminal {
            ProgressMode::Off
        } else {
            ProgressMode::Human
        };

        Ok(PutPlan {
            paths,
            filename,
            output,
            progress,
            resume: !self.no_resume,
        })
    }

    /// Run the upload for this invocation.
    ///
    /// The upload runs on the calling thread, so call this before any other
    /// thread is started: the checkpoint signals must land on the thread that
    /// may be blocked reading a pipe.
    pub fn execute(&self) -> Result<(), CliError> {
        let plan = self.plan(std::io::stderr().is_terminal())?;

        let cache_dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);
        ResumeCache::setup_user_cache(&cache_dir)?;

        let endpoint = self.api_host.as_deref().unwrap_or(NO_HOST);
        let key = CacheKey::derive(
            endpoint,
            &plan.paths,
            self.max_manifest_depth,
            plan.filename.as_deref(),
        );
        let mut cache = ResumeCache::acquire(key.path_in(&cache_dir))?;
        if !plan.resume {
            cache = cache.restart()?;
        }
        debug!(key = %key, path = %cache.path().display(), "Session cache ready");

        let store_dir = self.store_dir.clone().unwrap_or_else(default_store_dir);
        let writer = LocalBlockWriter::new(store_dir)?.with_block_size(self.block_size);

        let reporter = match plan.progress {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(ProgressReporter::human().into_reporter()),
            ProgressMode::Machine => Some(ProgressReporter::machine().into_reporter()),
        };
        let bytes_expected = expected_bytes_for(&plan.paths);
        let inputs = UploadInput::from_paths(&plan.paths, self.max_manifest_depth, plan.filename.as_deref());

        let (session, result) = run_upload(cache, writer, reporter, bytes_expected, &inputs, plan.output)?;

        match result {
            UploadOutput::Stream(manifest) => print!("{manifest}"),
            UploadOutput::Raw(locators) => println!("{locators}"),
            UploadOutput::Collection { id, manifest } => {
                match (&self.api_host, &self.api_token) {
                    (Some(host), Some(token)) => register_collection(host, token, &id, &manifest)?,
                    _ => debug!(id = %id, "No catalog host configured; collection stored locally only"),
                }
                println!("{id}");
            }
        }

        let bytes_written = session.bytes_written();
        session.destroy_cache()?;
        info!(bytes_written, "Upload complete");
        Ok(())
    }
}

/// Stream every input through the session with the checkpoint signal
/// handlers installed, then produce the requested output.
fn run_upload(
    cache: ResumeCache,
    writer: LocalBlockWriter,
    reporter: Option<Reporter>,
    bytes_expected: Option<u64>,
    inputs: &[UploadInput],
    output: OutputMode,
) -> Result<(UploadSession<LocalBlockWriter>, UploadOutput), CliError> {
    let guard = SignalCheckpointGuard::install()
        .map_err(|e| CliError::ConfigurationError(format!("Failed to install signal handlers: {e}")))?;

    let mut session = UploadSession::from_cache(cache, writer)
        .with_bytes_expected(bytes_expected)
        .with_interruption(guard.interruption());
    if let Some(reporter) = reporter {
        session = session.with_reporter(reporter);
    }

    if session.is_resuming() {
        eprintln!("{RESUME_MESSAGE}");
        session.report_progress();
    }

    session.upload(inputs)?;

    let result = match output {
        OutputMode::Stream => UploadOutput::Stream(session.manifest_text()),
        OutputMode::Raw => UploadOutput::Raw(session.data_locators().join(",")),
        OutputMode::Manifest => {
            let id = session.finish()?;
            UploadOutput::Collection {
                id,
                manifest: session.manifest_text(),
            }
        }
    };

    // Last chance to honor a signal that arrived after the final poll; once
    // the guard is gone the default actions apply again.
    session.checkpoint_if_interrupted()?;
    drop(guard);

    Ok((session, result))
}

/// Register a stored collection with the catalog.
///
/// Builds a single-threaded runtime only for this request, after the
/// upload has finished.
fn register_collection(host: &str, token: &str, id: &str, manifest: &str) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::TaskError(format!("Failed to start async runtime: {e}")))?;
    let client = CatalogClient::new(host, token)?;
    runtime.block_on(client.create_collection(id, manifest))?;
    Ok(())
}
