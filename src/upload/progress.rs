//! Progress reporting for uploads.
//!
//! Two formats are supported: a single self-updating line on stderr for
//! people, and one fixed-schema line per update for scripts. Both receive
//! `(bytes_written, bytes_expected)` where the expected total may be
//! unknown, for example when reading from a pipe.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Callback invoked with `(bytes_written, bytes_expected)` after each
/// confirmed flush.
pub type Reporter = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Progress output format.
pub enum ProgressReporter {
    /// Single rewritten line for terminals.
    Human {
        /// Bar that renders the line.
        bar: ProgressBar,
        /// Whether the style has been chosen for a known or unknown total.
        styled: Option<bool>,
    },
    /// One line per update for scripts.
    Machine {
        /// Program name shown in each line.
        program: String,
        /// Process id shown in each line.
        pid: u32,
        /// Destination of the lines.
        out: Box<dyn Write + Send>,
    },
}

impl ProgressReporter {
    /// Human-readable progress on stderr.
    pub fn human() -> Self {
        Self::human_with_bar(ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr()))
    }

    /// Human-readable progress rendered through `bar`.
    pub fn human_with_bar(bar: ProgressBar) -> Self {
        Self::Human { bar, styled: None }
    }

    /// Machine-readable progress on stderr, tagged with this process.
    pub fn machine() -> Self {
        let program = std::env::args()
            .next()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self::machine_to(program, std::process::id(), Box::new(std::io::stderr()))
    }

    /// Machine-readable progress written to `out`.
    pub fn machine_to(program: impl Into<String>, pid: u32, out: Box<dyn Write + Send>) -> Self {
        Self::Machine {
            program: program.into(),
            pid,
            out,
        }
    }

    /// Emit one progress update.
    pub fn report(&mut self, bytes_written: u64, bytes_expected: Option<u64>) {
        match self {
            Self::Human { bar, styled } => {
                let known = bytes_expected.is_some();
                if *styled != Some(known) {
                    bar.set_style(human_style(known));
                    *styled = Some(known);
                }
                if let Some(total) = bytes_expected {
                    bar.set_length(total);
                }
                bar.set_position(bytes_written);
            }
            Self::Machine { program, pid, out } => {
                let line = machine_progress(program, *pid, bytes_written, bytes_expected);
                // Progress output is best effort; a closed stderr must not stop the upload.
                let _ = out.write_all(line.as_bytes());
                let _ = out.flush();
            }
        }
    }

    /// Convert into a session reporter callback.
    pub fn into_reporter(mut self) -> Reporter {
        Box::new(move |written, expected| self.report(written, expected))
    }
}

fn human_style(total_known: bool) -> ProgressStyle {
    let template = if total_known {
        "{binary_bytes} / {binary_total_bytes} {percent}%"
    } else {
        "{binary_bytes}"
    };
    ProgressStyle::with_template(template).expect("hardcoded template is valid")
}

/// Format one machine-readable progress line.
///
/// `<program> <pid>: <written> written <total> total`, with `-1` as the
/// total when it is unknown.
pub fn machine_progress(
    program: &str,
    pid: u32,
    bytes_written: u64,
    bytes_expected: Option<u64>,
) -> String {
    let total = bytes_expected.map_or(-1, |total| total as i64);
    format!("{program} {pid}: {bytes_written} written {total} total\n")
}

/// Total size of the regular files under `paths`, recursing into
/// directories.
///
/// Returns `None` when the total cannot be known: some input is neither a
/// directory nor a regular file (a pipe or `/dev/stdin`), or cannot be read.
pub fn expected_bytes_for(paths: &[PathBuf]) -> Option<u64> {
    let mut total: u64 = 0;
    for path in paths {
        let metadata = std::fs::metadata(path).ok()?;
        if metadata.is_dir() {
            for entry in WalkDir::new(path).follow_links(true) {
                let entry = entry.ok()?;
                if entry.file_type().is_file() {
                    total += entry.metadata().ok()?.len();
                }
            }
        } else if metadata.is_file() {
            total += metadata.len();
        } else {
            return None;
        }
    }
    Some(total)
}
