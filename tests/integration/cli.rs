//! End-to-end tests of the collection-put binary

use assert_cmd::Command;
use collection_put::cache_key::{CacheKey, NO_HOST};
use collection_put::resume::ResumeCache;
use collection_put::signal::Interruption;
use collection_put::upload::{UploadInput, UploadSession};
use collection_put::writer::LocalBlockWriter;
use collection_put::ManifestDepth;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RESUME_MESSAGE: &str = "Resuming previous upload. Bypass with the --no-resume option.";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cache_dir(&self) -> PathBuf {
        self.path().join("cache")
    }

    fn store_dir(&self) -> PathBuf {
        self.path().join("store")
    }

    fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// The binary as a plain process, for tests that need to signal it
    fn process(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin("collection-put"));
        cmd.env_remove("COLLECTION_API_HOST")
            .env_remove("COLLECTION_API_TOKEN")
            .env("COLLECTION_PUT_CACHE_DIR", self.cache_dir())
            .env("COLLECTION_STORE_DIR", self.store_dir())
            .env("RUST_LOG", "collection_put=warn");
        cmd
    }

    fn command(&self) -> Command {
        Command::from_std(self.process())
    }

    fn cache_is_empty(&self) -> bool {
        std::fs::read_dir(self.cache_dir()).unwrap().next().is_none()
    }
}

#[test]
fn test_stream_output_prints_manifest() {
    let ws = Workspace::new();
    let file = ws.write("hello.txt", b"hello");

    ws.command()
        .arg("--stream")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\. [0-9a-f]{64}\+5 0:5:hello\.txt\n$").unwrap());

    assert!(ws.cache_is_empty());
}

#[test]
fn test_raw_output_prints_locators() {
    let ws = Workspace::new();
    let file = ws.write("data", &[1u8; 25]);

    ws.command()
        .args(["--raw", "--block-size", "10"])
        .arg(&file)
        .assert()
        .success()
        .stdout(
            predicate::str::is_match(r"^[0-9a-f]{64}\+10,[0-9a-f]{64}\+10,[0-9a-f]{64}\+5\n$").unwrap(),
        );
}

#[test]
fn test_manifest_output_stores_collection() {
    let ws = Workspace::new();
    let file = ws.write("data", b"payload");

    let output = ws.command().arg(&file).output().unwrap();
    assert!(output.status.success());

    let id = String::from_utf8(output.stdout).unwrap();
    let id = id.trim();
    let (digest, size) = id.split_once('+').unwrap();
    let stored = std::fs::read_to_string(ws.store_dir().join(digest)).unwrap();
    assert_eq!(stored.len().to_string(), size);
    assert!(stored.ends_with(" 0:7:data\n"));
}

#[test]
fn test_stdin_uses_dash_as_filename() {
    let ws = Workspace::new();

    ws.command()
        .args(["--stream", "-"])
        .write_stdin("from stdin")
        .assert()
        .success()
        .stdout(predicate::str::ends_with(" 0:10:-\n"));
}

#[test]
fn test_filename_override() {
    let ws = Workspace::new();
    let file = ws.write("original", b"abc");

    ws.command()
        .args(["--stream", "--use-filename", "renamed"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::ends_with(" 0:3:renamed\n"));
}

#[test]
fn test_filename_with_directory_is_rejected() {
    let ws = Workspace::new();
    ws.write("tree/file", b"x");

    ws.command()
        .args(["--filename", "name"])
        .arg(ws.path().join("tree"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(
            "--filename argument cannot be used when storing a directory or multiple files",
        ));
}

#[test]
fn test_conflicting_output_flags_rejected() {
    let ws = Workspace::new();
    ws.command()
        .args(["--stream", "--raw"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_locked_session_reports_conflict() {
    let ws = Workspace::new();
    let file = ws.write("data", b"contended");

    ResumeCache::setup_user_cache(&ws.cache_dir()).unwrap();
    let key = CacheKey::derive(NO_HOST, &[file.clone()], ManifestDepth::Unlimited, None);
    let _held = ResumeCache::acquire(key.path_in(ws.cache_dir())).unwrap();

    ws.command()
        .arg(&file)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(
            "Another process is already uploading this data.",
        ));
}

/// Leave an interrupted session for `tree` in the workspace cache
fn interrupted_session(ws: &Workspace, tree: &Path) {
    ResumeCache::setup_user_cache(&ws.cache_dir()).unwrap();
    let paths = vec![tree.to_path_buf()];
    let key = CacheKey::derive(NO_HOST, &paths, ManifestDepth::Unlimited, None);
    let cache = ResumeCache::acquire(key.path_in(ws.cache_dir())).unwrap();
    let writer = LocalBlockWriter::new(ws.store_dir())
        .unwrap()
        .with_block_size(10);

    let interruption = Interruption::shared();
    let trigger = interruption.clone();
    let mut session = UploadSession::from_cache(cache, writer)
        .with_interruption(interruption)
        .with_reporter(Box::new(move |_, _| trigger.request(15)));

    let inputs = UploadInput::from_paths(&paths, ManifestDepth::Unlimited, None);
    assert!(session.upload(&inputs).is_err());
    assert_eq!(session.bytes_written(), 10);
}

#[test]
fn test_rerun_resumes_interrupted_upload() {
    let ws = Workspace::new();
    ws.write("tree/a", &[b'a'; 10]);
    ws.write("tree/b", &[b'b'; 20]);
    let tree = ws.path().join("tree");
    interrupted_session(&ws, &tree);

    ws.command()
        .args(["--stream", "--block-size", "10"])
        .arg(&tree)
        .assert()
        .success()
        .stderr(predicate::str::contains(RESUME_MESSAGE))
        .stdout(predicate::str::ends_with(" 0:10:a 10:20:b\n"));

    assert!(ws.cache_is_empty());
}

#[test]
fn test_no_resume_ignores_saved_state() {
    let ws = Workspace::new();
    ws.write("tree/a", &[b'a'; 10]);
    ws.write("tree/b", &[b'b'; 20]);
    let tree = ws.path().join("tree");
    interrupted_session(&ws, &tree);

    ws.command()
        .args(["--stream", "--no-resume", "--block-size", "10"])
        .arg(&tree)
        .assert()
        .success()
        .stderr(predicate::str::contains(RESUME_MESSAGE).not())
        .stdout(predicate::str::ends_with(" 0:10:a 10:20:b\n"));
}

#[test]
fn test_batch_progress_lines() {
    let ws = Workspace::new();
    let file = ws.write("data", &[0u8; 12]);

    ws.command()
        .args(["--stream", "--batch-progress", "--block-size", "6"])
        .arg(&file)
        .assert()
        .success()
        .stderr(predicate::str::is_match(r": 6 written 12 total\n").unwrap())
        .stderr(predicate::str::is_match(r": 12 written 12 total\n").unwrap());
}

#[cfg(unix)]
fn make_fifo(path: &Path) {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
}

#[cfg(unix)]
#[test]
fn test_sigterm_while_reading_pipe_saves_checkpoint() {
    use std::fs::OpenOptions;
    use std::io::{BufRead, BufReader, Write};
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let ws = Workspace::new();
    let first = ws.write("first", &[b'a'; 10]);
    let fifo = ws.path().join("fifo");
    make_fifo(&fifo);

    let mut child = ws
        .process()
        .args(["--stream", "--batch-progress", "--block-size", "10"])
        .arg(&first)
        .arg(&fifo)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Opens once the binary opens the pipe; stays silent so its read blocks
    let silent_writer = {
        let fifo = fifo.clone();
        std::thread::spawn(move || OpenOptions::new().write(true).open(fifo).unwrap())
    };

    let mut stderr = BufReader::new(child.stderr.take().unwrap());
    let mut line = String::new();
    while !line.contains(": 10 written") {
        line.clear();
        assert!(stderr.read_line(&mut line).unwrap() > 0, "exited before storing the first block");
    }
    let pipe = silent_writer.join().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let resent_at = Instant::now() + Duration::from_secs(2);
        let mut exited = None;
        while exited.is_none() && Instant::now() < resent_at {
            exited = child.try_wait().unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        if let Some(status) = exited {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("still running after SIGTERM");
        }
    };
    drop(stderr);
    drop(pipe);

    assert_eq!(status.code(), Some(256 - libc::SIGTERM));

    let saved: Vec<PathBuf> = std::fs::read_dir(ws.cache_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(saved.len(), 1);
    assert!(std::fs::metadata(&saved[0]).unwrap().len() > 0);

    let feeder = {
        let fifo = fifo.clone();
        std::thread::spawn(move || {
            let mut pipe = OpenOptions::new().write(true).open(fifo).unwrap();
            pipe.write_all(b"tail").unwrap();
        })
    };

    ws.command()
        .args(["--stream", "--block-size", "10"])
        .arg(&first)
        .arg(&fifo)
        .assert()
        .success()
        .stderr(predicate::str::contains(RESUME_MESSAGE))
        .stdout(predicate::str::contains(" 0:10:first\n").and(predicate::str::ends_with(" 0:4:fifo\n")));
    feeder.join().unwrap();

    assert!(ws.cache_is_empty());
}
