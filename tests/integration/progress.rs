//! Integration tests for progress reporting

use collection_put::resume::ResumeCache;
use collection_put::upload::{expected_bytes_for, ProgressReporter, UploadInput, UploadSession};
use collection_put::writer::LocalBlockWriter;
use collection_put::ManifestDepth;
use indicatif::ProgressBar;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn session_for(dir: &TempDir) -> UploadSession<LocalBlockWriter> {
    let cache = ResumeCache::acquire(dir.path().join("cache").join("key")).unwrap();
    let writer = LocalBlockWriter::new(dir.path().join("store"))
        .unwrap()
        .with_block_size(8);
    UploadSession::from_cache(cache, writer)
}

#[test]
fn test_machine_progress_lines_during_upload() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("input");
    std::fs::write(&file, vec![0u8; 20]).unwrap();

    let paths = vec![file];
    let out = SharedBuf::default();
    let reporter = ProgressReporter::machine_to("collection-put", 99, Box::new(out.clone()));

    let mut session = session_for(&dir)
        .with_bytes_expected(expected_bytes_for(&paths))
        .with_reporter(reporter.into_reporter());
    session
        .upload(&UploadInput::from_paths(&paths, ManifestDepth::Unlimited, None))
        .unwrap();

    assert_eq!(
        out.contents(),
        "collection-put 99: 8 written 20 total\n\
         collection-put 99: 16 written 20 total\n\
         collection-put 99: 20 written 20 total\n"
    );
}

#[test]
fn test_machine_progress_unknown_total() {
    let out = SharedBuf::default();
    let mut reporter = ProgressReporter::machine_to("put", 1, Box::new(out.clone()));
    reporter.report(4096, None);
    assert_eq!(out.contents(), "put 1: 4096 written -1 total\n");
}

#[test]
fn test_human_progress_follows_session() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("input");
    std::fs::write(&file, vec![0u8; 16]).unwrap();

    let bar = ProgressBar::hidden();
    let mut session = session_for(&dir)
        .with_bytes_expected(Some(16))
        .with_reporter(ProgressReporter::human_with_bar(bar.clone()).into_reporter());
    session
        .upload(&UploadInput::from_paths(&[file], ManifestDepth::Unlimited, None))
        .unwrap();

    assert_eq!(bar.position(), 16);
    assert_eq!(bar.length(), Some(16));
}

#[test]
fn test_expected_bytes_mixed_inputs() {
    let dir = TempDir::new().unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("deep/deeper")).unwrap();
    std::fs::write(tree.join("deep/deeper/x"), vec![0u8; 5]).unwrap();
    let single = dir.path().join("single");
    std::fs::write(&single, vec![0u8; 6]).unwrap();

    assert_eq!(expected_bytes_for(&[tree, single]), Some(11));
}
