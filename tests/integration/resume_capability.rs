//! Integration tests for interrupted and resumed uploads

use collection_put::cache_key::{CacheKey, NO_HOST};
use collection_put::resume::{ResumeCache, ResumeError};
use collection_put::signal::Interruption;
use collection_put::upload::{InputDisposition, UploadError, UploadInput, UploadSession};
use collection_put::writer::LocalBlockWriter;
use collection_put::{InputKind, ManifestDepth};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    tree: PathBuf,
    cache_dir: PathBuf,
    store_dir: PathBuf,
}

impl Fixture {
    /// A directory holding `a` (10 bytes) and `b` (20 bytes)
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("a"), vec![b'a'; 10]).unwrap();
        std::fs::write(tree.join("b"), vec![b'b'; 20]).unwrap();

        let cache_dir = dir.path().join("cache");
        ResumeCache::setup_user_cache(&cache_dir).unwrap();

        Self {
            tree,
            cache_dir,
            store_dir: dir.path().join("store"),
            _dir: dir,
        }
    }

    fn key(&self) -> CacheKey {
        CacheKey::derive(NO_HOST, &[self.tree.clone()], ManifestDepth::Unlimited, None)
    }

    fn cache_path(&self) -> PathBuf {
        self.key().path_in(&self.cache_dir)
    }

    fn inputs(&self) -> Vec<UploadInput> {
        UploadInput::from_paths(&[self.tree.clone()], ManifestDepth::Unlimited, None)
    }

    fn session(&self) -> UploadSession<LocalBlockWriter> {
        let cache = ResumeCache::acquire(self.cache_path()).unwrap();
        let writer = LocalBlockWriter::new(&self.store_dir)
            .unwrap()
            .with_block_size(10);
        UploadSession::from_cache(cache, writer).with_bytes_expected(Some(30))
    }
}

fn recorder() -> (Arc<Mutex<Vec<u64>>>, Box<dyn FnMut(u64, Option<u64>) + Send>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, Box::new(move |written, _| sink.lock().unwrap().push(written)))
}

/// Run the first session until 10 bytes are stored, then interrupt it
fn interrupt_after_first_block(fixture: &Fixture) {
    let interruption = Interruption::shared();
    let trigger = interruption.clone();

    let mut session = fixture
        .session()
        .with_interruption(interruption)
        .with_reporter(Box::new(move |written, _| {
            if written >= 10 {
                trigger.request(15);
            }
        }));

    match session.upload(&fixture.inputs()) {
        Err(UploadError::Interrupted { signal }) => assert_eq!(signal, 15),
        other => panic!("Expected Interrupted, got {:?}", other.map(|_| ())),
    }
    assert_eq!(session.bytes_written(), 10);
}

#[test]
fn test_interrupted_upload_resumes_without_restreaming() {
    let fixture = Fixture::new();
    interrupt_after_first_block(&fixture);

    let saved = ResumeCache::acquire(fixture.cache_path())
        .unwrap()
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.bytes_written(), 10);
    assert_eq!(saved.seen_inputs().len(), 1);
    assert_eq!(saved.seen_inputs()[0].kind, InputKind::Directory);

    let (reports, reporter) = recorder();
    let mut session = fixture.session().with_reporter(reporter);
    assert!(session.is_resuming());
    assert_eq!(session.bytes_written(), 10);

    session.upload(&fixture.inputs()).unwrap();

    assert_eq!(session.bytes_written(), 30);
    // Only b's 20 bytes are stored by the second run
    assert_eq!(*reports.lock().unwrap(), vec![20, 30]);
    assert_eq!(session.data_locators().len(), 3);

    let manifest = session.manifest_text();
    assert!(manifest.starts_with(". "));
    assert!(manifest.ends_with(" 0:10:a 10:20:b\n"));

    session.destroy_cache().unwrap();
    assert!(!fixture.cache_path().exists());
}

#[test]
fn test_resumed_directory_is_not_queued_again() {
    let fixture = Fixture::new();
    interrupt_after_first_block(&fixture);

    let mut session = fixture.session();
    session.do_queued_work().unwrap();
    let after_restored_work = session.bytes_written();

    let tree = fixture.tree.clone();
    let disposition = session
        .write_directory_tree(&tree, ".", ManifestDepth::Unlimited)
        .unwrap();
    assert_eq!(disposition, InputDisposition::Skip);

    session.do_queued_work().unwrap();
    assert_eq!(session.bytes_written(), after_restored_work);
}

#[test]
fn test_bytes_written_never_decreases_across_resume() {
    let fixture = Fixture::new();
    interrupt_after_first_block(&fixture);

    let (reports, reporter) = recorder();
    let mut session = fixture.session().with_reporter(reporter);
    let restored = session.bytes_written();
    session.report_progress();
    session.upload(&fixture.inputs()).unwrap();

    let reports = reports.lock().unwrap();
    assert_eq!(reports[0], restored);
    assert!(reports.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_no_resume_restarts_from_zero() {
    let fixture = Fixture::new();
    interrupt_after_first_block(&fixture);

    let cache = ResumeCache::acquire(fixture.cache_path())
        .unwrap()
        .restart()
        .unwrap();
    let writer = LocalBlockWriter::new(&fixture.store_dir)
        .unwrap()
        .with_block_size(10);
    let mut session = UploadSession::from_cache(cache, writer);
    assert!(!session.is_resuming());

    session.upload(&fixture.inputs()).unwrap();
    assert_eq!(session.bytes_written(), 30);
}

#[test]
fn test_second_process_conflicts_with_active_session() {
    let fixture = Fixture::new();
    let _active = fixture.session();

    match ResumeCache::acquire(fixture.cache_path()) {
        Err(ResumeError::Conflict(path)) => assert_eq!(path, fixture.cache_path()),
        other => panic!("Expected Conflict, got {:?}", other.map(|c| c.path().to_path_buf())),
    }
}

#[test]
fn test_completed_upload_leaves_no_state() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.upload(&fixture.inputs()).unwrap();
    let id = session.finish().unwrap();
    assert!(id.ends_with(&format!("+{}", session.manifest_text().len())));
    session.destroy_cache().unwrap();

    let fresh = fixture.session();
    assert!(!fresh.is_resuming());
    assert!(fresh.seen_inputs().is_empty());
}

#[test]
fn test_key_ignores_argument_order_but_tracks_depth() {
    let fixture = Fixture::new();
    let other = fixture.tree.parent().unwrap().join("other");
    std::fs::write(&other, b"x").unwrap();

    let forward = CacheKey::derive(
        NO_HOST,
        &[fixture.tree.clone(), other.clone()],
        ManifestDepth::Unlimited,
        None,
    );
    let reversed = CacheKey::derive(
        NO_HOST,
        &[other.clone(), fixture.tree.clone()],
        ManifestDepth::Unlimited,
        None,
    );
    let shallow = CacheKey::derive(
        NO_HOST,
        &[fixture.tree.clone(), other],
        ManifestDepth::Limited(0),
        None,
    );

    assert_eq!(forward, reversed);
    assert_ne!(forward, shallow);
}

#[test]
fn test_unusable_state_starts_fresh_on_same_lock() {
    let fixture = Fixture::new();
    interrupt_after_first_block(&fixture);

    // Changing a queued input invalidates the saved writer state
    std::fs::write(fixture.tree.join("b"), vec![b'c'; 21]).unwrap();

    let mut session = fixture.session();
    assert!(!session.is_resuming());
    assert!(session.seen_inputs().is_empty());

    session.upload(&fixture.inputs()).unwrap();
    assert_eq!(session.bytes_written(), 31);
    assert!(fixture.cache_path().exists());
}
