//! Crash-recovery and whole-engine round-trip scenarios (spec §8), driven
//! through the public [`Engine`] API against a real filesystem path —
//! mirroring the retrieval pack's `artemonad-QuiverDB` crash-recovery-matrix
//! style of open/mutate/fault-inject/reopen/assert.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use tempfile::tempdir;

use tissueroll::journal::Journal;
use tissueroll::metadata::{Metadata, METADATA_SIZE};
use tissueroll::{
    CreateOptions, Engine, Error, FileBackend, MemoryBackend, OpenOptions, Result, StorageBackend,
};

fn temp_db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

fn unique_mem_path(name: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("mem://integration-{name}-{n}")
}

fn fault_budget() -> &'static Mutex<HashMap<String, i64>> {
    static BUDGET: OnceLock<Mutex<HashMap<String, i64>>> = OnceLock::new();
    BUDGET.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Wraps [`MemoryBackend`], letting a test arm a path to let only
/// `writes_before_fault` more `update`/`append` calls through before every
/// later one fails. Used to force a crash partway through a real commit
/// instead of hand-constructing journal state.
struct FaultingBackend {
    inner: MemoryBackend,
    path: Option<String>,
}

impl FaultingBackend {
    fn arm(path: &str, writes_before_fault: i64) {
        fault_budget()
            .lock()
            .unwrap()
            .insert(path.to_string(), writes_before_fault);
    }

    fn disarm(path: &str) {
        fault_budget().lock().unwrap().remove(path);
    }

    fn tick(path: &str) -> Result<()> {
        let mut budget = fault_budget().lock().unwrap();
        if let Some(remaining) = budget.get_mut(path) {
            if *remaining <= 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated crash",
                )));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl StorageBackend for FaultingBackend {
    fn new() -> Self {
        FaultingBackend {
            inner: MemoryBackend::new(),
            path: None,
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn boot(&mut self, path: &str) -> Result<()> {
        self.inner.boot(path)
    }

    fn create(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        self.path = Some(path.to_string());
        self.inner.create(path, bytes)
    }

    fn open(&mut self, path: &str) -> Result<()> {
        self.path = Some(path.to_string());
        self.inner.open(path)
    }

    fn close(&mut self) -> Result<()> {
        self.path = None;
        self.inner.close()
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn read(&self, offset: u64, len: Option<u64>) -> Result<Vec<u8>> {
        self.inner.read(offset, len)
    }

    fn update(&mut self, offset: u64, bytes: &[u8]) -> Result<usize> {
        if let Some(path) = &self.path {
            Self::tick(path)?;
        }
        self.inner.update(offset, bytes)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(path) = &self.path {
            Self::tick(path)?;
        }
        self.inner.append(bytes)
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.inner.truncate(new_size)
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.inner.unlink(path)
    }

    fn reset(&mut self, path: &str) -> Result<()> {
        self.inner.reset(path)
    }

    fn try_clone_fresh(&self) -> Self {
        FaultingBackend {
            inner: self.inner.try_clone_fresh(),
            path: None,
        }
    }
}

fn read_all(path: &str) -> Vec<u8> {
    let mut backend = MemoryBackend::new();
    backend.open(path).unwrap();
    backend.read(0, None).unwrap()
}

#[test]
fn create_and_reopen_round_trips_record_content() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "roundtrip.db");

    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();
    let id = engine.put("hello, tissueroll").unwrap();
    engine.close().unwrap();

    let reopened = Engine::<FileBackend>::open(&path, OpenOptions::default()).unwrap();
    assert_eq!(reopened.pick(&id).unwrap(), "hello, tissueroll");
    assert!(reopened.exists(&id).unwrap());
    reopened.close().unwrap();
}

#[test]
fn create_without_overwrite_fails_on_existing_path() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "exists.db");

    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();
    engine.close().unwrap();

    let err = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));

    let overwritten = Engine::<FileBackend>::create(
        &path,
        CreateOptions { overwrite: true, ..Default::default() },
    )
    .unwrap();
    overwritten.close().unwrap();
}

#[test]
fn record_larger_than_one_page_spans_an_overflow_chain() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "overflow.db");

    // A small payload forces any record longer than a single page's cell
    // capacity onto an Overflow chain.
    let small_pages = CreateOptions { payload_size: 64, ..Default::default() };
    let engine = Engine::<FileBackend>::create(&path, small_pages).unwrap();

    let long_text = "overflow-test-payload-".repeat(12);
    let id = engine.put(&long_text).unwrap();
    assert_eq!(engine.pick(&id).unwrap(), long_text);

    let records = engine.get_records(1).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, long_text.as_bytes());
    engine.close().unwrap();

    let reopened = Engine::<FileBackend>::open(
        &path,
        OpenOptions { payload_size: 64, ..Default::default() },
    )
    .unwrap();
    assert_eq!(reopened.pick(&id).unwrap(), long_text);
    reopened.close().unwrap();
}

#[test]
fn update_with_shorter_text_keeps_id_and_reserved_capacity() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "shrink.db");
    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();

    let original = "a reasonably long original value";
    let id = engine.put(original).unwrap();

    let updated_id = engine.update(&id, "short").unwrap();
    assert_eq!(updated_id, id);
    assert_eq!(engine.pick(&id).unwrap(), "short");

    let records = engine.get_records(1).unwrap();
    let record = records.iter().find(|r| r.payload == b"short").unwrap();
    assert_eq!(record.header.length, 5);
    assert_eq!(record.header.max_length, original.len() as u32);

    engine.close().unwrap();
}

#[test]
fn update_past_reserved_capacity_aliases_to_a_new_id() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "grow.db");
    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();

    let id = engine.put("short").unwrap();
    let grown = "this replacement text is much longer than the original value";
    let new_id = engine.update(&id, grown).unwrap();

    assert_ne!(new_id, id);
    assert_eq!(engine.pick(&id).unwrap(), grown);
    assert_eq!(engine.pick(&new_id).unwrap(), grown);
    assert!(engine.exists(&id).unwrap());
    assert!(engine.exists(&new_id).unwrap());

    engine.close().unwrap();
}

#[test]
fn delete_marks_record_gone_for_pick_update_and_exists() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "delete.db");
    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();

    let id = engine.put("to be deleted").unwrap();
    assert!(engine.exists(&id).unwrap());

    engine.delete(&id).unwrap();

    assert!(!engine.exists(&id).unwrap());
    assert!(matches!(engine.pick(&id), Err(Error::AlreadyDeleted)));
    assert!(matches!(engine.update(&id, "nope"), Err(Error::AlreadyDeleted)));
    assert!(matches!(engine.delete(&id), Err(Error::AlreadyDeleted)));

    engine.close().unwrap();
}

#[test]
fn batch_put_preserves_submission_order() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "batch.db");
    let engine = Engine::<FileBackend>::create(&path, CreateOptions::default()).unwrap();

    let texts: Vec<String> = vec!["one".into(), "two".into(), "three".into()];
    let ids = engine.batch(&texts).unwrap();

    assert_eq!(ids.len(), texts.len());
    for (id, text) in ids.iter().zip(texts.iter()) {
        assert_eq!(&engine.pick(id).unwrap(), text);
    }

    engine.close().unwrap();
}

/// Forges the on-disk state a real crash would leave behind — a journal
/// transaction whose pre-image was backed up and whose corresponding write
/// landed on the live database, but whose transaction was never marked
/// ended — and checks that reopening rolls the database back to exactly
/// its pre-crash bytes instead of failing on the now-corrupt metadata
/// prefix.
#[test]
fn crash_mid_transaction_restores_previous_database_state_on_reopen() {
    let dir = tempdir().unwrap();
    let path = temp_db_path(&dir, "crash.db");

    let create_opts = CreateOptions { payload_size: 256, ..Default::default() };
    let engine = Engine::<FileBackend>::create(&path, create_opts).unwrap();
    let id = engine.put("pre-crash content").unwrap();
    engine.close().unwrap();

    let clean_bytes = fs::read(&path).unwrap();
    let metadata = Metadata::from_bytes(&clean_bytes[..METADATA_SIZE]).unwrap();
    let page_size = metadata.page_size() as usize;
    let chunk0 = clean_bytes[..page_size].to_vec();

    // Write a journal transaction by hand: started, one chunk backed up,
    // never ended — exactly what `end_transaction(None)` would have
    // produced one instruction later.
    let mut journal = Journal::<FileBackend>::new(FileBackend::new(), &path);
    journal
        .start_transaction(metadata.next_index, &clean_bytes[..METADATA_SIZE])
        .unwrap();
    journal.backup_page(0, &chunk0).unwrap();

    // Simulate the crash: the live file has already taken the in-flight
    // write's damage (here, simply corrupted) when the process died.
    let mut corrupted = clean_bytes.clone();
    for byte in corrupted[..page_size].iter_mut() {
        *byte = 0xEE;
    }
    fs::write(&path, &corrupted).unwrap();

    let open_opts = OpenOptions { payload_size: 256, ..Default::default() };
    let reopened = Engine::<FileBackend>::open(&path, open_opts).unwrap();
    assert_eq!(reopened.pick(&id).unwrap(), "pre-crash content");
    reopened.close().unwrap();

    let restored_bytes = fs::read(&path).unwrap();
    assert_eq!(&restored_bytes[..page_size], &chunk0[..]);
    assert!(!Path::new(&format!("{path}.journal")).exists());
}

/// Drives two real writes through the engine's own commit path (no
/// hand-constructed journal state): the first commits cleanly, then the
/// second is interrupted mid-commit by a backend write failure, leaving the
/// journal mid-transaction exactly as a real crash would. Reopening must
/// restore the database to its state as of the first, already-committed
/// write — not to whatever the interrupted second write had already
/// mutated in memory before its commit ran.
#[test]
fn crash_during_real_commit_restores_last_committed_state_on_reopen() {
    let path = unique_mem_path("crash-real-commit");

    let create_opts = CreateOptions { payload_size: 256, ..Default::default() };
    let engine = Engine::<FaultingBackend>::create(&path, create_opts).unwrap();

    let first_id = engine.put("first record").unwrap();
    let state_after_first_commit = read_all(&path);

    // Let exactly one of this next write's dirty chunks reach the backend,
    // then fail the rest — this is what a disk dying partway through a
    // multi-chunk commit looks like.
    FaultingBackend::arm(&path, 1);
    let second_result = engine.put("second record");
    assert!(second_result.is_err());
    FaultingBackend::disarm(&path);

    drop(engine);

    let open_opts = OpenOptions { payload_size: 256, ..Default::default() };
    let reopened = Engine::<FaultingBackend>::open(&path, open_opts).unwrap();

    assert_eq!(reopened.pick(&first_id).unwrap(), "first record");
    assert_eq!(read_all(&path), state_after_first_commit);

    reopened.close().unwrap();
}
