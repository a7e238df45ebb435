//! Write-back, chunk-cached byte-addressed view over a storage backend.
//!
//! Grounded on the teacher's `storage/pcache.rs` dirty-page tracking (a
//! page cache that coalesces writes before they reach the pager) combined
//! with `os/threads.rs`'s background-timer shape for the debounced flush.
//! Reads and writes are expressed in fixed-size chunks aligned to the
//! database's page size, so that a commit's pre-image backups line up
//! one-to-one with the journal's own page-indexed entries.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::backend::StorageBackend;
use crate::debounce::Debouncer;
use crate::error::Result;
use crate::journal::Journal;
use crate::locker::Locker;
use crate::metadata;

struct VirtualState<B: StorageBackend> {
    backend: B,
    dirty_chunks: BTreeMap<u64, Vec<u8>>,
    size: Option<u64>,
}

/// A write-back cache in front of a [`StorageBackend`], batching dirty
/// chunks until `commit` (or a debounced/forced flush) applies them in
/// ascending order and, if a journal is attached, backs up each chunk's
/// pre-image first.
pub struct VirtualEngine<B: StorageBackend> {
    chunk_size: u64,
    clean_chunks: crate::cache::Cache<u64, Vec<u8>>,
    state: Locker<VirtualState<B>>,
    journal: Option<Arc<Mutex<Journal<B>>>>,
    /// Supplies the last-committed `(nextIndex, metadata bytes)` snapshot a
    /// journal transaction should be opened against; see spec §4.2 `commit`
    /// step 1. This must be the metadata as of the last successful commit,
    /// not whatever the live `Metadata` currently holds — record/page
    /// operations mutate it in place before a commit ever runs.
    metadata_snapshot: Arc<dyn Fn() -> (u32, Vec<u8>) + Send + Sync>,
    /// Called after a commit succeeds to advance the committed snapshot to
    /// the now-durable live metadata.
    mark_committed: Arc<dyn Fn() + Send + Sync>,
    debouncer: Debouncer,
}

impl<B: StorageBackend> VirtualEngine<B> {
    /// Build a virtual engine over an already-open `backend`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: B,
        chunk_size: u64,
        cache_lifespan: Duration,
        commit_debounce: Duration,
        commit_debounce_max_skip: u32,
        journal: Option<Arc<Mutex<Journal<B>>>>,
        metadata_snapshot: Arc<dyn Fn() -> (u32, Vec<u8>) + Send + Sync>,
        mark_committed: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Arc<Self>> {
        let initial_size = backend.size()?;
        Ok(Arc::new_cyclic(|weak: &Weak<VirtualEngine<B>>| {
            let weak_for_action = weak.clone();
            let debouncer = Debouncer::new(commit_debounce, commit_debounce_max_skip, move || {
                match weak_for_action.upgrade() {
                    Some(engine) => engine.commit(),
                    None => Ok(()),
                }
            });
            VirtualEngine {
                chunk_size,
                clean_chunks: crate::cache::Cache::new(cache_lifespan),
                state: Locker::new(VirtualState {
                    backend,
                    dirty_chunks: BTreeMap::new(),
                    size: Some(initial_size),
                }),
                journal,
                metadata_snapshot,
                mark_committed,
                debouncer,
            }
        }))
    }

    fn current_size(&self, state: &VirtualState<B>) -> Result<u64> {
        match state.size {
            Some(s) => Ok(s),
            None => state.backend.size(),
        }
    }

    fn load_chunk(&self, state: &VirtualState<B>, idx: u64) -> Result<Vec<u8>> {
        if let Some(dirty) = state.dirty_chunks.get(&idx) {
            return Ok(dirty.clone());
        }
        self.clean_chunks.get_or_try_compute(&idx, || {
            let offset = idx * self.chunk_size;
            let mut bytes = state.backend.read(offset, Some(self.chunk_size))?;
            if (bytes.len() as u64) < self.chunk_size {
                bytes.resize(self.chunk_size as usize, 0);
            }
            Ok(bytes)
        })
    }

    /// Read `len` bytes (or to end-of-file if `None`) starting at `start`,
    /// transparently merging in-flight dirty chunks.
    pub fn read(&self, start: u64, len: Option<u64>) -> Result<Vec<u8>> {
        let state = self.state.read();
        let size = self.current_size(&state)?;
        if start >= size {
            return Ok(Vec::new());
        }
        let available = size - start;
        let want = len.unwrap_or(available).min(available);
        if want == 0 {
            return Ok(Vec::new());
        }

        let first_chunk = start / self.chunk_size;
        let last_chunk = (start + want - 1) / self.chunk_size;
        let mut buf = Vec::with_capacity(((last_chunk - first_chunk + 1) * self.chunk_size) as usize);
        for idx in first_chunk..=last_chunk {
            buf.extend_from_slice(&self.load_chunk(&state, idx)?);
        }
        let local_start = (start - first_chunk * self.chunk_size) as usize;
        Ok(buf[local_start..local_start + want as usize].to_vec())
    }

    /// Overwrite bytes starting at `start`, never extending the virtual
    /// size. Returns the number of bytes actually applied (clamped to the
    /// current size, mirroring [`StorageBackend::update`]).
    pub fn update(&self, start: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.write();
        let size = self.current_size(&state)?;
        if start >= size {
            return Ok(0);
        }
        let available = size - start;
        let writable = (data.len() as u64).min(available) as usize;
        let data = &data[..writable];

        let first_chunk = start / self.chunk_size;
        let last_chunk = (start + writable as u64 - 1) / self.chunk_size;
        for idx in first_chunk..=last_chunk {
            let mut chunk = self.load_chunk(&state, idx)?;
            let chunk_start = idx * self.chunk_size;
            let lo = start.max(chunk_start) - chunk_start;
            let hi = (start + writable as u64).min(chunk_start + self.chunk_size) - chunk_start;
            let data_lo = ((chunk_start + lo) - start) as usize;
            let data_hi = data_lo + (hi - lo) as usize;
            chunk[lo as usize..hi as usize].copy_from_slice(&data[data_lo..data_hi]);
            state.dirty_chunks.insert(idx, chunk);
        }
        Ok(writable)
    }

    /// Extend the virtual size by appending `data`, filling any partially
    /// used trailing chunk before allocating fresh ones.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        let size = self.current_size(&state)?;
        let mut pos = size;
        let mut remaining = data;

        if pos > 0 {
            let idx = (pos - 1) / self.chunk_size;
            let chunk_start = idx * self.chunk_size;
            let offset_in_chunk = (pos - chunk_start) as usize;
            let room = self.chunk_size as usize - offset_in_chunk;
            if room > 0 {
                let take = remaining.len().min(room);
                let mut chunk = self.load_chunk(&state, idx)?;
                chunk[offset_in_chunk..offset_in_chunk + take].copy_from_slice(&remaining[..take]);
                state.dirty_chunks.insert(idx, chunk);
                remaining = &remaining[take..];
                pos += take as u64;
            }
        }

        while !remaining.is_empty() {
            let idx = pos / self.chunk_size;
            let take = remaining.len().min(self.chunk_size as usize);
            let mut chunk = vec![0u8; self.chunk_size as usize];
            chunk[..take].copy_from_slice(&remaining[..take]);
            state.dirty_chunks.insert(idx, chunk);
            remaining = &remaining[take..];
            pos += take as u64;
        }

        state.size = Some(size + data.len() as u64);
        Ok(())
    }

    /// Shrink (or zero-extend) the virtual size to exactly `new_size`,
    /// dropping now-irrelevant dirty chunks and right-trimming the
    /// boundary chunk.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let mut state = self.state.write();
        if new_size == 0 {
            state.dirty_chunks.clear();
        } else {
            let last_idx = (new_size - 1) / self.chunk_size;
            state.dirty_chunks.retain(|&idx, _| idx <= last_idx);
            let boundary_len = new_size - last_idx * self.chunk_size;
            if boundary_len < self.chunk_size {
                let mut chunk = self.load_chunk(&state, last_idx)?;
                for byte in chunk.iter_mut().skip(boundary_len as usize) {
                    *byte = 0;
                }
                state.dirty_chunks.insert(last_idx, chunk);
            }
        }
        state.backend.truncate(new_size)?;
        state.size = Some(new_size);
        Ok(())
    }

    /// Flush every dirty chunk to the backend in ascending order, backing
    /// up each one's pre-image through the attached journal (if any)
    /// first.
    pub fn commit(&self) -> Result<()> {
        let (max_page_index, metadata_bytes) = (self.metadata_snapshot)();
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap()
                .start_transaction(max_page_index, &metadata_bytes)?;
        }

        let result = self.commit_locked();

        if let Some(journal) = &self.journal {
            journal.lock().unwrap().end_transaction(result.as_ref().err())?;
        }
        if result.is_ok() {
            // This transaction's metadata mutations are now durable on the
            // backend (and the journal has reset); advance the committed
            // snapshot so the *next* transaction's pre-image baseline is
            // this one's end state, not its start state.
            (self.mark_committed)();
        }
        result
    }

    fn commit_locked(&self) -> Result<()> {
        let mut state = self.state.write();
        let dirty: Vec<(u64, Vec<u8>)> = state
            .dirty_chunks
            .iter()
            .map(|(idx, bytes)| (*idx, bytes.clone()))
            .collect();

        let on_disk_size = state.backend.size()?;
        let virtual_size = self.current_size(&state)?;
        if virtual_size > on_disk_size {
            let zeros = vec![0u8; (virtual_size - on_disk_size) as usize];
            state.backend.append(&zeros)?;
        }

        for (idx, chunk) in &dirty {
            let position = idx * self.chunk_size;
            if position < on_disk_size {
                let real_len = self.chunk_size.min(on_disk_size - position) as usize;
                if let Some(journal) = &self.journal {
                    let pre_image = self.clean_chunks.get_or_try_compute(idx, || {
                        let mut bytes = state.backend.read(position, Some(self.chunk_size))?;
                        if (bytes.len() as u64) < self.chunk_size {
                            bytes.resize(self.chunk_size as usize, 0);
                        }
                        Result::Ok(bytes)
                    })?;
                    journal
                        .lock()
                        .unwrap()
                        .backup_page(*idx as u32, &pre_image[..real_len])?;
                }
            }
            state.backend.update(position, chunk)?;
            self.clean_chunks.put(*idx, chunk.clone());
        }

        state.dirty_chunks.clear();
        Ok(())
    }

    /// Request a debounced commit; see [`Debouncer::commit_with_debounce`].
    pub fn commit_with_debounce(&self) -> Result<()> {
        self.debouncer.commit_with_debounce()
    }

    /// Force any pending debounced commit to run now.
    pub fn commit_now(&self) -> Result<()> {
        self.debouncer.commit_now()
    }

    /// Cancel any pending debounced commit without running it.
    pub fn cancel_pending_commit(&self) {
        self.debouncer.cancel();
    }

    /// Current virtual size in bytes.
    pub fn size(&self) -> Result<u64> {
        let state = self.state.read();
        self.current_size(&state)
    }

    /// Drop every cached clean chunk, forcing the next read to refetch
    /// from the backend. Used after a journal restore replaces the file's
    /// contents out from under this cache.
    pub fn invalidate_all(&self) {
        self.clean_chunks.clear();
    }

    /// Close the underlying backend. Any uncommitted dirty chunks are
    /// discarded without being flushed.
    pub fn close(&self) -> Result<()> {
        self.debouncer.cancel();
        self.state.write().backend.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn unique_path(name: &str) -> String {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("mem://virtual-{name}-{n}")
    }

    fn no_journal_snapshot() -> Arc<dyn Fn() -> (u32, Vec<u8>) + Send + Sync> {
        Arc::new(|| (0, Vec::new()))
    }

    fn no_op_mark_committed() -> Arc<dyn Fn() + Send + Sync> {
        Arc::new(|| {})
    }

    #[test]
    fn reads_see_dirty_writes_before_commit() {
        let path = unique_path("dirty-read");
        let mut backend = MemoryBackend::new();
        backend.create(&path, &vec![0u8; 20]).unwrap();

        let engine = VirtualEngine::new(
            backend,
            10,
            Duration::from_secs(60),
            Duration::ZERO,
            10,
            None,
            no_journal_snapshot(),
            no_op_mark_committed(),
        )
        .unwrap();

        engine.update(5, b"HELLO").unwrap();
        assert_eq!(&engine.read(5, Some(5)).unwrap(), b"HELLO");
    }

    #[test]
    fn commit_applies_dirty_chunks_to_backend() {
        let path = unique_path("commit");
        let mut backend = MemoryBackend::new();
        backend.create(&path, &vec![0u8; 20]).unwrap();
        let mut verify = backend.try_clone_fresh();
        verify.open(&path).unwrap();

        let engine = VirtualEngine::new(
            backend,
            10,
            Duration::from_secs(60),
            Duration::ZERO,
            10,
            None,
            no_journal_snapshot(),
            no_op_mark_committed(),
        )
        .unwrap();
        engine.update(0, b"0123456789").unwrap();
        engine.commit().unwrap();

        assert_eq!(verify.read(0, Some(10)).unwrap(), b"0123456789");
    }

    #[test]
    fn append_extends_size_and_commits_new_chunks() {
        let path = unique_path("append");
        let mut backend = MemoryBackend::new();
        backend.create(&path, b"hello").unwrap();
        let mut verify = backend.try_clone_fresh();
        verify.open(&path).unwrap();

        let engine = VirtualEngine::new(
            backend,
            10,
            Duration::from_secs(60),
            Duration::ZERO,
            10,
            None,
            no_journal_snapshot(),
            no_op_mark_committed(),
        )
        .unwrap();
        engine.append(b" world!!!!").unwrap();
        assert_eq!(engine.size().unwrap(), 15);
        engine.commit().unwrap();
        assert_eq!(verify.size().unwrap(), 15);
        assert_eq!(verify.read(0, None).unwrap(), b"hello world!!!!");
    }

    #[test]
    fn truncate_drops_chunks_beyond_boundary() {
        let path = unique_path("truncate");
        let mut backend = MemoryBackend::new();
        backend.create(&path, &vec![0xAAu8; 30]).unwrap();

        let engine = VirtualEngine::new(
            backend,
            10,
            Duration::from_secs(60),
            Duration::ZERO,
            10,
            None,
            no_journal_snapshot(),
            no_op_mark_committed(),
        )
        .unwrap();
        engine.truncate(12).unwrap();
        assert_eq!(engine.size().unwrap(), 12);
        let tail = engine.read(10, Some(2)).unwrap();
        assert_eq!(tail, vec![0xAA, 0xAA]);
        let past_end = engine.read(12, None).unwrap();
        assert!(past_end.is_empty());
    }

    #[test]
    fn commit_backs_up_preimage_through_journal() {
        let path = unique_path("backup");
        let mut backend = MemoryBackend::new();
        let original = vec![0x11u8; 10];
        backend.create(&path, &original).unwrap();

        let journal = Arc::new(Mutex::new(Journal::<MemoryBackend>::new(
            MemoryBackend::new(),
            &path,
        )));
        let engine = VirtualEngine::new(
            backend,
            10,
            Duration::from_secs(60),
            Duration::ZERO,
            10,
            Some(Arc::clone(&journal)),
            no_journal_snapshot(),
            no_op_mark_committed(),
        )
        .unwrap();

        engine.update(0, &vec![0x22u8; 10]).unwrap();
        engine.commit().unwrap();

        // A clean commit ends the transaction and resets the journal, so
        // no pre-image should remain after the fact, but the journal must
        // have been opened and written to along the way.
        assert!(journal.lock().unwrap().exists().unwrap());
        assert!(!journal.lock().unwrap().is_working());
    }
}
