//! The record engine: page allocation, record placement, overflow chaining,
//! alias-based updates, and the public [`Engine`] façade built on top of the
//! virtual engine and journal.
//!
//! Grounded on the teacher's `storage/btree.rs` (a page-oriented structure
//! with slotted cells and overflow continuation pages — the same shape as
//! this crate's Internal/Overflow page split) for the allocation and
//! cell-directory bookkeeping, and on `storage/pcache.rs`'s cache-by-key
//! pattern, reused here via [`crate::cache::Cache`] for the page-header,
//! record, and id/coordinate lookup tiers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::backend::StorageBackend;
use crate::cache::Cache;
use crate::crypto;
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::locker::Locker;
use crate::metadata::{self, Metadata};
use crate::page::{self, PageHeader};
use crate::record::{self, Record, RecordHeader};
use crate::transaction::TransactionManager;
use crate::types::{Coordinate, PageType};
use crate::virtual_engine::VirtualEngine;

/// Tuning knobs for [`Engine::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Payload bytes reserved per page. Total on-disk page size is this plus
    /// the 100-byte page header.
    pub payload_size: u32,
    /// Replace an existing file at the target path instead of failing.
    pub overwrite: bool,
    /// Maintain a crash-safe undo journal alongside the database file.
    pub journal: bool,
    /// How long a completed write waits before its commit actually runs.
    /// Zero means every write commits immediately.
    pub commit_debounce: Duration,
    /// Force a commit after this many debounced writes in a row, even if
    /// `commit_debounce` has not yet elapsed since the last one.
    pub commit_debounce_maximum_skip: u32,
    /// How long a cached page header, record, or id/coordinate lookup stays
    /// valid before being recomputed.
    pub cache_lifespan: Duration,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            payload_size: 4096,
            overwrite: false,
            journal: true,
            commit_debounce: Duration::ZERO,
            commit_debounce_maximum_skip: 10,
            cache_lifespan: Duration::from_secs(180),
        }
    }
}

/// Tuning knobs for [`Engine::open`]. The `payload_size` field only applies
/// when `open` falls back to creating a database at a missing path.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub payload_size: u32,
    pub journal: bool,
    pub commit_debounce: Duration,
    pub commit_debounce_maximum_skip: u32,
    pub cache_lifespan: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            payload_size: 4096,
            journal: true,
            commit_debounce: Duration::ZERO,
            commit_debounce_maximum_skip: 10,
            cache_lifespan: Duration::from_secs(180),
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct EngineInner<B: StorageBackend> {
    path: String,
    virtual_engine: Arc<VirtualEngine<B>>,
    journal: Option<Arc<Mutex<Journal<B>>>>,
    metadata: Arc<Locker<Metadata>>,
    transactions: TransactionManager<B>,
    header_cache: Cache<u32, PageHeader>,
    record_position_cache: Cache<(u32, u32), u64>,
    record_cache: Cache<(u32, u32), Record>,
    id_cache: Cache<Coordinate, String>,
    coord_cache: Cache<String, Coordinate>,
    closed: AtomicBool,
}

impl<B: StorageBackend> EngineInner<B> {
    fn page_size(&self) -> u32 {
        self.metadata.read().page_size()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        Ok(())
    }

    fn page_header(&self, idx: u32) -> Result<PageHeader> {
        self.header_cache.get_or_try_compute(&idx, || {
            let bytes = self.virtual_engine.read(
                page::page_position(idx, self.page_size()),
                Some(page::PAGE_HEADER_SIZE as u64),
            )?;
            Ok(PageHeader::from_bytes(&bytes))
        })
    }

    fn write_page_header(&self, idx: u32, header: &PageHeader) -> Result<()> {
        self.virtual_engine
            .update(page::page_position(idx, self.page_size()), &header.to_bytes())?;
        self.header_cache.put(idx, *header);
        Ok(())
    }

    fn write_cell(&self, idx: u32, order: u32, payload_offset: u32) -> Result<()> {
        self.virtual_engine.update(
            page::cell_position(idx, order, self.page_size()),
            &payload_offset.to_be_bytes(),
        )?;
        Ok(())
    }

    fn read_cell(&self, idx: u32, order: u32) -> Result<u32> {
        let bytes = self
            .virtual_engine
            .read(page::cell_position(idx, order, self.page_size()), Some(4))?;
        Ok(u32::from_be_bytes(bytes[..4].try_into().unwrap()))
    }

    fn record_position(&self, idx: u32, order: u32) -> Result<u64> {
        self.record_position_cache.get_or_try_compute(&(idx, order), || {
            let payload_offset = self.read_cell(idx, order)?;
            Ok(page::payload_position(idx, self.page_size()) + payload_offset as u64)
        })
    }

    fn record_id(&self, coord: Coordinate) -> Result<String> {
        let secret_key = self.metadata.read().secret_key;
        self.id_cache
            .get_or_try_compute(&coord, || Ok::<_, Error>(crypto::encode_id(&secret_key, coord)))
    }

    fn coordinate_of(&self, record_id: &str) -> Result<Coordinate> {
        let secret_key = self.metadata.read().secret_key;
        self.coord_cache
            .get_or_try_compute(&record_id.to_string(), || crypto::decode_id(&secret_key, record_id))
    }

    /// Allocate a fresh, empty page of `page_type`, bumping `nextIndex` (and,
    /// for an Internal page the caller wants as the new insertion target,
    /// `lastInternalIndex`) in the persisted metadata first.
    fn add_empty_page(&self, page_type: PageType, increment_internal_index: bool) -> Result<u32> {
        let (new_index, payload_size) = {
            let mut md = self.metadata.write();
            md.next_index += 1;
            let new_index = md.next_index;
            self.virtual_engine
                .update(metadata::FIELD_NEXT_INDEX as u64, &new_index.to_be_bytes())?;
            if page_type == PageType::Internal && increment_internal_index {
                md.last_internal_index = new_index;
                self.virtual_engine.update(
                    metadata::FIELD_LAST_INTERNAL_INDEX as u64,
                    &new_index.to_be_bytes(),
                )?;
            }
            (new_index, md.payload_size)
        };

        let header = PageHeader::empty(page_type, new_index, payload_size);
        let mut page_bytes = header.to_bytes().to_vec();
        page_bytes.resize(page::PAGE_HEADER_SIZE + payload_size as usize, 0);
        self.virtual_engine.append(&page_bytes)?;
        self.header_cache.put(new_index, header);
        Ok(new_index)
    }

    /// Decode a record at `(idx, order)`, transparently stitching an overflow
    /// chain back into one contiguous payload.
    fn read_record(&self, idx: u32, order: u32) -> Result<Record> {
        self.record_cache.get_or_try_compute(&(idx, order), || {
            let page_header = self.page_header(idx)?;
            let position = self.record_position(idx, order)?;
            let header_bytes = self
                .virtual_engine
                .read(position, Some(record::RECORD_HEADER_SIZE as u64))?;
            let header = RecordHeader::from_bytes(&header_bytes);

            if page_header.next == 0 {
                let payload = self
                    .virtual_engine
                    .read(position + record::RECORD_HEADER_SIZE as u64, Some(header.length as u64))?;
                return Ok(Record { header, payload });
            }

            let payload_size = self.metadata.read().payload_size;
            let chunk_capacity = payload_size - page::CELL_SIZE as u32;
            let mut payload = Vec::with_capacity(header.length as usize);

            let head_slice_len = (chunk_capacity as usize)
                .saturating_sub(record::RECORD_HEADER_SIZE)
                .min(header.length as usize);
            let head_slice = self.virtual_engine.read(
                position + record::RECORD_HEADER_SIZE as u64,
                Some(head_slice_len as u64),
            )?;
            payload.extend_from_slice(&head_slice);

            let page_size = self.page_size();
            let mut next = page_header.next;
            while next != 0 && payload.len() < header.length as usize {
                let next_header = self.page_header(next)?;
                let want = (header.length as usize - payload.len()).min(chunk_capacity as usize);
                let chunk = self
                    .virtual_engine
                    .read(page::payload_position(next, page_size), Some(want as u64))?;
                payload.extend_from_slice(&chunk);
                next = next_header.next;
            }

            Ok(Record { header, payload })
        })
    }

    /// Append `payload` to page `idx` as a brand-new, self-contained
    /// record (spec §4.3.4 step 4): caller has already checked
    /// `header.free >= record_usage`.
    fn put_inline(&self, idx: u32, mut header: PageHeader, payload: &[u8]) -> Result<Coordinate> {
        let payload_size = self.metadata.read().payload_size;
        let record_size = record::RECORD_HEADER_SIZE as u32 + payload.len() as u32;
        let record_usage = page::CELL_SIZE as u32 + record_size;

        let order = header.count + 1;
        let payload_offset = payload_size - header.free;
        let record = Record {
            header: RecordHeader::new(Coordinate::new(idx, order), payload.len() as u32),
            payload: payload.to_vec(),
        };
        let position = page::payload_position(idx, self.page_size()) + payload_offset as u64;
        self.virtual_engine.update(position, &record.to_bytes())?;
        self.write_cell(idx, order, payload_offset)?;

        header.count = order;
        header.free -= record_usage;
        self.write_page_header(idx, &header)?;

        self.record_cache.put((idx, order), record);
        self.record_position_cache.put((idx, order), position);
        Ok(Coordinate::new(idx, order))
    }

    /// Insert `text` as a brand-new record, returning its coordinate.
    /// `auto_increment` controls whether the document-level counters
    /// (`autoIncrement`, `count`) advance — callers re-homing an existing
    /// record's payload during an update pass `false`.
    fn internal_put(&self, text: &str, auto_increment: bool) -> Result<Coordinate> {
        let payload = text.as_bytes();

        let mut idx = self.metadata.read().last_internal_index;
        if idx == 0 {
            idx = self.add_empty_page(PageType::Internal, true)?;
        }
        let mut header = self.page_header(idx)?;

        if auto_increment {
            let mut md = self.metadata.write();
            md.auto_increment += 1;
            md.count += 1;
            self.virtual_engine
                .update(metadata::FIELD_AUTO_INCREMENT as u64, &md.auto_increment.to_be_bytes())?;
            self.virtual_engine
                .update(metadata::FIELD_COUNT as u64, &md.count.to_be_bytes())?;
        }

        let payload_size = self.metadata.read().payload_size;
        let record_size = record::RECORD_HEADER_SIZE as u32 + payload.len() as u32;
        let record_usage = page::CELL_SIZE as u32 + record_size;

        if header.free >= record_usage {
            return self.put_inline(idx, header, payload);
        }

        let head_was_used = header.count > 0;
        if head_was_used {
            idx = self.add_empty_page(PageType::Internal, true)?;
            header = self.page_header(idx)?;
            // A freshly allocated page starts with `free == payload_size`;
            // the record may still fit on it inline (spec §4.3.4 step 7)
            // and only needs the overflow/chunking path below when it
            // doesn't (`chunks > 1`).
            if header.free >= record_usage {
                return self.put_inline(idx, header, payload);
            }
        }

        let chunk_capacity = payload_size - page::CELL_SIZE as u32;
        let head_idx = idx;
        let order = header.count + 1;

        let mut full_record =
            Vec::with_capacity(record::RECORD_HEADER_SIZE + payload.len());
        full_record.extend_from_slice(
            &RecordHeader::new(Coordinate::new(head_idx, order), payload.len() as u32).to_bytes(),
        );
        full_record.extend_from_slice(payload);

        let mut remaining = full_record.as_slice();
        let mut current_idx = head_idx;
        loop {
            let take = remaining.len().min(chunk_capacity as usize);
            let slice = &remaining[..take];
            self.virtual_engine
                .update(page::payload_position(current_idx, self.page_size()), slice)?;
            self.write_cell(current_idx, 1, 0)?;
            remaining = &remaining[take..];

            let is_last = remaining.is_empty();
            let next_idx = if is_last {
                0
            } else {
                self.add_empty_page(PageType::Overflow, false)?
            };
            let page_type = if current_idx == head_idx {
                PageType::Internal
            } else {
                PageType::Overflow
            };
            let stamped = PageHeader {
                page_type,
                index: current_idx,
                next: next_idx,
                count: 1,
                free: 0,
            };
            self.write_page_header(current_idx, &stamped)?;

            if is_last {
                break;
            }
            current_idx = next_idx;
        }

        if !head_was_used {
            // This page was already lastInternalIndex before we filled it
            // with an overflow chain; start the next put on a clean one.
            self.add_empty_page(PageType::Internal, true)?;
        }

        self.record_cache.put(
            (head_idx, order),
            Record {
                header: RecordHeader::new(Coordinate::new(head_idx, order), payload.len() as u32),
                payload: payload.to_vec(),
            },
        );
        Ok(Coordinate::new(head_idx, order))
    }

    /// Rewrite an existing overflow chain's header and payload in place,
    /// walking it page by page. When `allow_grow` is set, pages are appended
    /// to the chain as needed; otherwise running out of existing pages is an
    /// error (the caller is expected to have already checked capacity).
    fn write_overflow_chain(
        &self,
        coord: Coordinate,
        header: RecordHeader,
        payload: &[u8],
        allow_grow: bool,
    ) -> Result<()> {
        let payload_size = self.metadata.read().payload_size;
        let chunk_capacity = payload_size - page::CELL_SIZE as u32;

        let mut full_record = Vec::with_capacity(record::RECORD_HEADER_SIZE + payload.len());
        full_record.extend_from_slice(&header.to_bytes());
        full_record.extend_from_slice(payload);
        let mut remaining = full_record.as_slice();

        let mut current_idx = coord.index;
        loop {
            let take = remaining.len().min(chunk_capacity as usize);
            let slice = &remaining[..take];
            self.virtual_engine
                .update(page::payload_position(current_idx, self.page_size()), slice)?;
            self.write_cell(current_idx, 1, 0)?;
            remaining = &remaining[take..];

            if remaining.is_empty() {
                break;
            }

            let current_header = self.page_header(current_idx)?;
            let next_idx = if current_header.next != 0 {
                current_header.next
            } else if allow_grow {
                let new_idx = self.add_empty_page(PageType::Overflow, false)?;
                let mut patched = current_header;
                patched.next = new_idx;
                self.write_page_header(current_idx, &patched)?;
                self.write_page_header(
                    new_idx,
                    &PageHeader { page_type: PageType::Overflow, index: new_idx, next: 0, count: 1, free: 0 },
                )?;
                new_idx
            } else {
                return Err(Error::InvalidRecord {
                    reason: "record grew beyond its reserved capacity".into(),
                });
            };
            current_idx = next_idx;
        }

        self.record_cache
            .put((coord.index, coord.order), Record { header, payload: payload.to_vec() });
        Ok(())
    }

    fn write_record_header(&self, coord: Coordinate, header: RecordHeader, payload: Vec<u8>) -> Result<()> {
        let position = self.record_position(coord.index, coord.order)?;
        self.virtual_engine.update(position, &header.to_bytes())?;
        self.record_cache.put((coord.index, coord.order), Record { header, payload });
        Ok(())
    }

    fn mark_deleted(&self, coord: Coordinate, record: Record) -> Result<()> {
        let position = self.record_position(coord.index, coord.order)?;
        self.virtual_engine
            .update(position + RecordHeader::DELETED_FLAG_OFFSET, &[1u8])?;
        let mut header = record.header;
        header.deleted = true;
        self.record_cache
            .put((coord.index, coord.order), Record { header, payload: record.payload });
        Ok(())
    }

    fn pick_coordinate(&self, coord: Coordinate, follow_alias: bool) -> Result<(Coordinate, Record)> {
        let record = self.read_record(coord.index, coord.order)?;
        if follow_alias && record.header.has_alias() {
            return self.pick_coordinate(record.header.alias, false);
        }
        if record.header.deleted {
            return Err(Error::AlreadyDeleted);
        }
        Ok((coord, record))
    }

    fn pick_internal(&self, record_id: &str, follow_alias: bool) -> Result<(Coordinate, Record)> {
        let coord = self.coordinate_of(record_id)?;
        self.pick_coordinate(coord, follow_alias)
    }

    fn update_internal(&self, record_id: &str, text: &str) -> Result<String> {
        let head_coord = self.coordinate_of(record_id)?;
        let head = self.read_record(head_coord.index, head_coord.order)?;
        if head.header.deleted {
            return Err(Error::AlreadyDeleted);
        }

        let tail_coord = if head.header.has_alias() {
            head.header.alias
        } else {
            head_coord
        };
        let tail = if tail_coord == head_coord {
            head.clone()
        } else {
            self.read_record(tail_coord.index, tail_coord.order)?
        };
        if tail.header.deleted {
            return Err(Error::AlreadyDeleted);
        }

        let payload = text.as_bytes();
        let tail_page_header = self.page_header(tail_coord.index)?;
        let tail_is_inline = tail_page_header.next == 0;
        let grows_past_capacity = payload.len() as u32 > tail.header.max_length;

        if grows_past_capacity {
            if tail_is_inline {
                // Case A: the tail's page has no spare room to grow into and
                // is not itself an overflow chain to extend — place the new
                // content at a brand-new coordinate and alias the original
                // id to it, leaving the old id resolvable through one hop.
                let new_coord = self.internal_put(text, false)?;
                let new_id = self.record_id(new_coord)?;

                let mut aliased_header = head.header;
                aliased_header.alias = new_coord;
                self.write_record_header(head_coord, aliased_header, head.payload.clone())?;

                if head_coord != tail_coord {
                    self.mark_deleted(tail_coord, tail)?;
                }
                return Ok(new_id);
            }

            // Case B: the tail is already an overflow chain; extend it.
            let mut new_header = tail.header;
            new_header.length = payload.len() as u32;
            new_header.max_length = payload.len() as u32;
            self.write_overflow_chain(tail_coord, new_header, payload, true)?;
            return Ok(record_id.to_string());
        }

        // Case C: the new content fits within the capacity already reserved
        // for this record; `max_length` is left untouched so the record
        // never has to re-grow its chain if the caller shrinks and regrows.
        let mut new_header = tail.header;
        new_header.length = payload.len() as u32;
        if tail_is_inline {
            let position = self.record_position(tail_coord.index, tail_coord.order)?;
            let record = Record { header: new_header, payload: payload.to_vec() };
            self.virtual_engine.update(position, &record.to_bytes())?;
            self.record_cache.put((tail_coord.index, tail_coord.order), record);
        } else {
            self.write_overflow_chain(tail_coord, new_header, payload, false)?;
        }
        Ok(record_id.to_string())
    }

    fn delete_internal(&self, record_id: &str) -> Result<()> {
        let coord = self.coordinate_of(record_id)?;
        let (tail_coord, record) = self.pick_coordinate(coord, true)?;
        self.mark_deleted(tail_coord, record)?;

        let mut md = self.metadata.write();
        if md.count > 0 {
            md.count -= 1;
            self.virtual_engine
                .update(metadata::FIELD_COUNT as u64, &md.count.to_be_bytes())?;
        }
        Ok(())
    }

    fn get_records_internal(&self, page_index: u32) -> Result<Vec<Record>> {
        let header = self.page_header(page_index)?;
        let mut records = Vec::with_capacity(header.count as usize);
        for order in 1..=header.count {
            records.push(self.read_record(page_index, order)?);
        }
        Ok(records)
    }
}

/// A single-file, append-biased record store.
///
/// Cheaply cloneable: every clone shares the same underlying state, caches,
/// and transaction queue, matching the teacher's own connection-handle
/// style.
pub struct Engine<B: StorageBackend> {
    inner: Arc<EngineInner<B>>,
}

impl<B: StorageBackend> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Engine { inner: Arc::clone(&self.inner) }
    }
}

impl<B: StorageBackend> Engine<B> {
    fn assemble(
        path: &str,
        backend: B,
        metadata: Metadata,
        journal: Option<Journal<B>>,
        commit_debounce: Duration,
        commit_debounce_maximum_skip: u32,
        cache_lifespan: Duration,
    ) -> Result<Self> {
        let metadata = Arc::new(Locker::new(metadata));
        let journal = journal.map(|j| Arc::new(Mutex::new(j)));

        // The journal's own "last good" snapshot must reflect metadata as
        // of the last *successful commit*, not the live, already-mutated
        // in-memory `Metadata` — record/page operations bump `nextIndex`,
        // `count`, and `autoIncrement` before the virtual engine ever
        // commits, so reading the live struct at transaction-start time
        // would capture this transaction's own not-yet-durable changes and
        // replay them back in on restore instead of rolling them back.
        let committed_metadata: Arc<Mutex<(u32, Vec<u8>)>> = Arc::new(Mutex::new({
            let guard = metadata.read();
            (guard.next_index, guard.to_bytes().to_vec())
        }));

        let committed_for_snapshot = Arc::clone(&committed_metadata);
        let snapshot: Arc<dyn Fn() -> (u32, Vec<u8>) + Send + Sync> =
            Arc::new(move || committed_for_snapshot.lock().unwrap().clone());

        let committed_for_refresh = Arc::clone(&committed_metadata);
        let metadata_for_refresh = Arc::clone(&metadata);
        let mark_committed: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let guard = metadata_for_refresh.read();
            *committed_for_refresh.lock().unwrap() = (guard.next_index, guard.to_bytes().to_vec());
        });

        let page_size = metadata.read().page_size() as u64;
        let virtual_engine = VirtualEngine::new(
            backend,
            page_size,
            cache_lifespan,
            commit_debounce,
            commit_debounce_maximum_skip,
            journal.clone(),
            snapshot,
            mark_committed,
        )?;
        let transactions = TransactionManager::new(Arc::clone(&virtual_engine));

        Ok(Engine {
            inner: Arc::new(EngineInner {
                path: path.to_string(),
                virtual_engine,
                journal,
                metadata,
                transactions,
                header_cache: Cache::new(cache_lifespan),
                record_position_cache: Cache::new(cache_lifespan),
                record_cache: Cache::new(cache_lifespan),
                id_cache: Cache::new(cache_lifespan),
                coord_cache: Cache::new(cache_lifespan),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Create a brand-new database at `path`. Fails with
    /// [`Error::AlreadyExists`] unless `options.overwrite` is set.
    pub fn create(path: &str, options: CreateOptions) -> Result<Self> {
        let mut backend = B::new();
        backend.boot(path)?;
        if backend.exists(path)? {
            if !options.overwrite {
                return Err(Error::AlreadyExists { path: path.to_string() });
            }
            backend.unlink(path)?;
        }

        let secret_key = crypto::generate_secret_key();
        let metadata = Metadata::new(options.payload_size, current_millis(), secret_key);
        backend.create(path, &metadata.to_bytes())?;

        let journal = options
            .journal
            .then(|| Journal::new(backend.try_clone_fresh(), path));

        Self::assemble(
            path,
            backend,
            metadata,
            journal,
            options.commit_debounce,
            options.commit_debounce_maximum_skip,
            options.cache_lifespan,
        )
    }

    /// Open an existing database at `path`, creating one with `options` if
    /// none exists yet. If a journal is attached and records an interrupted
    /// write, rolls it back before the database becomes usable.
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let mut backend = B::new();
        backend.boot(path)?;

        if !backend.exists(path)? {
            let secret_key = crypto::generate_secret_key();
            let metadata = Metadata::new(options.payload_size, current_millis(), secret_key);
            backend.create(path, &metadata.to_bytes())?;
            let journal = options
                .journal
                .then(|| Journal::new(backend.try_clone_fresh(), path));
            return Self::assemble(
                path,
                backend,
                metadata,
                journal,
                options.commit_debounce,
                options.commit_debounce_maximum_skip,
                options.cache_lifespan,
            );
        }

        backend.open(path)?;

        // Deliberately do not read the live metadata prefix before giving the
        // journal a chance to restore: if the last shutdown crashed
        // mid-write to the metadata-bearing chunk, the live copy can itself
        // be torn (bad magic, partial fields) and `Metadata::from_bytes`
        // would fail before recovery ever ran. The journal keeps its own
        // trusted metadata snapshot independent of the live file, so it can
        // resolve that case on its own.
        let mut journal = options
            .journal
            .then(|| Journal::new(backend.try_clone_fresh(), path));
        let mut restored_metadata = None;
        if let Some(journal) = journal.as_mut() {
            let outcome = journal.restore(&mut backend)?;
            if outcome.restored {
                tracing::info!(path, "reopening database after journal restore");
                backend.close()?;
                backend.open(path)?;
            }
            restored_metadata = outcome.metadata;
        }

        let metadata = match restored_metadata {
            Some(metadata) => metadata,
            None => {
                let header_bytes = backend.read(0, Some(metadata::METADATA_SIZE as u64))?;
                Metadata::from_bytes(&header_bytes)?
            }
        };

        Self::assemble(
            path,
            backend,
            metadata,
            journal,
            options.commit_debounce,
            options.commit_debounce_maximum_skip,
            options.cache_lifespan,
        )
    }

    /// Look up a record by id, following at most one alias hop, and return
    /// its current text payload.
    pub fn pick(&self, record_id: &str) -> Result<String> {
        self.inner.ensure_open()?;
        let id = record_id.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.transactions.read(move || {
            let (_, record) = inner.pick_internal(&id, true)?;
            String::from_utf8(record.payload).map_err(|_| Error::InvalidRecord {
                reason: "payload is not valid UTF-8 text".into(),
            })
        })
    }

    /// Insert `text` as a new record and return its id.
    pub fn put(&self, text: &str) -> Result<String> {
        self.inner.ensure_open()?;
        let text = text.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.transactions.write(move || {
            let coord = inner.internal_put(&text, true)?;
            inner.record_id(coord)
        })
    }

    /// Insert every text in `texts` as its own record, in order, returning
    /// their ids in the same order. Runs as a single write transaction.
    pub fn batch(&self, texts: &[String]) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        let texts = texts.to_vec();
        let inner = Arc::clone(&self.inner);
        self.inner.transactions.write(move || {
            let mut ids = Vec::with_capacity(texts.len());
            for text in &texts {
                let coord = inner.internal_put(text, true)?;
                ids.push(inner.record_id(coord)?);
            }
            Ok(ids)
        })
    }

    /// Replace a record's content. Returns the id the content is now
    /// addressed by: the same id, unless the update could not grow in
    /// place, in which case a new id aliased from the original.
    pub fn update(&self, record_id: &str, text: &str) -> Result<String> {
        self.inner.ensure_open()?;
        let id = record_id.to_string();
        let text = text.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner
            .transactions
            .write(move || inner.update_internal(&id, &text))
    }

    /// Mark a record deleted. Further `pick`/`update`/`delete` calls against
    /// its id fail with [`Error::AlreadyDeleted`].
    pub fn delete(&self, record_id: &str) -> Result<()> {
        self.inner.ensure_open()?;
        let id = record_id.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.transactions.write(move || inner.delete_internal(&id))
    }

    /// Whether `record_id` currently resolves to a live (non-deleted)
    /// record.
    pub fn exists(&self, record_id: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        let id = record_id.to_string();
        let inner = Arc::clone(&self.inner);
        self.inner.transactions.read(move || match inner.pick_internal(&id, true) {
            Ok(_) => Ok(true),
            Err(Error::AlreadyDeleted) | Err(Error::InvalidRecord { .. }) => Ok(false),
            Err(e) => Err(e),
        })
    }

    /// List every live and deleted record on Internal page `page_index`, in
    /// slot order.
    pub fn get_records(&self, page_index: u32) -> Result<Vec<Record>> {
        self.inner.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .transactions
            .read(move || inner.get_records_internal(page_index))
    }

    /// Flush any pending writes and release the database's resources.
    /// Idempotent the first time; subsequent calls fail with
    /// [`Error::Closing`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        self.inner.transactions.close();
        self.inner.virtual_engine.commit_now()?;
        self.inner.virtual_engine.close()?;
        if let Some(journal) = &self.inner.journal {
            journal.lock().unwrap().close(&self.inner.path)?;
        }
        Ok(())
    }
}
