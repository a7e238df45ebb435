//! Storage backend capability set (spec §4.1) — the external collaborator
//! the record engine and journal read/write through.
//!
//! Grounded on the teacher's `types::VfsFile`/`types::Vfs` traits (same
//! "positioned read/write/truncate/size, paired open/close" capability set)
//! reimplemented as a single trait bound directly to a path rather than a
//! separate VFS-then-file split, since the spec names one flat capability
//! list rather than "a filesystem that opens files".

pub mod file;
pub mod memory;

use crate::error::Result;

/// Byte-addressed random-access backing store for a single logical file.
///
/// Every concrete backend (real file, in-memory buffer, or — out of core
/// scope — a browser OPFS handle) implements exactly this capability set;
/// the record engine, virtual engine, and journal never reach past it to a
/// concrete type.
pub trait StorageBackend: Send + 'static {
    /// Construct a fresh, unopened instance. Used both for the top-level
    /// database backend and — via [`StorageBackend::try_clone_fresh`] — to
    /// give the journal its own independent handle.
    fn new() -> Self;

    /// Whether `path` currently exists, without opening it.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Idempotent preparation (e.g. ensuring parent directories exist) that
    /// may be called any number of times before `open`/`create`.
    fn boot(&mut self, path: &str) -> Result<()>;

    /// Create `path` with the given initial contents. Fails if the backend
    /// cannot create a new file there (callers must check `exists` first
    /// per spec §6.1's "already exists" semantics).
    fn create(&mut self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Open `path` for reading and writing. Idempotent: calling `open`
    /// again while already open is a no-op.
    fn open(&mut self, path: &str) -> Result<()>;

    /// Close the currently open handle. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Current size in bytes of the open file.
    fn size(&self) -> Result<u64>;

    /// Read `len` bytes starting at `offset`, or to end-of-file if `len` is
    /// `None`. Reads past the end of file return fewer bytes than
    /// requested (never an error).
    fn read(&self, offset: u64, len: Option<u64>) -> Result<Vec<u8>>;

    /// Overwrite bytes starting at `offset`, never extending the file.
    /// Returns the number of bytes actually written (clamped to the
    /// current file size).
    fn update(&mut self, offset: u64, bytes: &[u8]) -> Result<usize>;

    /// Extend the file with `bytes`.
    fn append(&mut self, bytes: &[u8]) -> Result<()>;

    /// Truncate (or zero-extend) the file to exactly `new_size` bytes.
    fn truncate(&mut self, new_size: u64) -> Result<()>;

    /// Remove `path` entirely. Not an error if it does not exist.
    fn unlink(&mut self, path: &str) -> Result<()>;

    /// Return the backend to its pre-boot state for `path` (used by the
    /// journal after a successful restore or reset).
    fn reset(&mut self, path: &str) -> Result<()>;

    /// Produce a fresh, uninitialized instance of the same concrete
    /// backend — used so the journal never shares a handle with the main
    /// database file (spec §5).
    fn try_clone_fresh(&self) -> Self
    where
        Self: Sized;
}
