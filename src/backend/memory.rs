//! In-process, non-filesystem storage backend.
//!
//! Stands in for the spec's "browser OPFS" collaborator: a backend that is
//! not a real file, used for tests and for embedding this crate in
//! environments with no filesystem. A process-wide registry keyed by path
//! lets independently-constructed instances (e.g. the main database
//! backend and the journal's own clone) observe the same logical files,
//! matching a real filesystem's shared namespace.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::backend::StorageBackend;
use crate::error::{Error, Result};

fn registry() -> &'static Mutex<HashMap<String, Vec<u8>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Vec<u8>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A [`StorageBackend`] backed by an in-memory byte buffer shared through a
/// process-wide registry.
pub struct MemoryBackend {
    path: Option<String>,
}

impl StorageBackend for MemoryBackend {
    fn new() -> Self {
        MemoryBackend { path: None }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(registry().lock().unwrap().contains_key(path))
    }

    fn boot(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn create(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        registry()
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
        self.path = Some(path.to_string());
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<()> {
        if self.path.is_some() {
            return Ok(());
        }
        if !registry().lock().unwrap().contains_key(path) {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        self.path = Some(path.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.path = None;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let path = self.path.as_ref().ok_or(Error::Closing)?;
        Ok(registry()
            .lock()
            .unwrap()
            .get(path)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    fn read(&self, offset: u64, len: Option<u64>) -> Result<Vec<u8>> {
        let path = self.path.as_ref().ok_or(Error::Closing)?;
        let registry = registry().lock().unwrap();
        let data = registry.get(path).map(Vec::as_slice).unwrap_or(&[]);
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let available = data.len() - offset;
        let want = len.map(|l| l as usize).unwrap_or(available).min(available);
        Ok(data[offset..offset + want].to_vec())
    }

    fn update(&mut self, offset: u64, bytes: &[u8]) -> Result<usize> {
        let path = self.path.clone().ok_or(Error::Closing)?;
        let mut registry = registry().lock().unwrap();
        let data = registry.entry(path).or_default();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let writable = bytes.len().min(data.len() - offset);
        data[offset..offset + writable].copy_from_slice(&bytes[..writable]);
        Ok(writable)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone().ok_or(Error::Closing)?;
        registry()
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        let path = self.path.clone().ok_or(Error::Closing)?;
        registry()
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .resize(new_size as usize, 0);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        registry().lock().unwrap().remove(path);
        if self.path.as_deref() == Some(path) {
            self.path = None;
        }
        Ok(())
    }

    fn reset(&mut self, path: &str) -> Result<()> {
        self.unlink(path)
    }

    fn try_clone_fresh(&self) -> Self {
        MemoryBackend::new()
    }
}
