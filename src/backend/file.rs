//! Real-filesystem storage backend.
//!
//! Grounded on the teacher's `os/unix.rs`/`os/windows.rs` cfg-gated split
//! for positioned I/O, reimplemented against `std::os::{unix,windows}::fs`
//! extension traits instead of raw `libc`/`windows-sys` calls — positioned
//! reads and writes need no `unsafe` at the `std` layer.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::backend::StorageBackend;
use crate::error::{Error, Result};

/// A [`StorageBackend`] over a real OS file, opened once and reused for
/// every positioned read/write.
pub struct FileBackend {
    file: Option<File>,
    path: Option<String>,
}

impl StorageBackend for FileBackend {
    fn new() -> Self {
        FileBackend {
            file: None,
            path: None,
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(Path::new(path).exists())
    }

    fn boot(&mut self, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn create(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        write_at(&file, bytes, 0)?;
        self.file = Some(file);
        self.path = Some(path.to_string());
        Ok(())
    }

    fn open(&mut self, path: &str) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.file = Some(file);
        self.path = Some(path.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.open_file()?.metadata()?.len())
    }

    fn read(&self, offset: u64, len: Option<u64>) -> Result<Vec<u8>> {
        let file = self.open_file()?;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Ok(Vec::new());
        }
        let available = file_len - offset;
        let want = len.unwrap_or(available).min(available) as usize;
        let mut buf = vec![0u8; want];
        read_at(file, &mut buf, offset)?;
        Ok(buf)
    }

    fn update(&mut self, offset: u64, bytes: &[u8]) -> Result<usize> {
        let file_len = self.size()?;
        if offset >= file_len {
            return Ok(0);
        }
        let writable = bytes.len().min((file_len - offset) as usize);
        write_at(self.open_file()?, &bytes[..writable], offset)?;
        Ok(writable)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.size()?;
        write_at(self.open_file()?, bytes, end)
    }

    fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.open_file()?.set_len(new_size)?;
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<()> {
        self.file = None;
        self.path = None;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn reset(&mut self, path: &str) -> Result<()> {
        self.unlink(path)
    }

    fn try_clone_fresh(&self) -> Self {
        FileBackend::new()
    }
}

impl FileBackend {
    fn open_file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Closing)
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            break;
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_read_update_append_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let path = path.to_str().unwrap();

        let mut backend = FileBackend::new();
        backend.create(path, b"hello").unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert_eq!(backend.read(0, None).unwrap(), b"hello");

        let written = backend.update(0, b"HE").unwrap();
        assert_eq!(written, 2);
        assert_eq!(backend.read(0, Some(5)).unwrap(), b"HEllo");

        // update never extends the file.
        let written = backend.update(3, b"LONGER THAN REMAINING").unwrap();
        assert_eq!(written, 2);
        assert_eq!(backend.size().unwrap(), 5);

        backend.append(b"!!!").unwrap();
        assert_eq!(backend.size().unwrap(), 8);

        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.read(0, None).unwrap(), b"HELL");
    }

    #[test]
    fn unlink_is_not_an_error_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mut backend = FileBackend::new();
        backend.unlink(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn exists_reflects_filesystem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let backend = FileBackend::new();
        assert!(!backend.exists(path.to_str().unwrap()).unwrap());
        std::fs::write(&path, b"x").unwrap();
        assert!(backend.exists(path.to_str().unwrap()).unwrap());
    }
}
