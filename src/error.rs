//! Error taxonomy and `Result` alias for tissueroll.

use std::io;

/// Classified failure kinds surfaced by every public operation.
///
/// Variants correspond 1:1 to the error taxonomy table in the core
/// specification: each condition a caller might reasonably branch on gets
/// its own variant instead of a single opaque "database error".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `create` called on a path that already exists without `overwrite`.
    #[error("database already exists at {path}")]
    AlreadyExists {
        /// Path the caller attempted to create.
        path: String,
    },

    /// `open` called on a missing path without create-on-open.
    #[error("database not found at {path}")]
    NotFound {
        /// Path the caller attempted to open.
        path: String,
    },

    /// Metadata magic mismatch on open; the database is left untouched.
    #[error("invalid database file: {reason}")]
    Invalid {
        /// Human-readable detail (e.g. bad magic, truncated header).
        reason: String,
    },

    /// Operation targeted a record whose deleted flag is set.
    #[error("record already deleted")]
    AlreadyDeleted,

    /// An alias chain pointed at a record that no longer exists or whose
    /// salt/header no longer agrees with the pointer (stale alias).
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// Human-readable detail.
        reason: String,
    },

    /// A journal-dependent feature was requested against a backend or
    /// configuration that does not support it.
    #[error("unsupported engine configuration: {reason}")]
    UnsupportedEngine {
        /// Human-readable detail.
        reason: String,
    },

    /// An operation was attempted after `close()` began or completed.
    #[error("database is closing")]
    Closing,

    /// Underlying storage backend I/O failure; propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Document-layer scheme validation failed. The core never raises this
    /// itself; the variant exists so the document layer (out of scope here)
    /// can report through the same `Error` type.
    #[error("validation failed: {reason}")]
    ValidationFailed {
        /// Human-readable detail.
        reason: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(Error::AlreadyDeleted.to_string(), "record already deleted");
        assert_eq!(Error::Closing.to_string(), "database is closing");
    }
}
