//! 200-byte file metadata header (spec §3.1 table).
//!
//! Grounded on the teacher's `storage/pager.rs` `JournalHeader::{to_bytes,
//! from_bytes}` fixed-offset big-endian (de)serialization pattern, applied
//! here to the record store's own metadata block instead of a rollback
//! journal header.

use crate::crypto::SECRET_KEY_LEN;
use crate::error::{Error, Result};

/// Literal identifier written at offset 0 of every database file.
pub const MAGIC: &[u8; 10] = b"TissueRoll";

/// Total on-disk size of the metadata block (spec §3.1).
pub const METADATA_SIZE: usize = 200;

const MAJOR_VERSION: u8 = 1;
const MINOR_VERSION: u8 = 0;
const PATCH_VERSION: u8 = 0;

// Cumulative field offsets within the 200-byte block.
const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = OFF_MAGIC + 10;
const OFF_MINOR: usize = OFF_MAJOR + 1;
const OFF_PATCH: usize = OFF_MINOR + 1;
const OFF_NEXT_INDEX: usize = OFF_PATCH + 1;
const OFF_PAYLOAD_SIZE: usize = OFF_NEXT_INDEX + 4;
const OFF_TIMESTAMP: usize = OFF_PAYLOAD_SIZE + 4;
const OFF_SECRET_KEY: usize = OFF_TIMESTAMP + 8;
const OFF_AUTO_INCREMENT: usize = OFF_SECRET_KEY + SECRET_KEY_LEN;
const OFF_COUNT: usize = OFF_AUTO_INCREMENT + 8;
const OFF_LAST_INTERNAL_INDEX: usize = OFF_COUNT + 4;
const USED_LEN: usize = OFF_LAST_INTERNAL_INDEX + 4;

/// Field offset of `nextIndex`, exposed so the virtual engine can patch it
/// in place without re-serializing the whole block.
pub const FIELD_NEXT_INDEX: usize = OFF_NEXT_INDEX;
/// Field offset of `autoIncrement`.
pub const FIELD_AUTO_INCREMENT: usize = OFF_AUTO_INCREMENT;
/// Field offset of `count`.
pub const FIELD_COUNT: usize = OFF_COUNT;
/// Field offset of `lastInternalIndex`.
pub const FIELD_LAST_INTERNAL_INDEX: usize = OFF_LAST_INTERNAL_INDEX;

/// Decoded file metadata (spec §3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub major_version: u8,
    pub minor_version: u8,
    pub patch_version: u8,
    /// Highest page index in use.
    pub next_index: u32,
    /// Configured payload size `P` for every page.
    pub payload_size: u32,
    /// Milliseconds since epoch at creation.
    pub timestamp: u64,
    /// AES-128 key used to encrypt/decrypt record IDs.
    pub secret_key: [u8; SECRET_KEY_LEN],
    /// Monotonic document counter.
    pub auto_increment: u64,
    /// Live record count.
    pub count: u32,
    /// Index of the Internal page currently being filled.
    pub last_internal_index: u32,
}

impl Metadata {
    /// Build a fresh metadata block for a newly created database.
    pub fn new(payload_size: u32, timestamp_ms: u64, secret_key: [u8; SECRET_KEY_LEN]) -> Self {
        Metadata {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            patch_version: PATCH_VERSION,
            next_index: 0,
            payload_size,
            timestamp: timestamp_ms,
            secret_key,
            auto_increment: 0,
            count: 0,
            last_internal_index: 0,
        }
    }

    /// Serialize to the fixed 200-byte on-disk representation.
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 10].copy_from_slice(MAGIC);
        buf[OFF_MAJOR] = self.major_version;
        buf[OFF_MINOR] = self.minor_version;
        buf[OFF_PATCH] = self.patch_version;
        buf[OFF_NEXT_INDEX..OFF_NEXT_INDEX + 4].copy_from_slice(&self.next_index.to_be_bytes());
        buf[OFF_PAYLOAD_SIZE..OFF_PAYLOAD_SIZE + 4]
            .copy_from_slice(&self.payload_size.to_be_bytes());
        buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[OFF_SECRET_KEY..OFF_SECRET_KEY + SECRET_KEY_LEN].copy_from_slice(&self.secret_key);
        buf[OFF_AUTO_INCREMENT..OFF_AUTO_INCREMENT + 8]
            .copy_from_slice(&self.auto_increment.to_be_bytes());
        buf[OFF_COUNT..OFF_COUNT + 4].copy_from_slice(&self.count.to_be_bytes());
        buf[OFF_LAST_INTERNAL_INDEX..OFF_LAST_INTERNAL_INDEX + 4]
            .copy_from_slice(&self.last_internal_index.to_be_bytes());
        buf
    }

    /// Parse from a 200-byte block, failing if the magic does not match
    /// (spec §3.6: "Metadata magic string must read 'TissueRoll' ... else
    /// open fails with 'invalid'").
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < USED_LEN {
            return Err(Error::Invalid {
                reason: "metadata block is truncated".into(),
            });
        }
        if &data[OFF_MAGIC..OFF_MAGIC + 10] != MAGIC {
            return Err(Error::Invalid {
                reason: "magic mismatch".into(),
            });
        }
        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&data[OFF_SECRET_KEY..OFF_SECRET_KEY + SECRET_KEY_LEN]);

        Ok(Metadata {
            major_version: data[OFF_MAJOR],
            minor_version: data[OFF_MINOR],
            patch_version: data[OFF_PATCH],
            next_index: u32::from_be_bytes(
                data[OFF_NEXT_INDEX..OFF_NEXT_INDEX + 4].try_into().unwrap(),
            ),
            payload_size: u32::from_be_bytes(
                data[OFF_PAYLOAD_SIZE..OFF_PAYLOAD_SIZE + 4]
                    .try_into()
                    .unwrap(),
            ),
            timestamp: u64::from_be_bytes(
                data[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].try_into().unwrap(),
            ),
            secret_key,
            auto_increment: u64::from_be_bytes(
                data[OFF_AUTO_INCREMENT..OFF_AUTO_INCREMENT + 8]
                    .try_into()
                    .unwrap(),
            ),
            count: u32::from_be_bytes(data[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap()),
            last_internal_index: u32::from_be_bytes(
                data[OFF_LAST_INTERNAL_INDEX..OFF_LAST_INTERNAL_INDEX + 4]
                    .try_into()
                    .unwrap(),
            ),
        })
    }

    /// Total on-page bytes: `100 + payloadSize`.
    pub fn page_size(&self) -> u32 {
        100 + self.payload_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let md = Metadata::new(4096, 1_700_000_000_000, [7u8; SECRET_KEY_LEN]);
        let bytes = md.to_bytes();
        assert_eq!(bytes.len(), METADATA_SIZE);
        let parsed = Metadata::from_bytes(&bytes).unwrap();
        assert_eq!(md, parsed);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Metadata::new(4096, 0, [0u8; SECRET_KEY_LEN]).to_bytes();
        bytes[0] = b'X';
        assert!(Metadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn page_size_is_header_plus_payload() {
        let md = Metadata::new(4096, 0, [0u8; SECRET_KEY_LEN]);
        assert_eq!(md.page_size(), 4196);
    }
}
