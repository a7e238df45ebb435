//! Record-ID cipher and big-endian integer packing helpers.
//!
//! The record ID is not a security boundary (spec §1): it is an
//! integrity/obfuscation tag so a caller cannot construct a valid-looking ID
//! without the database's secret key, and so two databases created at
//! different times do not share IDs for the same `(index, order)`.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::types::{Coordinate, PageIndex};

/// AES-128 keystream cipher used as a length-preserving stream cipher over
/// the record ID plaintext: a true AES block-cipher encryption (ECB or CBC)
/// would pad the 14-byte plaintext to a full 16-byte block and yield a
/// 32-hex-character ciphertext, but spec §3.4 fixes the record ID at exactly
/// 28 hex characters (14 bytes). Counter mode with a fixed all-zero nonce
/// gives a deterministic, per-key keystream the same length as the
/// plaintext, matching that width without needing padding.
type IdCipher = ctr::Ctr128BE<Aes128>;

/// Width of the record-ID plaintext: 7 hex digits for the index, 7 for the
/// order, ASCII-encoded (spec §3.4).
const PLAINTEXT_LEN: usize = 14;

/// Fixed nonce for the record-ID keystream. The cipher is an
/// integrity/obfuscation tag, not a confidentiality boundary (spec §1), so a
/// constant nonce is acceptable: the `secretKey` alone, not key+nonce
/// uniqueness, is what makes IDs unguessable without the database's key.
const ID_CIPHER_NONCE: [u8; 16] = [0u8; 16];

/// Length of the secret key (also the AES-128 key size).
pub const SECRET_KEY_LEN: usize = 16;

/// Generate a fresh 16-byte secret key using the OS random source.
pub fn generate_secret_key() -> [u8; SECRET_KEY_LEN] {
    let mut key = [0u8; SECRET_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `(index, order)` into the 28-hex-character record ID.
///
/// Plaintext is the ASCII string `format!("{index:07x}{order:07x}")`,
/// zero-padded to 7 hex digits each; XOR-ing it with the AES-128 keystream
/// keeps the ciphertext at exactly 14 bytes. The ciphertext, rendered as
/// lowercase hex, is the record ID.
pub fn encode_id(secret_key: &[u8; SECRET_KEY_LEN], coord: Coordinate) -> String {
    let plaintext = format!("{:07x}{:07x}", coord.index, coord.order);
    debug_assert_eq!(plaintext.len(), PLAINTEXT_LEN);

    let mut buf = plaintext.into_bytes();
    let mut cipher = IdCipher::new(secret_key.into(), &ID_CIPHER_NONCE.into());
    cipher.apply_keystream(&mut buf);

    hex::encode(buf)
}

/// Decrypt a record ID string back into `(index, order)`.
///
/// The cipher is unauthenticated: a malformed or foreign-key-encrypted ID
/// may decrypt to a structurally valid-looking but meaningless coordinate.
/// Callers must still validate the decoded coordinate against the page
/// store (e.g. via `pick`) before trusting it.
pub fn decode_id(secret_key: &[u8; SECRET_KEY_LEN], record_id: &str) -> Result<Coordinate> {
    let raw = hex::decode(record_id).map_err(|_| Error::InvalidRecord {
        reason: format!("record id {record_id:?} is not valid hex"),
    })?;
    if raw.len() != PLAINTEXT_LEN {
        return Err(Error::InvalidRecord {
            reason: format!("record id {record_id:?} has wrong length"),
        });
    }

    let mut buf = raw;
    let mut cipher = IdCipher::new(secret_key.into(), &ID_CIPHER_NONCE.into());
    cipher.apply_keystream(&mut buf);

    let plaintext = std::str::from_utf8(&buf).map_err(|_| Error::InvalidRecord {
        reason: format!("record id {record_id:?} decrypted to non-UTF-8 plaintext"),
    })?;

    let index = PageIndex::from_str_radix(&plaintext[0..7], 16).map_err(|_| Error::InvalidRecord {
        reason: format!("record id {record_id:?} decrypted to a malformed index"),
    })?;
    let order = u32::from_str_radix(&plaintext[7..14], 16).map_err(|_| Error::InvalidRecord {
        reason: format!("record id {record_id:?} decrypted to a malformed order"),
    })?;

    Ok(Coordinate::new(index, order))
}

/// Pack a `u8` (identity helper, kept for symmetry with the wider widths).
pub fn pack_u8(value: u8) -> [u8; 1] {
    [value]
}

/// Unpack a `u8`.
pub fn unpack_u8(buf: &[u8]) -> u8 {
    buf[0]
}

/// Pack a `u16` big-endian.
pub fn pack_u16_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Unpack a big-endian `u16`.
pub fn unpack_u16_be(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[..2].try_into().unwrap())
}

/// Pack a `u32` big-endian.
pub fn pack_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Unpack a big-endian `u32`.
pub fn unpack_u32_be(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().unwrap())
}

/// Pack a `u64` big-endian.
pub fn pack_u64_be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Unpack a big-endian `u64`.
pub fn unpack_u64_be(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Pack a 128-bit (16-byte) field. There is no native `u128` field on disk;
/// this packs a `[u8; 16]` value (e.g. the secret key) verbatim.
pub fn pack_128(value: &[u8; 16]) -> [u8; 16] {
    *value
}

/// Unpack a 128-bit (16-byte) field verbatim.
pub fn unpack_128(buf: &[u8]) -> [u8; 16] {
    buf[..16].try_into().unwrap()
}

/// Pack a 256-bit (32-byte) field verbatim. Unused by the 200-byte metadata
/// layout today, but kept because the spec's crypto/encoding section lists
/// 256-bit as a supported width for future fields.
pub fn pack_256(value: &[u8; 32]) -> [u8; 32] {
    *value
}

/// Unpack a 256-bit (32-byte) field verbatim.
pub fn unpack_256(buf: &[u8]) -> [u8; 32] {
    buf[..32].try_into().unwrap()
}
