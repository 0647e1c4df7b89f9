//! On-disk encoding of encrypted blobs.
//!
//! Every file blob, the metadata store, and backup containers are written
//! in this format. Parsing dispatches on the version byte.

use crate::crypto::EncryptedBlob;
use crate::error::{VaultError, VaultResult};

pub mod v1;

/// Magic bytes identifying a vault blob ("DVBL").
pub const MAGIC: &[u8; 4] = b"DVBL";
/// Length of magic bytes.
pub const MAGIC_LEN: usize = 4;
/// Length of version field.
pub const VER_LEN: usize = 1;

/// Parses blob bytes read from disk.
///
/// # Errors
///
/// Returns `StorageFailure` if:
/// - The data is too short
/// - The magic bytes are invalid
/// - The version is unsupported
pub fn parse(data: &[u8]) -> VaultResult<EncryptedBlob> {
    if data.len() < MAGIC_LEN + VER_LEN {
        return Err(VaultError::storage("blob too short"));
    }

    if &data[..MAGIC_LEN] != MAGIC {
        return Err(VaultError::storage("invalid blob magic"));
    }

    match data[MAGIC_LEN] {
        v1::VERSION_V1 => v1::parse(data),
        other => Err(VaultError::StorageFailure(format!(
            "unsupported blob version: {other}"
        ))),
    }
}

/// Serializes a blob in the current format version.
pub fn serialize(blob: &EncryptedBlob) -> Vec<u8> {
    v1::serialize(blob)
}
