//! Blob format v1.
//!
//! ```text
//! MAGIC (4) | VERSION (1) | NONCE (24) | TAG (16) | CIPHERTEXT
//! ```

use super::{MAGIC, MAGIC_LEN, VER_LEN};
use crate::crypto::{EncryptedBlob, NONCE_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};

pub const VERSION_V1: u8 = 1;

const HEADER_LEN: usize = MAGIC_LEN + VER_LEN + NONCE_LEN + TAG_LEN;

/// Parses a v1 blob.
///
/// # Errors
///
/// Returns an error if the data is shorter than the fixed header.
pub fn parse(data: &[u8]) -> VaultResult<EncryptedBlob> {
    if data.len() < HEADER_LEN {
        return Err(VaultError::storage("blob too short for v1"));
    }

    let mut offset = MAGIC_LEN + VER_LEN;

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[offset..offset + NONCE_LEN]);
    offset += NONCE_LEN;

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&data[offset..offset + TAG_LEN]);
    offset += TAG_LEN;

    Ok(EncryptedBlob {
        nonce,
        ciphertext: data[offset..].to_vec(),
        tag,
    })
}

pub fn serialize(blob: &EncryptedBlob) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + blob.ciphertext.len());

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);
    buf.extend_from_slice(&blob.nonce);
    buf.extend_from_slice(&blob.tag);
    buf.extend_from_slice(&blob.ciphertext);

    buf
}
