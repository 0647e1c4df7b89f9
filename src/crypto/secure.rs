//! Random generation and wipe-on-drop buffers.

use std::fmt;
use std::ops::{Deref, DerefMut};

use getrandom::fill;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{VaultError, VaultResult};

/// Fill buffer with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) -> VaultResult<()> {
    fill(buf).map_err(|_| VaultError::CryptoFailure("OS random generator unavailable".into()))
}

pub fn random_array<const N: usize>() -> VaultResult<[u8; N]> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

/// Overwrites `buf` in place with zeros.
pub fn secure_wipe(buf: &mut [u8]) {
    buf.zeroize();
}

/// Heap buffer for passwords, keys, and plaintext. Zeroed when dropped.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecureBuffer(Zeroizing<Vec<u8>>);

impl SecureBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Wipes the contents now and leaves the buffer empty.
    pub fn wipe(&mut self) {
        self.0.zeroize();
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for SecureBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {}])", self.0.len())
    }
}
