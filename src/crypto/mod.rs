//! Cryptographic primitives for the vault.
//!
//! Provides password key derivation, authenticated encryption, and the
//! buffer types that wipe secrets when they go out of scope.

pub mod aead;
pub mod kdf;
pub mod secure;

pub use aead::{EncryptedBlob, decrypt, encrypt};
pub use kdf::{DerivedKey, KdfParams, derive_key};
pub use secure::{SecureBuffer, random_array, secure_wipe};

/// Length of a password salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of the nonce (24 bytes for XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;
/// Length of the Poly1305 authentication tag (16 bytes).
pub const TAG_LEN: usize = 16;
/// Length of every symmetric key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;
