//! Error types returned by every vault operation.
//!
//! Messages are fixed strings or carry only identifiers (blob ids, file
//! names, password kinds). Nothing here ever formats a password, a key,
//! or decrypted content.

use std::fmt;

use thiserror::Error;

use crate::authority::PasswordKind;

/// Which integrity check rejected the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    /// AEAD tag mismatch: wrong key, wrong associated data, or modified bytes.
    Authentication,
    /// Decryption succeeded but the content hash recorded at store time differs.
    ContentHash,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::Authentication => write!(f, "authentication tag mismatch"),
            IntegrityKind::ContentHash => write!(f, "content hash mismatch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    /// The password was not recognised. Never says why.
    #[error("invalid credential")]
    InvalidCredential { remaining_attempts: u32 },

    #[error("account locked")]
    AccountLocked,

    #[error("integrity failure: {0}")]
    IntegrityFailure(IntegrityKind),

    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// The vault's record or key material does not exist on disk.
    #[error("vault not initialized")]
    NotInitialized,

    #[error("vault already initialized")]
    AlreadyInitialized,

    #[error("a file named '{0}' already exists")]
    DuplicateName(String),

    #[error("file '{0}' not found")]
    FileNotFound(String),

    #[error("{kind} password rejected by policy: {reason}")]
    WeakPasswordPolicy {
        kind: PasswordKind,
        reason: PolicyViolation,
    },

    #[error("passwords must be distinct: {}", format_pairs(.0))]
    PasswordReuse(Vec<(PasswordKind, PasswordKind)>),

    #[error("panic destruction incomplete: {failed_items} item(s) could not be removed")]
    PanicPartialFailure { failed_items: usize },

    #[error("no active session")]
    NoSession,

    #[error("operation requires a master session")]
    WrongMode,

    #[error("vault destruction in progress")]
    Destroying,

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("invalid key derivation parameters: {0}")]
    InvalidKdfParams(&'static str),

    /// An internal invariant was broken. Not an expected failure path.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

impl VaultError {
    pub(crate) fn storage(err: impl fmt::Display) -> Self {
        VaultError::StorageFailure(err.to_string())
    }

    pub(crate) fn storage_chain(err: anyhow::Error) -> Self {
        VaultError::StorageFailure(format!("{err:#}"))
    }

    /// Only invariant violations are fatal; everything else is an expected outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VaultError::Invariant(_))
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            VaultError::NotInitialized
        } else {
            VaultError::storage(err)
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::StorageFailure(format!("malformed document: {err}"))
    }
}

/// Result alias used across the crate.
pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// Why a password failed the strength policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    TooShort { min: usize },
    TooFewCharacterClasses { min: u8, found: u8 },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::TooShort { min } => {
                write!(f, "must be at least {min} characters")
            }
            PolicyViolation::TooFewCharacterClasses { min, found } => write!(
                f,
                "uses {found} character class(es), at least {min} required"
            ),
        }
    }
}

fn format_pairs(pairs: &[(PasswordKind, PasswordKind)]) -> String {
    pairs
        .iter()
        .map(|(a, b)| format!("{a}={b}"))
        .collect::<Vec<_>>()
        .join(", ")
}
