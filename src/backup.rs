//! Encrypted backup container for the real vault.
//!
//! A bundle carries every metadata entry together with its blob, still
//! encrypted under the vault key. The bundle itself is then sealed as one
//! more blob under the same key, so it can only be imported into a vault
//! opened with the same master key.

use std::collections::BTreeSet;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{self, SecureBuffer};
use crate::error::{VaultError, VaultResult};
use crate::format;
use crate::keys::SessionKey;
use crate::storage::Storage;
use crate::store::{self, FileMetadataEntry, FileVaultStore};

const BACKUP_VERSION: u32 = 1;
const BACKUP_AAD: &[u8] = b"duressvault.backup";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEntry {
    metadata: FileMetadataEntry,
    /// The blob exactly as stored on disk, base64 encoded.
    blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupBundle {
    version: u32,
    created: DateTime<Utc>,
    entries: Vec<BackupEntry>,
}

/// What an import did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub imported: usize,
    /// Entries whose name already existed in the vault.
    pub skipped: usize,
}

impl BackupBundle {
    pub(crate) fn collect(store: &FileVaultStore, key: &SessionKey) -> VaultResult<Self> {
        let mut entries = Vec::new();
        for metadata in store.list(key)? {
            let raw = store.raw_blob(metadata.blob_id())?;
            entries.push(BackupEntry {
                metadata,
                blob: BASE64.encode(raw),
            });
        }
        Ok(Self {
            version: BACKUP_VERSION,
            created: Utc::now(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialises and encrypts the bundle into the container format.
    pub fn seal(&self, key: &SessionKey) -> VaultResult<Vec<u8>> {
        let plaintext = SecureBuffer::new(serde_json::to_vec(self)?);
        let blob = crypto::encrypt(key.bytes(), &plaintext, BACKUP_AAD)?;
        Ok(format::serialize(&blob))
    }

    pub fn open(key: &SessionKey, data: &[u8]) -> VaultResult<Self> {
        let blob = format::parse(data)?;
        let plaintext = crypto::decrypt(key.bytes(), &blob, BACKUP_AAD)?;
        let bundle: BackupBundle = serde_json::from_slice(&plaintext)?;
        if bundle.version != BACKUP_VERSION {
            return Err(VaultError::StorageFailure(format!(
                "unsupported backup version: {}",
                bundle.version
            )));
        }
        Ok(bundle)
    }

    pub(crate) fn write_to(&self, key: &SessionKey, path: &Path) -> VaultResult<()> {
        let sealed = self.seal(key)?;
        Storage::new(path.to_path_buf())
            .save(&sealed)
            .map_err(VaultError::storage_chain)?;
        info!(entries = self.entries.len(), path = %path.display(), "backup written");
        Ok(())
    }

    pub(crate) fn read_from(key: &SessionKey, path: &Path) -> VaultResult<Self> {
        let data = std::fs::read(path).map_err(VaultError::storage)?;
        Self::open(key, &data)
    }

    /// Adds every entry whose name is not already in `store`.
    ///
    /// All blobs are decoded and verified before the first one is written;
    /// a single bad blob rejects the whole import.
    pub(crate) fn restore(self, store: &FileVaultStore, key: &SessionKey) -> VaultResult<ImportSummary> {
        let mut decoded = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let raw = BASE64
                .decode(entry.blob.as_bytes())
                .map_err(|_| VaultError::StorageFailure("malformed backup blob encoding".into()))?;
            store::verify_raw(key, &entry.metadata, &raw)?;
            decoded.push((entry.metadata, raw));
        }

        let existing: BTreeSet<String> = store
            .list(key)?
            .into_iter()
            .map(|e| e.original_name().to_string())
            .collect();

        let mut summary = ImportSummary::default();
        for (metadata, raw) in decoded {
            if existing.contains(metadata.original_name()) {
                summary.skipped += 1;
                continue;
            }
            match store.adopt(key, metadata, &raw) {
                Ok(()) => summary.imported += 1,
                Err(VaultError::DuplicateName(name)) => {
                    warn!(name = %name, "backup entry clashes with an existing file");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(imported = summary.imported, skipped = summary.skipped, "backup restored");
        Ok(summary)
    }
}
