//! Encrypted file store for the real vault.
//!
//! Each file is encrypted under the session key into its own blob, named
//! by a random id. The list of files lives in a single encrypted metadata
//! document that is rewritten on every change.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VaultLayout;
use crate::crypto::{self, SecureBuffer};
use crate::error::{IntegrityKind, VaultError, VaultResult};
use crate::format;
use crate::keys::SessionKey;
use crate::storage::Storage;

const METADATA_AAD: &[u8] = b"duressvault.metadata";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadataEntry {
    original_name: String,
    blob_id: String,
    content_hash: String,
    size_bytes: u64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    tags: Vec<String>,
}

impl FileMetadataEntry {
    pub(crate) fn new(name: &str, blob_id: String, plaintext: &[u8]) -> Self {
        Self {
            original_name: name.to_string(),
            blob_id,
            content_hash: content_hash(plaintext),
            size_bytes: plaintext.len() as u64,
            timestamp: Utc::now(),
            tags: Vec::new(),
        }
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn blob_id(&self) -> &str {
        &self.blob_id
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub(crate) fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// SHA-256 of `data`, lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The decrypted metadata document.
#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct MetadataIndex {
    entries: BTreeMap<String, FileMetadataEntry>,
    created: DateTime<Utc>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            created: Utc::now(),
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.values().any(|e| e.original_name == name)
    }

    pub fn insert(&mut self, entry: FileMetadataEntry) -> VaultResult<()> {
        if self.contains_name(&entry.original_name) {
            return Err(VaultError::DuplicateName(entry.original_name));
        }
        self.entries.insert(entry.blob_id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, blob_id: &str) -> Option<&FileMetadataEntry> {
        self.entries.get(blob_id)
    }

    pub fn remove(&mut self, blob_id: &str) -> VaultResult<FileMetadataEntry> {
        self.entries
            .remove(blob_id)
            .ok_or_else(|| VaultError::FileNotFound(blob_id.to_string()))
    }

    pub fn rename(&mut self, blob_id: &str, new_name: &str) -> VaultResult<()> {
        if self.contains_name(new_name) {
            return Err(VaultError::DuplicateName(new_name.to_string()));
        }
        let entry = self
            .entries
            .get_mut(blob_id)
            .ok_or_else(|| VaultError::FileNotFound(blob_id.to_string()))?;
        entry.original_name = new_name.to_string();
        entry.timestamp = Utc::now();
        Ok(())
    }

    pub fn set_tags(&mut self, blob_id: &str, tags: Vec<String>) -> VaultResult<()> {
        let entry = self
            .entries
            .get_mut(blob_id)
            .ok_or_else(|| VaultError::FileNotFound(blob_id.to_string()))?;
        entry.tags = tags;
        entry.timestamp = Utc::now();
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileMetadataEntry> {
        self.entries.values()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Encrypted blob and metadata CRUD on top of a [`VaultLayout`].
pub struct FileVaultStore {
    layout: VaultLayout,
    reserved: BTreeSet<String>,
    metadata_lock: Mutex<()>,
}

impl FileVaultStore {
    /// `reserved` names can never be stored (they belong to the decoy set).
    pub fn new(layout: VaultLayout, reserved: BTreeSet<String>) -> Self {
        Self {
            layout,
            reserved,
            metadata_lock: Mutex::new(()),
        }
    }

    /// Writes an empty metadata document.
    pub fn initialize(&self, key: &SessionKey) -> VaultResult<()> {
        let _guard = self.metadata_lock.lock();
        std::fs::create_dir_all(self.layout.blob_dir())?;
        self.save_index(key, &MetadataIndex::new())
    }

    pub fn store(&self, key: &SessionKey, name: &str, plaintext: &[u8]) -> VaultResult<String> {
        self.check_name(name)?;
        {
            let _guard = self.metadata_lock.lock();
            if self.load_index(key)?.contains_name(name) {
                return Err(VaultError::DuplicateName(name.to_string()));
            }
        }

        let blob_id = Uuid::new_v4().simple().to_string();
        let entry = FileMetadataEntry::new(name, blob_id.clone(), plaintext);

        let blob = crypto::encrypt(key.bytes(), plaintext, blob_id.as_bytes())?;
        let blob_storage = self.layout.blob(&blob_id);
        blob_storage
            .save(&format::serialize(&blob))
            .map_err(VaultError::storage_chain)?;

        let _guard = self.metadata_lock.lock();
        let mut index = self.load_index(key)?;
        if let Err(e) = index.insert(entry) {
            // lost a race with a concurrent store of the same name
            let _ = blob_storage.remove();
            return Err(e);
        }
        self.save_index(key, &index)?;

        info!(blob_id = %blob_id, size = plaintext.len(), "file stored");
        Ok(blob_id)
    }

    pub fn retrieve(&self, key: &SessionKey, blob_id: &str) -> VaultResult<SecureBuffer> {
        let entry = self.entry(key, blob_id)?;
        let plaintext = self.read_blob(key, blob_id)?;

        if content_hash(&plaintext) != entry.content_hash {
            warn!(blob_id, "content hash mismatch");
            return Err(VaultError::IntegrityFailure(IntegrityKind::ContentHash));
        }

        debug!(blob_id, "file retrieved");
        Ok(plaintext)
    }

    pub fn delete(&self, key: &SessionKey, blob_id: &str) -> VaultResult<()> {
        let _guard = self.metadata_lock.lock();
        let mut index = self.load_index(key)?;
        index.remove(blob_id)?;

        // the entry stays listed until its blob is really gone
        if let Err(e) = self.layout.blob(blob_id).shred(1) {
            warn!(blob_id, error = %e, "failed to shred deleted blob");
            return Err(VaultError::storage_chain(e));
        }
        self.save_index(key, &index)?;
        info!(blob_id, "file deleted");
        Ok(())
    }

    /// All entries, ordered by name.
    pub fn list(&self, key: &SessionKey) -> VaultResult<Vec<FileMetadataEntry>> {
        let _guard = self.metadata_lock.lock();
        let index = self.load_index(key)?;
        let mut entries: Vec<_> = index.entries().cloned().collect();
        entries.sort_by(|a, b| a.original_name.cmp(&b.original_name));
        Ok(entries)
    }

    pub fn rename(&self, key: &SessionKey, blob_id: &str, new_name: &str) -> VaultResult<()> {
        self.check_name(new_name)?;
        let _guard = self.metadata_lock.lock();
        let mut index = self.load_index(key)?;
        index.rename(blob_id, new_name)?;
        self.save_index(key, &index)
    }

    pub fn set_tags(&self, key: &SessionKey, blob_id: &str, tags: Vec<String>) -> VaultResult<()> {
        let _guard = self.metadata_lock.lock();
        let mut index = self.load_index(key)?;
        index.set_tags(blob_id, tags)?;
        self.save_index(key, &index)
    }

    /// Raw encrypted bytes of a blob, as stored on disk.
    pub(crate) fn raw_blob(&self, blob_id: &str) -> VaultResult<Vec<u8>> {
        self.blob_storage(blob_id)?
            .load()
            .map_err(|e| blob_io_error(blob_id, e))
    }

    /// Adds an entry whose blob bytes were produced under the same key
    /// elsewhere (backup import). The blob is verified before anything is
    /// written.
    pub(crate) fn adopt(
        &self,
        key: &SessionKey,
        entry: FileMetadataEntry,
        raw_blob: &[u8],
    ) -> VaultResult<()> {
        self.check_name(&entry.original_name)?;
        verify_raw(key, &entry, raw_blob)?;

        let _guard = self.metadata_lock.lock();
        let mut index = self.load_index(key)?;
        if index.get(&entry.blob_id).is_some() {
            return Err(VaultError::DuplicateName(entry.original_name));
        }
        let blob_id = entry.blob_id.clone();
        index.insert(entry)?;
        self.blob_storage(&blob_id)?
            .save(raw_blob)
            .map_err(VaultError::storage_chain)?;
        self.save_index(key, &index)
    }

    fn entry(&self, key: &SessionKey, blob_id: &str) -> VaultResult<FileMetadataEntry> {
        let _guard = self.metadata_lock.lock();
        self.load_index(key)?
            .get(blob_id)
            .cloned()
            .ok_or_else(|| VaultError::FileNotFound(blob_id.to_string()))
    }

    fn read_blob(&self, key: &SessionKey, blob_id: &str) -> VaultResult<SecureBuffer> {
        let raw = self.raw_blob(blob_id)?;
        let blob = format::parse(&raw)?;
        let mut plaintext = crypto::decrypt(key.bytes(), &blob, blob_id.as_bytes())?;
        Ok(SecureBuffer::new(std::mem::take(&mut *plaintext)))
    }

    fn check_name(&self, name: &str) -> VaultResult<()> {
        if name.trim().is_empty() {
            return Err(VaultError::FileNotFound(name.to_string()));
        }
        if self.reserved.contains(name) {
            return Err(VaultError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Blob ids are generated hex strings; anything else could escape the blob directory.
    fn blob_storage(&self, blob_id: &str) -> VaultResult<Storage> {
        if blob_id.is_empty() || !blob_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(VaultError::FileNotFound(blob_id.to_string()));
        }
        Ok(self.layout.blob(blob_id))
    }

    fn load_index(&self, key: &SessionKey) -> VaultResult<MetadataIndex> {
        let raw = self.layout.metadata().load()?;
        let blob = format::parse(&raw)?;
        let plaintext = crypto::decrypt(key.bytes(), &blob, METADATA_AAD)?;
        let index: MetadataIndex = serde_json::from_slice(&plaintext)?;
        debug!(entries = index.len(), created = %index.created(), "metadata loaded");
        Ok(index)
    }

    fn save_index(&self, key: &SessionKey, index: &MetadataIndex) -> VaultResult<()> {
        let plaintext = SecureBuffer::new(serde_json::to_vec(index)?);
        let blob = crypto::encrypt(key.bytes(), &plaintext, METADATA_AAD)?;
        self.layout
            .metadata()
            .save(&format::serialize(&blob))
            .map_err(VaultError::storage_chain)?;
        debug!(entries = index.len(), "metadata saved");
        Ok(())
    }
}

/// Checks that `raw_blob` decrypts under `key` to content matching `entry`.
pub(crate) fn verify_raw(key: &SessionKey, entry: &FileMetadataEntry, raw_blob: &[u8]) -> VaultResult<()> {
    let blob = format::parse(raw_blob)?;
    let plaintext = crypto::decrypt(key.bytes(), &blob, entry.blob_id.as_bytes())?;
    if content_hash(&plaintext) != entry.content_hash {
        return Err(VaultError::IntegrityFailure(IntegrityKind::ContentHash));
    }
    Ok(())
}

fn blob_io_error(blob_id: &str, err: std::io::Error) -> VaultError {
    if err.kind() == std::io::ErrorKind::NotFound {
        VaultError::FileNotFound(blob_id.to_string())
    } else {
        VaultError::storage(err)
    }
}
