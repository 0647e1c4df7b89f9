//! Offline encrypted file vault with decoy and panic passwords.
//!
//! A [`Vault`] is set up with three passwords. The master password opens
//! the real store, the decoy password opens a convincing fake one, and the
//! panic password (or running out of attempts) destroys the real vault
//! while looking like an ordinary failed login.

pub mod authority;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod decoy;
pub mod error;
pub mod format;
pub mod keys;
pub mod panic;
pub mod session;
pub mod storage;
pub mod store;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{error, info, warn};

pub use crate::authority::{Classification, PasswordKind};
pub use crate::backup::ImportSummary;
pub use crate::config::{PanicExit, PasswordPolicy, VaultConfig};
pub use crate::crypto::{KdfParams, SecureBuffer};
pub use crate::error::{IntegrityKind, PolicyViolation, VaultError, VaultResult};
pub use crate::keys::VaultMode;
pub use crate::panic::{PanicPhase, PanicReport};
pub use crate::storage::Storage;
pub use crate::store::FileMetadataEntry;

use crate::authority::PasswordAuthority;
use crate::backup::BackupBundle;
use crate::decoy::DecoyProvider;
use crate::keys::{SessionKey, VaultKeyManager};
use crate::panic::PanicDestroyer;
use crate::session::VaultSession;
use crate::store::FileVaultStore;

/// Result of a successful [`Vault::authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub mode: VaultMode,
    pub remaining_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStatus {
    pub initialized: bool,
    pub remaining_attempts: Option<u32>,
    pub mode: Option<VaultMode>,
    pub session_started: Option<DateTime<Utc>>,
    pub idle_remaining: Option<Duration>,
}

pub struct Vault {
    config: VaultConfig,
    authority: PasswordAuthority,
    keys: VaultKeyManager,
    store: FileVaultStore,
    destroyer: PanicDestroyer,
    session: RwLock<Option<VaultSession>>,
    /// Shared by every operation, taken exclusively by destruction.
    gate: RwLock<()>,
    destroying: AtomicBool,
}

impl Vault {
    /// Opens the vault at `config.root`. Nothing is read until the first
    /// call that needs it.
    pub fn open(config: VaultConfig) -> Self {
        let layout = config.layout();
        Self {
            authority: PasswordAuthority::new(
                layout.records(),
                config.max_failed_attempts,
                config.policy,
                config.kdf,
            ),
            keys: VaultKeyManager::new(layout.keys(), config.kdf),
            store: FileVaultStore::new(layout.clone(), DecoyProvider::reserved_names()),
            destroyer: PanicDestroyer::new(layout, config.overwrite_passes, config.panic_exit),
            session: RwLock::new(None),
            gate: RwLock::new(()),
            destroying: AtomicBool::new(false),
            config,
        }
    }

    /// First-time setup: password records, both wrapped keys, and an empty
    /// metadata store.
    pub fn initialize(mut config: VaultConfig, master: &str, decoy: &str, panic: &str) -> VaultResult<Self> {
        authority::validate_set(&config.policy, master, decoy, panic)?;
        config.kdf = KdfParams::negotiate(config.kdf);

        let vault = Self::open(config);
        if vault.authority.is_initialized() || vault.keys.exists() {
            return Err(VaultError::AlreadyInitialized);
        }

        let written = vault.keys.create(master, decoy).and_then(|vmk| {
            vault.store.initialize(&vmk)?;
            vault.authority.initialize(master, decoy, panic)
        });
        if let Err(e) = written {
            vault.discard_partial_setup();
            return Err(e);
        }

        info!(root = %vault.config.root.display(), kdf = vault.config.kdf.name(), "vault initialized");
        Ok(vault)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.authority.is_initialized()
    }

    /// Classifies `password` and acts on it.
    ///
    /// The panic password destroys the vault and then fails exactly like a
    /// mistyped password. Reaching the attempt limit destroys the vault and
    /// reports [`VaultError::AccountLocked`].
    pub fn authenticate(&self, password: &str) -> VaultResult<AuthOutcome> {
        let disguise = {
            let _op = self.enter()?;
            let failed_before = self.authority.failed_attempts()?;

            match self.authority.classify(password)? {
                Classification::Master => return self.start_session(VaultMode::Master, password),
                Classification::Decoy => return self.start_session(VaultMode::Decoy, password),
                Classification::Invalid => return Err(self.invalid_credential()),
                Classification::Panic => VaultError::InvalidCredential {
                    remaining_attempts: self
                        .config
                        .max_failed_attempts
                        .saturating_sub(failed_before.saturating_add(1)),
                },
                Classification::Locked => VaultError::AccountLocked,
            }
        };

        self.destroy();
        Err(disguise)
    }

    pub fn store_file(&self, name: &str, data: &[u8]) -> VaultResult<String> {
        self.dispatch(
            |key| self.store.store(key, name, data),
            |decoy| decoy.store(name, data),
        )
    }

    pub fn retrieve_file(&self, blob_id: &str) -> VaultResult<SecureBuffer> {
        self.dispatch(
            |key| self.store.retrieve(key, blob_id),
            |decoy| decoy.retrieve(blob_id),
        )
    }

    pub fn list_files(&self) -> VaultResult<Vec<FileMetadataEntry>> {
        self.dispatch(|key| self.store.list(key), |decoy| Ok(decoy.entries()))
    }

    pub fn delete_file(&self, blob_id: &str) -> VaultResult<()> {
        self.dispatch(
            |key| self.store.delete(key, blob_id),
            |decoy| decoy.delete(blob_id),
        )
    }

    pub fn rename_file(&self, blob_id: &str, new_name: &str) -> VaultResult<()> {
        self.dispatch(
            |key| self.store.rename(key, blob_id, new_name),
            |decoy| decoy.rename(blob_id, new_name),
        )
    }

    pub fn tag_file(&self, blob_id: &str, tags: Vec<String>) -> VaultResult<()> {
        let decoy_tags = tags.clone();
        self.dispatch(
            |key| self.store.set_tags(key, blob_id, tags),
            |decoy| decoy.set_tags(blob_id, decoy_tags),
        )
    }

    /// Changes the password for `kind`.
    ///
    /// A master session may change any password, a decoy session only the
    /// decoy one. `old` is classified like a login attempt: a wrong password
    /// counts against the limit, and the panic password (when `kind` is not
    /// panic) destroys the vault.
    pub fn change_password(&self, kind: PasswordKind, old: &str, new: &str) -> VaultResult<()> {
        let disguise = {
            let _op = self.enter()?;
            self.require_session(|mode| mode == VaultMode::Master || kind == PasswordKind::Decoy)?;
            let failed_before = self.authority.failed_attempts()?;

            match (self.authority.classify(old)?, kind) {
                (Classification::Master, PasswordKind::Master)
                | (Classification::Decoy, PasswordKind::Decoy)
                | (Classification::Panic, PasswordKind::Panic) => {
                    return self.apply_password_change(kind, old, new);
                }
                (Classification::Panic, _) => VaultError::InvalidCredential {
                    remaining_attempts: self
                        .config
                        .max_failed_attempts
                        .saturating_sub(failed_before.saturating_add(1)),
                },
                (Classification::Locked, _) => VaultError::AccountLocked,
                _ => return Err(self.invalid_credential()),
            }
        };

        self.destroy();
        Err(disguise)
    }

    /// Destroys the vault on request.
    ///
    /// Returns [`VaultError::PanicPartialFailure`] when some item could not
    /// be removed. Does not return at all with [`PanicExit::Terminate`].
    pub fn trigger_panic(&self) -> VaultResult<PanicReport> {
        let report = self.destroy();
        match report.failed_items() {
            0 => Ok(report),
            failed_items => Err(VaultError::PanicPartialFailure { failed_items }),
        }
    }

    /// Writes an encrypted backup of the real vault to `path`. Returns the
    /// number of files included.
    pub fn export_backup(&self, path: &Path) -> VaultResult<usize> {
        let _op = self.enter()?;
        self.with_master_key(|key| {
            let bundle = BackupBundle::collect(&self.store, key)?;
            bundle.write_to(key, path)?;
            Ok(bundle.len())
        })
    }

    pub fn import_backup(&self, path: &Path) -> VaultResult<ImportSummary> {
        let _op = self.enter()?;
        self.with_master_key(|key| BackupBundle::read_from(key, path)?.restore(&self.store, key))
    }

    /// Ends the session and wipes its key.
    pub fn logout(&self) {
        if let Some(mut session) = self.session.write().take() {
            session.end();
            info!("logged out");
        }
    }

    /// Wipes the session key without waiting on any lock-holding operation
    /// to return.
    pub fn wipe_session(&self) {
        if let Some(session) = self.session.read().as_ref() {
            session.wipe();
        }
    }

    pub fn status(&self) -> VaultStatus {
        let initialized = self.authority.is_initialized();
        let remaining_attempts = if initialized {
            self.authority.remaining_attempts().ok()
        } else {
            None
        };
        let slot = self.session.read();
        let live = slot.as_ref().filter(|s| s.is_active());
        VaultStatus {
            initialized,
            remaining_attempts,
            mode: live.map(|s| s.mode()),
            session_started: live.map(|s| s.started_at()),
            idle_remaining: live.and_then(|s| s.idle_remaining()),
        }
    }

    /// Removes whatever a failed [`initialize`](Self::initialize) wrote, so
    /// the next attempt does not find a half-built vault.
    fn discard_partial_setup(&self) {
        let layout = self.config.layout();
        for storage in [layout.keys(), layout.metadata(), layout.records()] {
            if let Err(e) = storage.shred(1) {
                warn!(path = %storage.path().display(), error = %format!("{e:#}"), "could not remove partial setup file");
            }
        }
        if let Err(e) = std::fs::remove_dir(layout.blob_dir()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "could not remove blob directory");
            }
        }
    }

    /// Fails fast while destruction holds the gate.
    fn enter(&self) -> VaultResult<RwLockReadGuard<'_, ()>> {
        if self.destroying.load(Ordering::Acquire) {
            return Err(VaultError::Destroying);
        }
        self.gate.try_read().ok_or(VaultError::Destroying)
    }

    fn destroy(&self) -> PanicReport {
        self.destroying.store(true, Ordering::Release);
        let report = {
            let _exclusive = self.gate.write();
            info!("vault destruction started");
            let report = self.destroyer.run(|| self.wipe_session());
            self.logout();
            report
        };
        self.destroying.store(false, Ordering::Release);
        report
    }

    fn start_session(&self, mode: VaultMode, password: &str) -> VaultResult<AuthOutcome> {
        let key = match self.keys.unwrap(mode, password) {
            Ok(key) => key,
            Err(VaultError::InvalidCredential { .. }) => {
                error!(%mode, "password accepted but key unwrap failed");
                return Err(self.invalid_credential());
            }
            Err(e) => return Err(e),
        };

        let mut slot = self.session.write();
        if let Some(mut previous) = slot.take() {
            previous.end();
        }
        *slot = Some(VaultSession::start(mode, key, self.config.session_timeout));

        Ok(AuthOutcome {
            mode,
            remaining_attempts: self.config.max_failed_attempts,
        })
    }

    fn invalid_credential(&self) -> VaultError {
        match self.authority.remaining_attempts() {
            Ok(remaining_attempts) => VaultError::InvalidCredential { remaining_attempts },
            Err(e) => e,
        }
    }

    /// Runs `master` or `decoy` depending on the session mode.
    fn dispatch<R>(
        &self,
        master: impl FnOnce(&SessionKey) -> VaultResult<R>,
        decoy: impl FnOnce(&DecoyProvider) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let _op = self.enter()?;
        let slot = self.session.read();
        let session = slot.as_ref().ok_or(VaultError::NoSession)?;
        match session.mode() {
            VaultMode::Master => session.with_key(master),
            VaultMode::Decoy => session.with_decoy(decoy),
        }
    }

    fn with_master_key<R>(&self, f: impl FnOnce(&SessionKey) -> VaultResult<R>) -> VaultResult<R> {
        let slot = self.session.read();
        let session = slot.as_ref().ok_or(VaultError::NoSession)?;
        if session.mode() != VaultMode::Master {
            return Err(VaultError::WrongMode);
        }
        session.with_key(f)
    }

    fn require_session(&self, allowed: impl FnOnce(VaultMode) -> bool) -> VaultResult<()> {
        let slot = self.session.read();
        let session = slot
            .as_ref()
            .filter(|s| s.is_active())
            .ok_or(VaultError::NoSession)?;
        if !allowed(session.mode()) {
            return Err(VaultError::WrongMode);
        }
        Ok(())
    }

    /// Re-wraps the key (for master and decoy) before the record changes,
    /// and puts the old wrap back if the record cannot be written.
    fn apply_password_change(&self, kind: PasswordKind, old: &str, new: &str) -> VaultResult<()> {
        self.authority.check_replacement(kind, new)?;

        let mode = match kind {
            PasswordKind::Master => Some(VaultMode::Master),
            PasswordKind::Decoy => Some(VaultMode::Decoy),
            PasswordKind::Panic => None,
        };
        if let Some(mode) = mode {
            self.keys.rewrap(mode, old, new)?;
        }

        if let Err(e) = self.authority.replace(kind, new) {
            if let Some(mode) = mode {
                if let Err(rollback) = self.keys.rewrap(mode, new, old) {
                    error!(%mode, error = %rollback, "could not restore previous key wrap");
                }
            }
            return Err(e);
        }

        info!(%kind, "password changed");
        Ok(())
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.logout();
    }
}
