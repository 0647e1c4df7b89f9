//! Wrapping of the vault master keys under password-derived keys.
//!
//! The real vault key (VMK) and the decoy key (DVMK) are random 256-bit
//! keys. Each one is stored encrypted under a key derived from its own
//! password, with the mode label as associated data, so a key derived for
//! one mode can never open the other's wrap.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptedBlob, KEY_LEN, KdfParams, SALT_LEN, random_array, secure_wipe};
use crate::error::{VaultError, VaultResult};
use crate::storage::Storage;

const KEY_FILE_VERSION: u32 = 1;
const WRAP_ALGORITHM: &str = "xchacha20poly1305";

/// Which reality a session is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultMode {
    Master,
    Decoy,
}

impl VaultMode {
    fn aad(self) -> &'static [u8] {
        match self {
            VaultMode::Master => b"duressvault.wrap.vmk",
            VaultMode::Decoy => b"duressvault.wrap.dvmk",
        }
    }
}

impl fmt::Display for VaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultMode::Master => write!(f, "master"),
            VaultMode::Decoy => write!(f, "decoy"),
        }
    }
}

/// A 256-bit symmetric key held for the lifetime of a session.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; KEY_LEN]>);

impl SessionKey {
    pub fn generate() -> VaultResult<Self> {
        Ok(Self(Zeroizing::new(random_array()?)))
    }

    fn from_plaintext(bytes: &[u8]) -> VaultResult<Self> {
        let mut arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| opaque())?;
        let key = Self(Zeroizing::new(arr));
        secure_wipe(&mut arr);
        Ok(key)
    }

    pub fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// A master key encrypted under a password-derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    algorithm: String,
    kdf: KdfParams,
    #[serde(with = "hex::serde")]
    salt: [u8; SALT_LEN],
    blob: EncryptedBlob,
}

impl WrappedKey {
    fn wrap(mode: VaultMode, key: &SessionKey, password: &str, kdf: KdfParams) -> VaultResult<Self> {
        let salt = random_array()?;
        let kek = crypto::derive_key(password, &salt, kdf)?;
        let blob = crypto::encrypt(&kek, key.bytes(), mode.aad())?;
        Ok(Self {
            algorithm: WRAP_ALGORITHM.to_string(),
            kdf,
            salt,
            blob,
        })
    }

    fn unwrap(&self, mode: VaultMode, password: &str) -> VaultResult<SessionKey> {
        if self.algorithm != WRAP_ALGORITHM {
            return Err(VaultError::CryptoFailure(format!(
                "unsupported wrap algorithm: {}",
                self.algorithm
            )));
        }
        let kek = crypto::derive_key(password, &self.salt, self.kdf)?;
        let plaintext = crypto::decrypt(&kek, &self.blob, mode.aad())?;
        SessionKey::from_plaintext(&plaintext)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    master: WrappedKey,
    decoy: WrappedKey,
}

impl KeyFile {
    fn get(&self, mode: VaultMode) -> &WrappedKey {
        match mode {
            VaultMode::Master => &self.master,
            VaultMode::Decoy => &self.decoy,
        }
    }

    fn get_mut(&mut self, mode: VaultMode) -> &mut WrappedKey {
        match mode {
            VaultMode::Master => &mut self.master,
            VaultMode::Decoy => &mut self.decoy,
        }
    }

    fn parse(data: &[u8]) -> VaultResult<Self> {
        let file: KeyFile = serde_json::from_slice(data).map_err(|_| opaque())?;
        if file.version != KEY_FILE_VERSION {
            return Err(opaque());
        }
        Ok(file)
    }
}

/// Single opaque error for every unwrap failure, wrong password and
/// corrupted storage alike.
fn opaque() -> VaultError {
    VaultError::InvalidCredential {
        remaining_attempts: 0,
    }
}

pub struct VaultKeyManager {
    storage: Storage,
    kdf: KdfParams,
    lock: Mutex<()>,
}

impl VaultKeyManager {
    pub fn new(storage: Storage, kdf: KdfParams) -> Self {
        Self {
            storage,
            kdf,
            lock: Mutex::new(()),
        }
    }

    pub fn exists(&self) -> bool {
        self.storage.exists()
    }

    /// Generates the VMK and DVMK and writes both wraps. Returns the VMK.
    pub fn create(&self, master_password: &str, decoy_password: &str) -> VaultResult<SessionKey> {
        let _guard = self.lock.lock();

        if self.storage.exists() {
            return Err(VaultError::AlreadyInitialized);
        }

        let vmk = SessionKey::generate()?;
        let dvmk = SessionKey::generate()?;

        let file = KeyFile {
            version: KEY_FILE_VERSION,
            master: WrappedKey::wrap(VaultMode::Master, &vmk, master_password, self.kdf)?,
            decoy: WrappedKey::wrap(VaultMode::Decoy, &dvmk, decoy_password, self.kdf)?,
        };
        self.save(&file)?;

        info!("vault keys generated and wrapped");
        Ok(vmk)
    }

    /// Recovers the key for `mode`.
    ///
    /// Missing key material is `NotInitialized`. Every other failure is the
    /// same `InvalidCredential`.
    pub fn unwrap(&self, mode: VaultMode, password: &str) -> VaultResult<SessionKey> {
        let _guard = self.lock.lock();
        let file = self.load()?;
        let key = file.get(mode).unwrap(mode, password).map_err(|e| {
            debug!(%mode, error = %e, "unwrap failed");
            opaque()
        })?;
        debug!(%mode, "unwrapped vault key");
        Ok(key)
    }

    /// Re-wraps the key for `mode` under `new_password`.
    ///
    /// The new key file is staged beside the old one and read back; it only
    /// replaces the old file once the staged copy unwraps to the same key.
    pub fn rewrap(&self, mode: VaultMode, old_password: &str, new_password: &str) -> VaultResult<()> {
        let _guard = self.lock.lock();

        let mut file = self.load()?;
        let key = file
            .get(mode)
            .unwrap(mode, old_password)
            .map_err(|_| opaque())?;

        *file.get_mut(mode) = WrappedKey::wrap(mode, &key, new_password, self.kdf)?;

        let data = serde_json::to_vec_pretty(&file)?;
        let staged = self.storage.stage(&data).map_err(VaultError::storage_chain)?;

        let staged_bytes = staged.load()?;
        let roundtrip = KeyFile::parse(&staged_bytes)
            .and_then(|f| f.get(mode).unwrap(mode, new_password));
        match roundtrip {
            Ok(check) if check == key => {}
            _ => {
                warn!(%mode, "staged key file failed verification, keeping old wrap");
                return Err(VaultError::Invariant("re-wrapped key did not round-trip"));
            }
        }

        staged.commit().map_err(VaultError::storage_chain)?;
        info!(%mode, "vault key re-wrapped");
        Ok(())
    }

    fn load(&self) -> VaultResult<KeyFile> {
        let data = match self.storage.load() {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotInitialized);
            }
            Err(e) => return Err(VaultError::storage(e)),
        };
        KeyFile::parse(&data)
    }

    fn save(&self, file: &KeyFile) -> VaultResult<()> {
        let data = serde_json::to_vec_pretty(file)?;
        self.storage.save(&data).map_err(VaultError::storage_chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MASTER: &str = "Correct-Horse-9!";
    const DECOY: &str = "Battery-Staple-7!";

    fn manager(dir: &std::path::Path) -> VaultKeyManager {
        VaultKeyManager::new(
            Storage::new(dir.join("keys.json")),
            KdfParams::argon2id(1024, 1, 1).unwrap(),
        )
    }

    #[test]
    fn create_then_unwrap_both_modes() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        let vmk = keys.create(MASTER, DECOY).unwrap();

        assert_eq!(keys.unwrap(VaultMode::Master, MASTER).unwrap(), vmk);
        let dvmk = keys.unwrap(VaultMode::Decoy, DECOY).unwrap();
        assert_ne!(dvmk, vmk);
    }

    #[test]
    fn wrong_password_and_wrong_mode_fail_opaquely() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        keys.create(MASTER, DECOY).unwrap();

        for (mode, pw) in [
            (VaultMode::Master, "nope"),
            (VaultMode::Master, DECOY),
            (VaultMode::Decoy, MASTER),
        ] {
            assert!(matches!(
                keys.unwrap(mode, pw),
                Err(VaultError::InvalidCredential { .. })
            ));
        }
    }

    #[test]
    fn corrupted_file_is_indistinguishable_from_wrong_password() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        keys.create(MASTER, DECOY).unwrap();

        std::fs::write(dir.path().join("keys.json"), b"{ not json").unwrap();
        assert!(matches!(
            keys.unwrap(VaultMode::Master, MASTER),
            Err(VaultError::InvalidCredential { .. })
        ));
    }

    #[test]
    fn rewrap_switches_password() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        let vmk = keys.create(MASTER, DECOY).unwrap();

        keys.rewrap(VaultMode::Master, MASTER, "Another-Secret-4").unwrap();

        assert_eq!(
            keys.unwrap(VaultMode::Master, "Another-Secret-4").unwrap(),
            vmk
        );
        assert!(keys.unwrap(VaultMode::Master, MASTER).is_err());
        assert!(keys.unwrap(VaultMode::Decoy, DECOY).is_ok());
    }

    #[test]
    fn rewrap_with_wrong_old_password_changes_nothing() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        keys.create(MASTER, DECOY).unwrap();
        let before = std::fs::read(dir.path().join("keys.json")).unwrap();

        assert!(keys.rewrap(VaultMode::Master, "bad", "Another-Secret-4").is_err());

        let after = std::fs::read(dir.path().join("keys.json")).unwrap();
        assert_eq!(before, after);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_key_file_is_not_initialized() {
        let dir = tempdir().unwrap();
        let keys = manager(dir.path());
        assert!(matches!(
            keys.unwrap(VaultMode::Master, MASTER),
            Err(VaultError::NotInitialized)
        ));
    }

    #[test]
    fn session_key_debug_is_redacted() {
        let key = SessionKey::generate().unwrap();
        assert_eq!(format!("{key:?}"), "SessionKey([REDACTED])");
    }
}
