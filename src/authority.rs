//! Password classification and the failed-attempt counter.
//!
//! Three salted verifiers are stored in the record file, one per
//! [`PasswordKind`]. A submitted password is checked against all three on
//! every call, and the comparisons are constant time, so the time taken
//! does not reveal which kind (if any) matched.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, info, warn};

use crate::config::PasswordPolicy;
use crate::crypto::{KdfParams, SALT_LEN, derive_key, random_array};
use crate::error::{VaultError, VaultResult};
use crate::storage::Storage;

const RECORD_FILE_VERSION: u32 = 1;
const VERIFIER_LABEL: &[u8] = b"duressvault.verifier.v1";
/// Derived in place of an empty password so every classification runs all
/// three derivations. Its matches are masked out.
const EMPTY_STANDIN: &str = "\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordKind {
    Master,
    Decoy,
    Panic,
}

impl PasswordKind {
    pub const ALL: [PasswordKind; 3] = [PasswordKind::Master, PasswordKind::Decoy, PasswordKind::Panic];
}

impl fmt::Display for PasswordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordKind::Master => write!(f, "master"),
            PasswordKind::Decoy => write!(f, "decoy"),
            PasswordKind::Panic => write!(f, "panic"),
        }
    }
}

impl FromStr for PasswordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(PasswordKind::Master),
            "decoy" => Ok(PasswordKind::Decoy),
            "panic" => Ok(PasswordKind::Panic),
            other => Err(format!("unknown password kind '{other}'")),
        }
    }
}

/// Result of checking a password. Downstream code matches on this once
/// instead of re-deriving the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Master,
    Decoy,
    Panic,
    Invalid,
    Locked,
}

/// Salted verifier for one password kind. Never holds the password.
#[derive(Clone, Serialize, Deserialize)]
pub struct PasswordRecord {
    #[serde(with = "hex::serde")]
    salt: [u8; SALT_LEN],
    #[serde(with = "hex::serde")]
    verifier: [u8; 32],
    kdf: KdfParams,
}

impl fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordRecord")
            .field("kdf", &self.kdf)
            .finish_non_exhaustive()
    }
}

impl PasswordRecord {
    pub fn create(password: &str, kdf: KdfParams) -> VaultResult<Self> {
        let salt = random_array()?;
        let verifier = compute_verifier(password, &salt, kdf)?;
        Ok(Self {
            salt,
            verifier,
            kdf,
        })
    }

    fn matches(&self, password: &str) -> VaultResult<Choice> {
        let candidate = compute_verifier(password, &self.salt, self.kdf)?;
        Ok(candidate[..].ct_eq(&self.verifier[..]))
    }
}

fn compute_verifier(password: &str, salt: &[u8], kdf: KdfParams) -> VaultResult<[u8; 32]> {
    let key = derive_key(password, salt, kdf)?;
    let mut hasher = Sha256::new();
    hasher.update(VERIFIER_LABEL);
    hasher.update(key.as_slice());
    Ok(hasher.finalize().into())
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    master: PasswordRecord,
    decoy: PasswordRecord,
    panic: PasswordRecord,
    #[serde(default)]
    failed_attempts: u32,
}

impl RecordFile {
    fn record_mut(&mut self, kind: PasswordKind) -> &mut PasswordRecord {
        match kind {
            PasswordKind::Master => &mut self.master,
            PasswordKind::Decoy => &mut self.decoy,
            PasswordKind::Panic => &mut self.panic,
        }
    }

    /// Checks `password` against all three records without short-circuiting.
    fn match_all(&self, password: &str) -> VaultResult<[Choice; 3]> {
        let master = self.master.matches(password)?;
        let decoy = self.decoy.matches(password)?;
        let panic = self.panic.matches(password)?;
        Ok([master, decoy, panic])
    }
}

/// Owns the record file and serialises every classification.
pub struct PasswordAuthority {
    storage: Storage,
    max_attempts: u32,
    policy: PasswordPolicy,
    kdf: KdfParams,
    lock: Mutex<()>,
}

impl PasswordAuthority {
    pub fn new(storage: Storage, max_attempts: u32, policy: PasswordPolicy, kdf: KdfParams) -> Self {
        Self {
            storage,
            max_attempts,
            policy,
            kdf,
            lock: Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.storage.exists()
    }

    /// First-time setup. Rejects weak passwords and any pair of equal passwords.
    pub fn initialize(&self, master: &str, decoy: &str, panic: &str) -> VaultResult<()> {
        let _guard = self.lock.lock();

        if self.storage.exists() {
            return Err(VaultError::AlreadyInitialized);
        }

        validate_set(&self.policy, master, decoy, panic)?;

        let file = RecordFile {
            version: RECORD_FILE_VERSION,
            master: PasswordRecord::create(master, self.kdf)?,
            decoy: PasswordRecord::create(decoy, self.kdf)?,
            panic: PasswordRecord::create(panic, self.kdf)?,
            failed_attempts: 0,
        };
        self.save(&file)?;

        info!(kdf = self.kdf.name(), "password records created");
        Ok(())
    }

    /// Classifies `password` and updates the failed-attempt counter.
    ///
    /// Once the counter has reached the configured maximum every call
    /// returns [`Classification::Locked`], whatever the password.
    pub fn classify(&self, password: &str) -> VaultResult<Classification> {
        let _guard = self.lock.lock();

        let mut file = self.load()?;
        if file.failed_attempts >= self.max_attempts {
            warn!("classification refused, attempt limit reached");
            return Ok(Classification::Locked);
        }

        let supplied = Choice::from(u8::from(!password.is_empty()));
        let candidate = if password.is_empty() { EMPTY_STANDIN } else { password };
        let [master, decoy, panic] = file.match_all(candidate)?.map(|hit| hit & supplied);
        let hits = master.unwrap_u8() + decoy.unwrap_u8() + panic.unwrap_u8();
        if hits > 1 {
            return Err(VaultError::Invariant("password matched more than one record"));
        }
        let verdict = if bool::from(master) {
            Classification::Master
        } else if bool::from(decoy) {
            Classification::Decoy
        } else if bool::from(panic) {
            Classification::Panic
        } else {
            Classification::Invalid
        };

        if verdict == Classification::Invalid {
            file.failed_attempts = file.failed_attempts.saturating_add(1);
            self.save(&file)?;
            info!(
                failed_attempts = file.failed_attempts,
                max = self.max_attempts,
                "password not recognised"
            );
        } else if file.failed_attempts != 0 {
            file.failed_attempts = 0;
            self.save(&file)?;
        }

        debug!("classification complete");
        Ok(verdict)
    }

    /// Attempts left before the vault locks.
    pub fn remaining_attempts(&self) -> VaultResult<u32> {
        let _guard = self.lock.lock();
        let file = self.load()?;
        Ok(self.max_attempts.saturating_sub(file.failed_attempts))
    }

    pub fn failed_attempts(&self) -> VaultResult<u32> {
        let _guard = self.lock.lock();
        Ok(self.load()?.failed_attempts)
    }

    pub fn reset_attempts(&self) -> VaultResult<()> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        file.failed_attempts = 0;
        self.save(&file)
    }

    /// Checks that `new_password` could replace the record for `kind`
    /// without writing anything.
    pub fn check_replacement(&self, kind: PasswordKind, new_password: &str) -> VaultResult<()> {
        let _guard = self.lock.lock();
        let file = self.load()?;
        self.check_candidate(&file, kind, new_password)
    }

    /// Replaces the record for `kind` with one for `new_password`.
    ///
    /// The new password must satisfy the policy and must not be accepted by
    /// either of the other two records.
    pub fn replace(&self, kind: PasswordKind, new_password: &str) -> VaultResult<()> {
        let _guard = self.lock.lock();
        let mut file = self.load()?;
        self.check_candidate(&file, kind, new_password)?;

        *file.record_mut(kind) = PasswordRecord::create(new_password, self.kdf)?;
        self.save(&file)?;

        info!(%kind, "password record replaced");
        Ok(())
    }

    fn check_candidate(&self, file: &RecordFile, kind: PasswordKind, new_password: &str) -> VaultResult<()> {
        self.policy
            .check(new_password)
            .map_err(|reason| VaultError::WeakPasswordPolicy { kind, reason })?;

        let [master, decoy, panic] = file.match_all(new_password)?;
        let clashes: Vec<_> = PasswordKind::ALL
            .into_iter()
            .zip([master, decoy, panic])
            .filter(|(other, hit)| *other != kind && bool::from(*hit))
            .map(|(other, _)| (kind, other))
            .collect();
        if !clashes.is_empty() {
            return Err(VaultError::PasswordReuse(clashes));
        }
        Ok(())
    }

    fn load(&self) -> VaultResult<RecordFile> {
        let data = self.storage.load()?;
        let file: RecordFile = serde_json::from_slice(&data)?;
        if file.version != RECORD_FILE_VERSION {
            return Err(VaultError::StorageFailure(format!(
                "unsupported record file version: {}",
                file.version
            )));
        }
        Ok(file)
    }

    fn save(&self, file: &RecordFile) -> VaultResult<()> {
        let data = serde_json::to_vec_pretty(file)?;
        self.storage.save(&data).map_err(VaultError::storage_chain)
    }
}

/// Policy check on each password, then pairwise distinctness.
pub fn validate_set(
    policy: &PasswordPolicy,
    master: &str,
    decoy: &str,
    panic: &str,
) -> VaultResult<()> {
    let set = [
        (PasswordKind::Master, master),
        (PasswordKind::Decoy, decoy),
        (PasswordKind::Panic, panic),
    ];

    for (kind, password) in set {
        policy
            .check(password)
            .map_err(|reason| VaultError::WeakPasswordPolicy { kind, reason })?;
    }

    let mut pairs = Vec::new();
    for i in 0..set.len() {
        for j in i + 1..set.len() {
            if set[i].1 == set[j].1 {
                pairs.push((set[i].0, set[j].0));
            }
        }
    }
    if !pairs.is_empty() {
        return Err(VaultError::PasswordReuse(pairs));
    }
    Ok(())
}
