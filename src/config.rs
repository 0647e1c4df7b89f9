//! Vault configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use tracing::debug;

use crate::KdfParams;
use crate::error::{PolicyViolation, VaultError, VaultResult};
use crate::storage::Storage;

pub const ENV_DIR: &str = "DURESSVAULT_DIR";
pub const ENV_MAX_ATTEMPTS: &str = "DURESSVAULT_MAX_ATTEMPTS";
pub const ENV_SESSION_TIMEOUT: &str = "DURESSVAULT_SESSION_TIMEOUT_SECS";

/// What the panic destroyer does once the last phase has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicExit {
    /// Exit the process with status 0, as a normal exit would.
    Terminate,
    /// Return the destruction report to the caller.
    Return,
}

/// Strength requirements for new passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    /// Out of four classes: lowercase, uppercase, digits, everything else.
    pub min_classes: u8,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 10,
            min_classes: 3,
        }
    }
}

impl PasswordPolicy {
    pub fn check(&self, password: &str) -> Result<(), PolicyViolation> {
        if password.chars().count() < self.min_length {
            return Err(PolicyViolation::TooShort {
                min: self.min_length,
            });
        }

        let mut classes = [false; 4];
        for c in password.chars() {
            let idx = if c.is_lowercase() {
                0
            } else if c.is_uppercase() {
                1
            } else if c.is_numeric() {
                2
            } else {
                3
            };
            classes[idx] = true;
        }
        let found = classes.iter().filter(|c| **c).count() as u8;
        if found < self.min_classes {
            return Err(PolicyViolation::TooFewCharacterClasses {
                min: self.min_classes,
                found,
            });
        }
        Ok(())
    }
}

/// Everything a [`Vault`](crate::Vault) needs to know about its environment.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    pub max_failed_attempts: u32,
    pub session_timeout: Duration,
    /// Parameters for newly created password records and key wraps.
    pub kdf: KdfParams,
    pub policy: PasswordPolicy,
    /// Random overwrite passes applied to each blob during panic destruction.
    pub overwrite_passes: u32,
    pub panic_exit: PanicExit,
}

impl VaultConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_failed_attempts: 5,
            session_timeout: Duration::from_secs(5 * 60),
            kdf: KdfParams::default(),
            policy: PasswordPolicy::default(),
            overwrite_passes: 3,
            panic_exit: PanicExit::Terminate,
        }
    }

    /// Reads overrides from the environment (and a `.env` file, if any).
    pub fn from_env() -> VaultResult<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }

        let root = match std::env::var_os(ENV_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_root()?,
        };
        let mut config = Self::new(root);

        if let Ok(raw) = std::env::var(ENV_MAX_ATTEMPTS) {
            config.max_failed_attempts = parse_max_attempts(&raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_SESSION_TIMEOUT) {
            let secs: u64 = raw
                .parse()
                .map_err(|_| VaultError::StorageFailure(format!("invalid {ENV_SESSION_TIMEOUT}")))?;
            config.session_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_max_failed_attempts(mut self, max: u32) -> Self {
        self.max_failed_attempts = max;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: PasswordPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_overwrite_passes(mut self, passes: u32) -> Self {
        self.overwrite_passes = passes;
        self
    }

    pub fn with_panic_exit(mut self, exit: PanicExit) -> Self {
        self.panic_exit = exit;
        self
    }

    pub fn layout(&self) -> VaultLayout {
        VaultLayout::new(&self.root)
    }
}

/// At least one attempt: a limit of zero would destroy the vault on the
/// first login.
fn parse_max_attempts(raw: &str) -> VaultResult<u32> {
    match raw.trim().parse::<u32>() {
        Ok(max) if max >= 1 => Ok(max),
        _ => Err(VaultError::StorageFailure(format!(
            "invalid {ENV_MAX_ATTEMPTS}: expected a whole number of at least 1"
        ))),
    }
}

/// Platform data directory, e.g. `~/.local/share/duressvault`.
pub fn default_root() -> VaultResult<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "duressvault")
        .ok_or_else(|| VaultError::storage("could not determine platform directories"))?;
    Ok(project_dirs.data_dir().to_path_buf())
}

/// Paths of every file the vault owns.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records(&self) -> Storage {
        Storage::new(self.root.join("auth.json"))
    }

    pub fn keys(&self) -> Storage {
        Storage::new(self.root.join("keys.json"))
    }

    pub fn metadata(&self) -> Storage {
        Storage::new(self.root.join("metadata.dvb"))
    }

    pub fn audit_log(&self) -> Storage {
        Storage::new(self.root.join("audit.log"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn blob(&self, blob_id: &str) -> Storage {
        Storage::new(self.blob_dir().join(format!("{blob_id}.dvb")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_accepts_strong_password() {
        let policy = PasswordPolicy::default();
        assert!(policy.check("Correct-Horse-9!").is_ok());
    }

    #[test]
    fn policy_rejects_short_password() {
        let policy = PasswordPolicy::default();
        assert_eq!(
            policy.check("Ab1!"),
            Err(PolicyViolation::TooShort { min: 10 })
        );
    }

    #[test]
    fn policy_counts_character_classes() {
        let policy = PasswordPolicy::default();
        assert_eq!(
            policy.check("alllowercaseletters"),
            Err(PolicyViolation::TooFewCharacterClasses { min: 3, found: 1 })
        );
        assert!(policy.check("lowercase-and-1").is_ok());
    }

    #[test]
    fn layout_places_blobs_under_root() {
        let layout = VaultLayout::new(Path::new("/vault"));
        assert_eq!(
            layout.blob("abc").path(),
            &PathBuf::from("/vault/blobs/abc.dvb")
        );
        assert_eq!(layout.keys().path(), &PathBuf::from("/vault/keys.json"));
    }

    #[test]
    fn max_attempts_must_be_positive() {
        assert_eq!(parse_max_attempts("3").unwrap(), 3);
        assert_eq!(parse_max_attempts(" 10\n").unwrap(), 10);
        assert!(parse_max_attempts("0").is_err());
        assert!(parse_max_attempts("-1").is_err());
        assert!(parse_max_attempts("many").is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = VaultConfig::new("/tmp/v")
            .with_max_failed_attempts(3)
            .with_overwrite_passes(1)
            .with_panic_exit(PanicExit::Return);
        assert_eq!(config.max_failed_attempts, 3);
        assert_eq!(config.overwrite_passes, 1);
        assert_eq!(config.panic_exit, PanicExit::Return);
        assert_eq!(config.session_timeout, Duration::from_secs(300));

        let relaxed = PasswordPolicy {
            min_length: 4,
            min_classes: 1,
        };
        let config = config
            .with_session_timeout(Duration::ZERO)
            .with_policy(relaxed);
        assert_eq!(config.session_timeout, Duration::ZERO);
        assert!(config.policy.check("abcd").is_ok());
    }
}
