use argon2::{Algorithm, Argon2, Params, Version};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{KEY_LEN, SALT_LEN};
use crate::error::{VaultError, VaultResult};

/// Fallback iteration count for PBKDF2-HMAC-SHA256.
pub const PBKDF2_DEFAULT_ITERATIONS: u32 = 600_000;
const PBKDF2_MIN_ITERATIONS: u32 = 10_000;

/// A 256-bit key derived from a password. Zeroed on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

/// Key derivation algorithm and cost, stored next to every salt so a
/// derivation can be reproduced exactly later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KdfParams {
    Argon2id {
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
    Pbkdf2Sha256 {
        iterations: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Argon2id {
            // 64 MiB
            mem_cost_kib: 64 * 1024,
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn argon2id(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> VaultResult<Self> {
        let params = KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn pbkdf2(iterations: u32) -> VaultResult<Self> {
        let params = KdfParams::Pbkdf2Sha256 { iterations };
        params.validate()?;
        Ok(params)
    }

    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Argon2id { .. } => "argon2id",
            KdfParams::Pbkdf2Sha256 { .. } => "pbkdf2-sha256",
        }
    }

    pub fn validate(&self) -> VaultResult<()> {
        match *self {
            KdfParams::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => {
                if parallelism < 1 {
                    return Err(VaultError::InvalidKdfParams("argon2 parallelism must be >= 1"));
                }
                if time_cost < 1 {
                    return Err(VaultError::InvalidKdfParams("argon2 time cost must be >= 1"));
                }
                if mem_cost_kib < parallelism.saturating_mul(8) {
                    return Err(VaultError::InvalidKdfParams(
                        "argon2 memory cost must be at least 8 * parallelism",
                    ));
                }
            }
            KdfParams::Pbkdf2Sha256 { iterations } => {
                if iterations < PBKDF2_MIN_ITERATIONS {
                    return Err(VaultError::InvalidKdfParams("pbkdf2 iteration count too low"));
                }
            }
        }
        Ok(())
    }

    /// Returns `preferred` if it can actually run on this machine, otherwise
    /// the PBKDF2 fallback.
    pub fn negotiate(preferred: KdfParams) -> KdfParams {
        if let KdfParams::Argon2id { .. } = preferred {
            let trial_salt = [0u8; SALT_LEN];
            if let Err(e) = derive_key("trial", &trial_salt, preferred) {
                warn!(error = %e, "argon2id unavailable, falling back to pbkdf2");
                return KdfParams::Pbkdf2Sha256 {
                    iterations: PBKDF2_DEFAULT_ITERATIONS,
                };
            }
        }
        preferred
    }
}

/// Derives a 256-bit key from `password` and `salt`.
///
/// Runtime depends only on the parameters, not on the password content.
pub fn derive_key(password: &str, salt: &[u8], kdf: KdfParams) -> VaultResult<DerivedKey> {
    if password.is_empty() {
        return Err(VaultError::EmptyPassword);
    }
    if salt.len() < SALT_LEN {
        return Err(VaultError::InvalidKdfParams("salt too short"));
    }
    kdf.validate()?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);

    match kdf {
        KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let params = Params::new(mem_cost_kib, time_cost, parallelism, Some(KEY_LEN))
                .map_err(|_| VaultError::InvalidKdfParams("rejected by argon2"))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(password.as_bytes(), salt, &mut key[..])
                .map_err(|_| VaultError::CryptoFailure("argon2 key derivation failed".into()))?;
        }
        KdfParams::Pbkdf2Sha256 { iterations } => {
            pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
        }
    }

    debug!(kdf = kdf.name(), "derived key");
    Ok(key)
}
