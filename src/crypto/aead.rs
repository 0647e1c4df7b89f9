use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::secure::random_array;
use super::{KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{IntegrityKind, VaultError, VaultResult};

/// Self-contained AEAD output: everything needed to decrypt, given the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "hex::serde")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub tag: [u8; TAG_LEN],
}

/// Encrypt plaintext under `key` with a fresh random nonce.
///
/// `aad` is authenticated but not encrypted; the same bytes must be
/// supplied to [`decrypt`].
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> VaultResult<EncryptedBlob> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce: [u8; NONCE_LEN] = random_array()?;

    let mut sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| VaultError::CryptoFailure("encryption failed".into()))?;

    if sealed.len() < TAG_LEN {
        return Err(VaultError::Invariant("aead output shorter than tag"));
    }
    let split = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[split..]);
    sealed.truncate(split);

    Ok(EncryptedBlob {
        nonce,
        ciphertext: sealed,
        tag,
    })
}

/// Decrypt a blob. Any mismatch of key, associated data, nonce, ciphertext,
/// or tag yields the same `IntegrityFailure`.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    blob: &EncryptedBlob,
    aad: &[u8],
) -> VaultResult<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&blob.ciphertext);
    sealed.extend_from_slice(&blob.tag);

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&blob.nonce),
            Payload { msg: &sealed, aad },
        )
        .map_err(|_| VaultError::IntegrityFailure(IntegrityKind::Authentication))?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    fn assert_integrity_failure(result: VaultResult<Zeroizing<Vec<u8>>>) {
        match result {
            Err(VaultError::IntegrityFailure(IntegrityKind::Authentication)) => {}
            other => panic!("expected IntegrityFailure, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn roundtrip_empty_small_and_large() {
        let large = vec![0x5Au8; 1024 * 1024 + 3];
        for plaintext in [Vec::new(), vec![1u8], large] {
            let blob = encrypt(&KEY, &plaintext, b"ctx").unwrap();
            assert_eq!(blob.ciphertext.len(), plaintext.len());
            let out = decrypt(&KEY, &blob, b"ctx").unwrap();
            assert_eq!(*out, plaintext);
        }
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let a = encrypt(&KEY, b"same", b"").unwrap();
        let b = encrypt(&KEY, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn any_flipped_bit_is_detected() {
        let blob = encrypt(&KEY, b"attack at dawn", b"ctx").unwrap();

        for i in 0..blob.ciphertext.len() * 8 {
            let mut bad = blob.clone();
            bad.ciphertext[i / 8] ^= 1 << (i % 8);
            assert_integrity_failure(decrypt(&KEY, &bad, b"ctx"));
        }
        for i in 0..NONCE_LEN * 8 {
            let mut bad = blob.clone();
            bad.nonce[i / 8] ^= 1 << (i % 8);
            assert_integrity_failure(decrypt(&KEY, &bad, b"ctx"));
        }
        for i in 0..TAG_LEN * 8 {
            let mut bad = blob.clone();
            bad.tag[i / 8] ^= 1 << (i % 8);
            assert_integrity_failure(decrypt(&KEY, &bad, b"ctx"));
        }
    }

    #[test]
    fn wrong_key_and_wrong_aad_fail_identically() {
        let blob = encrypt(&KEY, b"secret", b"ctx").unwrap();
        assert_integrity_failure(decrypt(&[8u8; KEY_LEN], &blob, b"ctx"));
        assert_integrity_failure(decrypt(&KEY, &blob, b"other"));
    }

    #[test]
    fn blob_serializes_as_hex() {
        let blob = encrypt(&KEY, b"x", b"").unwrap();
        let json = serde_json::to_string(&blob).unwrap();
        let back: EncryptedBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }
}
