//! Envelope encryption for `session_material` at rest (spec.md §6.4): AES-256-GCm
//! keyed by a per-account key derived via HKDF-SHA256 from the process-wide
//! `DATA_ENCRYPTION_KEY`, so compromising one account's row never exposes another's
//! key even if the root key is later rotated per-derivation-context.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

fn derive_key(root_key: &[u8], account_id: &str) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, root_key);
    let mut okm = [0u8; 32];
    hk.expand(account_id.as_bytes(), &mut okm)
        .map_err(|_| Error::internal("failed to derive session_material encryption key"))?;
    Ok(okm)
}

/// Encrypts `plaintext` under a key derived from `root_key` and `account_id`.
/// Returns `(ciphertext, nonce)`, the exact shape `AccountRow` stores.
pub fn encrypt_session_material(
    root_key: &[u8],
    account_id: &str,
    plaintext: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_bytes = derive_key(root_key, account_id)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| Error::internal("session_material encryption failed"))?;
    Ok((ciphertext, nonce_bytes.to_vec()))
}

/// Inverse of [`encrypt_session_material`]; `account_id` must match the value used
/// at encryption time or the derived key (and thus decryption) will not match.
pub fn decrypt_session_material(
    root_key: &[u8],
    account_id: &str,
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<String> {
    if nonce.len() != NONCE_LEN {
        return Err(Error::internal("session_material nonce has unexpected length"));
    }
    let key_bytes = derive_key(root_key, account_id)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::internal("session_material decryption failed"))?;
    String::from_utf8(plaintext).map_err(|_| Error::internal("decrypted session_material is not valid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let root_key = [7u8; 32];
        let (ciphertext, nonce) = encrypt_session_material(&root_key, "acc-1", "super-secret-token").unwrap();
        let plaintext = decrypt_session_material(&root_key, "acc-1", &ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, "super-secret-token");
    }

    #[test]
    fn wrong_account_id_fails_to_decrypt() {
        let root_key = [7u8; 32];
        let (ciphertext, nonce) = encrypt_session_material(&root_key, "acc-1", "token").unwrap();
        assert!(decrypt_session_material(&root_key, "acc-2", &ciphertext, &nonce).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let root_key = [7u8; 32];
        let (mut ciphertext, nonce) = encrypt_session_material(&root_key, "acc-1", "token").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(decrypt_session_material(&root_key, "acc-1", &ciphertext, &nonce).is_err());
    }
}
