//! # Credential Vault
//!
//! Symmetric AEAD (AES-256-GCM) over connection secrets. The per-install
//! key lives next to the metadata store as `vault.key` (0600 on unix) and
//! is created on first use. `seal` prepends the random 96-bit nonce to the
//! ciphertext; `open` splits it back, so `open(seal(x)) == x` for every
//! payload.
//!
//! Key material is never logged; the logging masker additionally covers
//! secrets that leak into messages.

use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};

use crate::domain::errors::{MigrationError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Handle over the per-install AEAD key.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Loads the key file, creating it with fresh random material if absent.
    pub fn load(key_path: &Path) -> Result<CredentialVault> {
        let key_bytes = if key_path.exists() {
            let bytes = std::fs::read(key_path)?;
            if bytes.len() != KEY_LEN {
                return Err(MigrationError::Vault(format!(
                    "vault key has unexpected length {} (expected {KEY_LEN})",
                    bytes.len()
                )));
            }
            bytes
        } else {
            let mut bytes = vec![0u8; KEY_LEN];
            OsRng.fill_bytes(&mut bytes);
            write_key_file(key_path, &bytes)?;
            bytes
        };

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(CredentialVault {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Builds a vault from raw key bytes (tests).
    pub fn from_key(key_bytes: &[u8; KEY_LEN]) -> CredentialVault {
        CredentialVault {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes)),
        }
    }

    /// Encrypts a payload and returns `base64(nonce || ciphertext)`,
    /// suitable for a TEXT column.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| MigrationError::Vault("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    /// Reverses `seal`, returning the plaintext. Fails on tampered or
    /// truncated input.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let bytes = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| MigrationError::Vault(format!("invalid sealed payload: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(MigrationError::Vault(
                "sealed payload too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| MigrationError::Vault("decryption failed".to_string()))
    }
}

#[cfg(unix)]
fn write_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, bytes)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_identity() {
        let vault = CredentialVault::from_key(&[7u8; 32]);
        for payload in [&b""[..], b"pw", br#"{"password":"s3cret!"}"#] {
            let sealed = vault.seal(payload).unwrap();
            assert_eq!(vault.open(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn test_sealed_output_is_not_plaintext() {
        let vault = CredentialVault::from_key(&[1u8; 32]);
        let sealed = vault.seal(b"hunter2hunter2").unwrap();
        assert!(!sealed.contains("hunter2"));
        // Nonces are random, so sealing twice never repeats.
        assert_ne!(sealed, vault.seal(b"hunter2hunter2").unwrap());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let vault = CredentialVault::from_key(&[2u8; 32]);
        let sealed = vault.seal(b"payload").unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);
        assert!(vault.open(&tampered).is_err());
    }

    #[test]
    fn test_key_file_created_and_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let key_path = tmp.path().join("vault.key");

        let vault_a = CredentialVault::load(&key_path).unwrap();
        let sealed = vault_a.seal(b"stable").unwrap();

        // A second open must read the same key back.
        let vault_b = CredentialVault::load(&key_path).unwrap();
        assert_eq!(vault_b.open(&sealed).unwrap(), b"stable");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = CredentialVault::from_key(&[3u8; 32]).seal(b"x").unwrap();
        assert!(CredentialVault::from_key(&[4u8; 32]).open(&sealed).is_err());
    }
}
