//! # Cipher
//!
//! Authenticated symmetric encryption of at-rest secrets (OAuth tokens, SCM
//! client secrets, storage credentials) using AES-256-GCM under a
//! process-wide key.
//!
//! Sealed token format: base64(nonce || ciphertext). A fresh random 12-byte
//! nonce is drawn per seal. Opening fails on any tampering, including key
//! mismatch. Key rotation is out of scope; re-encryption is performed
//! externally.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use zeroize::Zeroizing;

/// Size of the AES-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encrypt_failed")]
    EncryptFailed,
    /// Tampered token, truncated token, or key mismatch.
    #[error("decrypt_failed")]
    DecryptFailed,
}

/// Seals and opens byte strings under the boot-time key.
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Create a cipher from the 32-byte process key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Seal a byte string, returning a base64 token.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Seal a UTF-8 secret.
    pub fn seal_str(&self, plaintext: &str) -> Result<String, CipherError> {
        self.seal(plaintext.as_bytes())
    }

    /// Open a sealed token back into bytes.
    pub fn open(&self, token: &str) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let raw = BASE64.decode(token).map_err(|_| CipherError::DecryptFailed)?;
        if raw.len() < NONCE_SIZE {
            return Err(CipherError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::DecryptFailed)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Open a sealed token expected to contain UTF-8.
    pub fn open_str(&self, token: &str) -> Result<Zeroizing<String>, CipherError> {
        let bytes = self.open(token)?;
        let text =
            String::from_utf8(bytes.to_vec()).map_err(|_| CipherError::DecryptFailed)?;
        Ok(Zeroizing::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(&[42u8; 32])
    }

    #[test]
    fn test_seal_open_round_trip() {
        let c = cipher();
        let sealed = c.seal(b"ghp_example_token").unwrap();
        let opened = c.open(&sealed).unwrap();
        assert_eq!(opened.as_slice(), b"ghp_example_token");
    }

    #[test]
    fn test_seal_is_randomized() {
        let c = cipher();
        let a = c.seal(b"same input").unwrap();
        let b = c.seal(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_rejects_tampering() {
        let c = cipher();
        let sealed = c.seal(b"payload").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(c.open(&tampered), Err(CipherError::DecryptFailed)));
    }

    #[test]
    fn test_open_rejects_key_mismatch() {
        let sealed = cipher().seal(b"payload").unwrap();
        let other = Cipher::new(&[7u8; 32]);
        assert!(matches!(other.open(&sealed), Err(CipherError::DecryptFailed)));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let c = cipher();
        assert!(c.open("not base64 at all!").is_err());
        assert!(c.open(&BASE64.encode(b"short")).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let c = cipher();
        let sealed = c.seal_str("s3cr3t").unwrap();
        assert_eq!(c.open_str(&sealed).unwrap().as_str(), "s3cr3t");
    }
}
