//! API key secret generation, hashing and verification.
//!
//! Secrets look like `tfr_<40 random alphanumerics>`; the displayable
//! prefix is the first 8 characters and doubles as the lookup key. Only the
//! Argon2id hash is persisted, so comparison is always hash-based.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

/// Length of the displayable prefix persisted alongside the hash.
pub const PREFIX_LEN: usize = 8;
const SECRET_RANDOM_LEN: usize = 40;

/// A freshly generated key: the plaintext leaves the process exactly once,
/// in the creation response.
#[derive(Debug)]
pub struct GeneratedKey {
    pub secret: Zeroizing<String>,
    pub prefix: String,
}

/// Generate a new key secret and its prefix.
#[must_use]
pub fn generate() -> GeneratedKey {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_RANDOM_LEN)
        .map(char::from)
        .collect();
    let secret = format!("tfr_{random}");
    let prefix = secret[..PREFIX_LEN].to_string();
    GeneratedKey {
        secret: Zeroizing::new(secret),
        prefix,
    }
}

/// Extract the lookup prefix from a presented secret.
#[must_use]
pub fn presented_prefix(secret: &str) -> Option<&str> {
    secret.get(..PREFIX_LEN)
}

/// Hash a secret for persistence.
pub fn hash(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash api key: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a presented secret against a stored hash.
#[must_use]
pub fn verify(secret: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_shape() {
        let key = generate();
        assert!(key.secret.starts_with("tfr_"));
        assert_eq!(key.secret.len(), 4 + SECRET_RANDOM_LEN);
        assert_eq!(key.prefix.len(), PREFIX_LEN);
        assert!(key.secret.starts_with(&key.prefix));
    }

    #[test]
    fn test_hash_verify_round_trip() {
        let key = generate();
        let stored = hash(&key.secret).unwrap();
        assert!(verify(&key.secret, &stored));
        assert!(!verify("tfr_wrongsecret", &stored));
    }

    #[test]
    fn test_hash_is_salted() {
        let key = generate();
        let a = hash(&key.secret).unwrap();
        let b = hash(&key.secret).unwrap();
        assert_ne!(a, b);
        assert!(verify(&key.secret, &a));
        assert!(verify(&key.secret, &b));
    }

    #[test]
    fn test_verify_tolerates_malformed_hash() {
        assert!(!verify("tfr_x", "not-a-phc-string"));
    }

    #[test]
    fn test_presented_prefix() {
        assert_eq!(presented_prefix("tfr_abcdef123"), Some("tfr_abcd"));
        assert_eq!(presented_prefix("short"), None);
    }
}
