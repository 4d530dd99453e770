//! HMAC-signed session tokens. Issued by the OIDC-callback completion (an
//! external collaborator) or the dev-mode impersonation endpoint; verified
//! on every request that presents one.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id (user id, or an impersonated subject in dev mode).
    pub sub: String,
    pub email: Option<String>,
    /// Home organization at issue time.
    pub org: Option<String>,
    /// Effective scopes at issue time.
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies session tokens under the boot-time HMAC secret.
pub struct JwtSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtSigner {
    #[must_use]
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(
        &self,
        sub: &str,
        email: Option<&str>,
        org: Option<&str>,
        scopes: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: sub.to_string(),
            email: email.map(str::to_string),
            org: org.map(str::to_string),
            scopes,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(self.ttl)?).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).context("failed to sign session token")
    }

    /// Verify signature and expiry; any failure is an invalid credential.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .context("invalid session token")?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> JwtSigner {
        JwtSigner::new(b"test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn test_issue_verify_round_trip() {
        let signer = signer();
        let token = signer
            .issue(
                "user-1",
                Some("dev@example.com"),
                Some("org-1"),
                vec!["modules:read".to_string()],
            )
            .unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.scopes, vec!["modules:read"]);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = signer().issue("user-1", None, None, vec![]).unwrap();
        let other = JwtSigner::new(b"different-secret", Duration::from_secs(3600));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        // Craft a token whose expiry is firmly in the past.
        let now = Utc::now();
        let claims = Claims {
            sub: "user-1".to_string(),
            email: None,
            org: None,
            scopes: vec![],
            iat: (now - chrono::Duration::hours(2)).timestamp(),
            exp: (now - chrono::Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(signer().verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(signer().verify("eyJ.garbage.token").is_err());
        assert!(signer().verify("").is_err());
    }
}
