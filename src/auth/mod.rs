//! # Authz Core
//!
//! Resolves an inbound credential to a (principal, scope set) binding and
//! enforces required scopes per operation.
//!
//! Resolution order for the `Authorization: Bearer` header: HMAC-signed
//! session JWT first, then opaque API key (prefix-identified, hash
//! compared). The first successful resolution wins. Handlers assert scopes
//! with [`AuthContext::require`]; the `admin` scope satisfies any
//! requirement. Rate limiting is a separate collaborator.

use std::collections::HashSet;

use crate::db::api_keys::ApiKeyRepository;
use crate::db::orgs::OrgRepository;
use crate::error::RegistryError;

pub mod api_key;
pub mod jwt;

pub use jwt::JwtSigner;

/// Scope vocabulary. Hierarchical by convention only.
pub mod scopes {
    pub const ADMIN: &str = "admin";
    pub const MODULES_READ: &str = "modules:read";
    pub const MODULES_WRITE: &str = "modules:write";
    pub const PROVIDERS_READ: &str = "providers:read";
    pub const PROVIDERS_WRITE: &str = "providers:write";
    pub const MIRRORS_READ: &str = "mirrors:read";
    pub const MIRRORS_MANAGE: &str = "mirrors:manage";
    pub const USERS_READ: &str = "users:read";
    pub const USERS_WRITE: &str = "users:write";
    pub const ORGANIZATIONS_READ: &str = "organizations:read";
    pub const ORGANIZATIONS_WRITE: &str = "organizations:write";
    pub const SCM_READ: &str = "scm:read";
    pub const SCM_MANAGE: &str = "scm:manage";
    pub const API_KEYS_MANAGE: &str = "api_keys:manage";
}

/// What kind of credential resolved the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalKind {
    User,
    ApiKey,
}

/// Request-scoped binding of principal and effective scopes.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal_id: String,
    pub principal_kind: PrincipalKind,
    /// Owning organization, always present for API keys.
    pub organization_id: Option<String>,
    pub scopes: HashSet<String>,
}

impl AuthContext {
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains(scopes::ADMIN)
    }

    /// Reject with `forbidden` unless the effective set contains the scope
    /// (or `admin`).
    pub fn require(&self, scope: &str) -> Result<(), RegistryError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(RegistryError::Forbidden(scope.to_string()))
        }
    }
}

/// Stateless part of resolution plus the repositories it needs.
pub struct Authenticator {
    jwt: JwtSigner,
    api_keys: ApiKeyRepository,
    orgs: OrgRepository,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    #[must_use]
    pub fn new(jwt: JwtSigner, api_keys: ApiKeyRepository, orgs: OrgRepository) -> Self {
        Self {
            jwt,
            api_keys,
            orgs,
        }
    }

    #[must_use]
    pub fn jwt(&self) -> &JwtSigner {
        &self.jwt
    }

    /// Resolve an `Authorization` header value into an auth context.
    ///
    /// Returns `Ok(None)` when no credential is present and `Unauthorized`
    /// when one is present but invalid.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> Result<Option<AuthContext>, RegistryError> {
        let Some(raw) = authorization else {
            return Ok(None);
        };
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .ok_or(RegistryError::Unauthorized)?
            .trim();
        if token.is_empty() {
            return Err(RegistryError::Unauthorized);
        }

        // Session JWT first; fall back to API key on any decode failure.
        if let Ok(claims) = self.jwt.verify(token) {
            return Ok(Some(AuthContext {
                principal_id: claims.sub,
                principal_kind: PrincipalKind::User,
                organization_id: claims.org,
                scopes: claims.scopes.into_iter().collect(),
            }));
        }

        self.resolve_api_key(token).await.map(Some)
    }

    async fn resolve_api_key(&self, secret: &str) -> Result<AuthContext, RegistryError> {
        let prefix = api_key::presented_prefix(secret).ok_or(RegistryError::Unauthorized)?;
        let key = self
            .api_keys
            .get_by_prefix(prefix)
            .await?
            .ok_or(RegistryError::Unauthorized)?;
        if key.is_expired(crate::db::now()) {
            return Err(RegistryError::Unauthorized);
        }
        if !api_key::verify(secret, &key.secret_hash) {
            return Err(RegistryError::Unauthorized);
        }

        // Effective scopes: the key's own grants plus the owning user's
        // membership scopes, when the key is bound to a user.
        let mut scopes: HashSet<String> = key.scope_list().into_iter().collect();
        if let Some(user_id) = &key.user_id {
            for scope in self.orgs.effective_user_scopes(user_id).await? {
                scopes.insert(scope);
            }
        }

        // Bookkeeping off the hot path.
        let api_keys = self.api_keys.clone();
        let key_id = key.id.clone();
        tokio::spawn(async move {
            if let Err(error) = api_keys.touch_last_used(&key_id).await {
                tracing::debug!(%error, "failed to update api key last_used_at");
            }
        });

        Ok(AuthContext {
            principal_id: key.id,
            principal_kind: PrincipalKind::ApiKey,
            organization_id: Some(key.organization_id),
            scopes,
        })
    }
}
