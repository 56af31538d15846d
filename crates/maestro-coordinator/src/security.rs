use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use maestro_core::{Permission, SecurityContext, SecurityVerdict};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tracing::debug;

/// External authority over security contexts.
#[async_trait]
pub trait SecurityValidator: Send + Sync {
    /// Check a presented context. Denials carry a reason.
    async fn validate(&self, context: &SecurityContext) -> SecurityVerdict;

    /// Whether `principal` currently holds `permission`.
    async fn validate_permission(&self, principal: &str, permission: Permission) -> bool;
}

struct TokenGrant {
    digest: [u8; 32],
    permissions: BTreeSet<Permission>,
    expires_at: DateTime<Utc>,
}

impl TokenGrant {
    fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }
}

/// In-process bearer-token validator.
///
/// Tokens are 32 random bytes encoded as unpadded base64url. Only the SHA-256
/// digest is retained, one grant per principal; issuing again replaces it.
#[derive(Default)]
pub struct TokenSecurityValidator {
    grants: DashMap<String, TokenGrant>,
}

impl TokenSecurityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `principal` and return a ready-to-present context.
    pub fn issue(
        &self,
        principal: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
        ttl: Duration,
    ) -> SecurityContext {
        let principal = principal.into();
        let random_bytes: [u8; 32] = rand::random();
        let token = URL_SAFE_NO_PAD.encode(random_bytes);
        let permissions: BTreeSet<Permission> = permissions.into_iter().collect();
        let expires_at = Utc::now() + ttl;

        let _ = self.grants.insert(
            principal.clone(),
            TokenGrant {
                digest: digest(&token),
                permissions: permissions.clone(),
                expires_at,
            },
        );
        debug!(principal = %principal, "issued token");
        SecurityContext::new(principal, token, permissions, expires_at)
    }

    /// Drop the grant for `principal`. Returns whether one existed.
    pub fn revoke(&self, principal: &str) -> bool {
        self.grants.remove(principal).is_some()
    }

    fn check(&self, context: &SecurityContext, now: DateTime<Utc>) -> SecurityVerdict {
        if !context.has_token() {
            return SecurityVerdict::deny("missing token");
        }
        if context.is_expired_at(now) {
            return SecurityVerdict::deny("token expired");
        }
        if context.permissions.is_empty() {
            return SecurityVerdict::deny("token carries no permissions");
        }
        let Some(grant) = self.grants.get(&context.principal) else {
            return SecurityVerdict::deny(format!("unknown principal {}", context.principal));
        };
        if grant.expires_at <= now {
            return SecurityVerdict::deny("token expired");
        }
        if !constant_time_eq(&grant.digest, &digest(context.token.expose_secret())) {
            return SecurityVerdict::deny("token does not match");
        }
        if let Some(extra) = context.permissions.iter().find(|p| !grant.allows(**p)) {
            return SecurityVerdict::deny(format!("permission {} not granted", extra.as_str()));
        }
        SecurityVerdict::allow()
    }
}

#[async_trait]
impl SecurityValidator for TokenSecurityValidator {
    async fn validate(&self, context: &SecurityContext) -> SecurityVerdict {
        self.check(context, Utc::now())
    }

    async fn validate_permission(&self, principal: &str, permission: Permission) -> bool {
        self.grants
            .get(principal)
            .is_some_and(|grant| grant.expires_at > Utc::now() && grant.allows(permission))
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
