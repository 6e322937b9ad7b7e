//! Pseudonymous identity: alias derivation and request resolution
//!
//! An alias is a salted, keyed 256-bit hash of the upstream identity. It is
//! never reversible and is the sole key under which behavior is stored. The
//! keyed construction means a database dump without the process salt cannot
//! be joined back to upstream accounts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Config;
use crate::error::Result;
use crate::store::Store;

/// Reserved alias for requests without resolvable identity
const ANONYMOUS: &str = "anonymous";

/// Stable pseudonymous user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserAlias(String);

impl UserAlias {
    /// Derive the alias for `(instance, account_id)` under the given salt.
    ///
    /// Uses BLAKE3 in keyed mode; the 32-byte key is itself derived from the
    /// configured salt string so operators can rotate a plain string secret.
    pub fn derive(salt: &str, instance: &str, account_id: &str) -> Self {
        let key = blake3::hash(salt.as_bytes());
        let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
        hasher.update(instance.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(account_id.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// The reserved anonymous alias
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    /// Whether this is the reserved anonymous alias
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS
    }

    /// Raw alias string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct from an already-derived value (store reads)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for UserAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which resolution tier produced the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTier {
    /// Bearer token mapped through the token store
    Token,
    /// Development-only query-parameter identity
    Query,
    /// No resolvable identity
    Anonymous,
}

impl AuthTier {
    /// Header value advertised in `X-Corgi-Auth-Tier`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Query => "query",
            Self::Anonymous => "anonymous",
        }
    }
}

/// The effective identity of a request
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// Pseudonymous alias
    pub alias: UserAlias,
    /// Resolution tier used
    pub tier: AuthTier,
    /// Upstream instance requests are routed to
    pub instance: String,
    /// Bearer token to present upstream, when one was supplied
    pub token: Option<String>,
}

impl ResolvedIdentity {
    /// Anonymous identity against the configured default instance
    pub fn anonymous(default_instance: &str) -> Self {
        Self {
            alias: UserAlias::anonymous(),
            tier: AuthTier::Anonymous,
            instance: default_instance.to_string(),
            token: None,
        }
    }
}

/// Lowercase an instance name and strip scheme, port, and trailing slash.
/// Used by identity, the crawler, and cache fingerprints alike so the same
/// instance never appears under two spellings.
pub fn canonical_instance(raw: &str) -> String {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_prefix("https://").unwrap_or(&s);
    let s = s.strip_prefix("http://").unwrap_or(s);
    let s = s.trim_end_matches('/');
    match s.split_once(':') {
        Some((host, _port)) => host.to_string(),
        None => s.to_string(),
    }
}

/// Resolve a request's identity.
///
/// Tiers, tried in order: bearer token through the token store; query
/// parameters (only when the development bypass is configured on); the
/// anonymous alias. Expired token mappings fall through to the next tier.
pub async fn resolve(
    config: &Config,
    store: &dyn Store,
    bearer: Option<&str>,
    query_user: Option<(&str, &str)>,
) -> Result<ResolvedIdentity> {
    if let Some(token) = bearer {
        match store.token_mapping(token).await {
            Ok(Some(mapping)) if !mapping.is_expired(Utc::now()) => {
                return Ok(ResolvedIdentity {
                    alias: mapping.alias,
                    tier: AuthTier::Token,
                    instance: canonical_instance(&mapping.instance),
                    token: Some(token.to_string()),
                });
            }
            Ok(_) => {}
            Err(e) => {
                // A store outage must not lock authenticated users out of
                // graceful endpoints; degrade to anonymous and let strict
                // endpoints reject downstream.
                tracing::warn!(error = %e, "token mapping lookup failed; degrading");
            }
        }
    }

    if config.identity.allow_query_fallback && !config.service.is_production() {
        if let Some((user_id, instance)) = query_user {
            let instance = canonical_instance(instance);
            let alias = UserAlias::derive(&config.identity.salt, &instance, user_id);
            return Ok(ResolvedIdentity {
                alias,
                tier: AuthTier::Query,
                instance,
                token: None,
            });
        }
    }

    Ok(ResolvedIdentity::anonymous(&config.upstream.default_instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_and_salt_sensitive() {
        let a = UserAlias::derive("salt-1", "mastodon.social", "1234");
        let b = UserAlias::derive("salt-1", "mastodon.social", "1234");
        let c = UserAlias::derive("salt-2", "mastodon.social", "1234");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn derivation_separates_instance_and_account() {
        // The separator byte prevents ("ab", "c") colliding with ("a", "bc").
        let a = UserAlias::derive("s", "ab", "c");
        let b = UserAlias::derive("s", "a", "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn anonymous_is_reserved() {
        let anon = UserAlias::anonymous();
        assert!(anon.is_anonymous());
        assert!(!UserAlias::derive("s", "i", "u").is_anonymous());
    }

    #[test]
    fn instance_canonicalization() {
        assert_eq!(canonical_instance("https://Mastodon.Social/"), "mastodon.social");
        assert_eq!(canonical_instance("http://fosstodon.org:443"), "fosstodon.org");
        assert_eq!(canonical_instance("hachyderm.io"), "hachyderm.io");
    }

    #[tokio::test]
    async fn query_tier_requires_development_bypass() {
        let store = crate::store::memory::MemoryStore::new();
        let mut config = Config::default();
        config.identity.allow_query_fallback = false;

        let id = resolve(&config, &store, None, Some(("42", "mastodon.social")))
            .await
            .unwrap();
        assert_eq!(id.tier, AuthTier::Anonymous);

        config.identity.allow_query_fallback = true;
        let id = resolve(&config, &store, None, Some(("42", "mastodon.social")))
            .await
            .unwrap();
        assert_eq!(id.tier, AuthTier::Query);
        assert!(!id.alias.is_anonymous());
    }

    #[tokio::test]
    async fn query_tier_fails_closed_in_production() {
        let store = crate::store::memory::MemoryStore::new();
        let mut config = Config::default();
        config.identity.allow_query_fallback = true;
        config.service.environment = "production".to_string();

        let id = resolve(&config, &store, None, Some(("42", "mastodon.social")))
            .await
            .unwrap();
        assert_eq!(id.tier, AuthTier::Anonymous);
    }

    #[tokio::test]
    async fn bearer_tier_resolves_through_token_store() {
        use crate::models::TokenMapping;

        let store = crate::store::memory::MemoryStore::new();
        let alias = UserAlias::derive("s", "mastodon.social", "7");
        store.seed_token(TokenMapping {
            alias: alias.clone(),
            instance: "mastodon.social".to_string(),
            token: "opaque-token".to_string(),
            expires_at: None,
            scopes: vec!["read".to_string()],
        });

        let config = Config::default();
        let id = resolve(&config, &store, Some("opaque-token"), None)
            .await
            .unwrap();
        assert_eq!(id.tier, AuthTier::Token);
        assert_eq!(id.alias, alias);
        assert_eq!(id.token.as_deref(), Some("opaque-token"));

        let id = resolve(&config, &store, Some("unknown"), None).await.unwrap();
        assert_eq!(id.tier, AuthTier::Anonymous);
    }
}
