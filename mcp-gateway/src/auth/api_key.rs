//! API-key validation against the relational store
//!
//! Keys are stored only as SHA-256 digests. Positive lookups are cached in
//! Redis for a short TTL; invalid keys are negative-cached to shed repeated
//! load from misconfigured clients.

use deadpool_redis::Pool as RedisPool;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::cache;
use crate::config::ApiKeyConfig;
use crate::db::dao;
use crate::error::{Error, Result};

use super::UserContext;

const NEGATIVE_SENTINEL: &str = "invalid";

/// Validates API keys created by the account plane
#[derive(Clone)]
pub struct ApiKeyValidator {
    pool: PgPool,
    redis: Option<RedisPool>,
    config: ApiKeyConfig,
}

impl ApiKeyValidator {
    pub fn new(pool: PgPool, redis: Option<RedisPool>, config: ApiKeyConfig) -> Self {
        Self { pool, redis, config }
    }

    /// Whether a bearer token looks like one of our API keys
    pub fn looks_like_api_key(&self, token: &str) -> bool {
        token.starts_with(&self.config.prefix)
    }

    /// SHA-256 hex digest of a key, as stored in the database
    pub fn hash_key(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        format!("{:x}", digest)
    }

    /// Validate an API key and build the caller's user context
    ///
    /// Fails with an authentication error for unknown, disabled or expired
    /// keys. Cache trouble is logged and never blocks validation.
    pub async fn validate(&self, api_key: &str) -> Result<UserContext> {
        if api_key.is_empty() {
            return Err(Error::Unauthorized("Missing API key".to_string()));
        }

        let cache_key = self.cache_key(api_key);

        if let Some(redis) = &self.redis {
            match cache::get(redis, &cache_key).await {
                Ok(Some(cached)) if cached == NEGATIVE_SENTINEL => {
                    return Err(Error::Unauthorized("Invalid API key (cached)".to_string()));
                }
                Ok(Some(cached)) => {
                    if let Ok(context) = serde_json::from_str::<UserContext>(&cached) {
                        tracing::debug!("API key validated from cache: {}", cache_key);
                        return Ok(context);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Redis cache read failed: {}", e),
            }
        }

        let key_hash = Self::hash_key(api_key);

        let identity = match dao::lookup_api_key(&self.pool, &key_hash).await? {
            Some(identity) => identity,
            None => {
                // Negative-cache to prevent repeated DB queries
                if let Some(redis) = &self.redis {
                    if let Err(e) = cache::set_ex(
                        redis,
                        &cache_key,
                        NEGATIVE_SENTINEL,
                        self.config.negative_cache_ttl_secs,
                    )
                    .await
                    {
                        tracing::warn!("Redis cache write failed: {}", e);
                    }
                }

                return Err(Error::Unauthorized(
                    "Invalid or expired API key".to_string(),
                ));
            }
        };

        if let Err(e) = dao::touch_api_key(&self.pool, &identity.api_key_id).await {
            tracing::warn!("Failed to update API key last_used_at: {}", e);
        }

        let context = UserContext {
            user_id: identity.user_id,
            email: identity.email,
            name: identity.user_name,
            role: identity.role.clone(),
            roles: vec![identity.role],
            tenant_id: identity.tenant_id,
            api_key_id: Some(identity.api_key_id),
            permissions: identity.permissions,
            rate_limit: identity.rate_limit,
            auth_method: "api_key".to_string(),
        };

        if let Some(redis) = &self.redis {
            match serde_json::to_string(&context) {
                Ok(serialized) => {
                    if let Err(e) =
                        cache::set_ex(redis, &cache_key, &serialized, self.config.cache_ttl_secs)
                            .await
                    {
                        tracing::warn!("Redis cache write failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Failed to serialize user context: {}", e),
            }
        }

        tracing::info!(
            user = context.email.as_deref().unwrap_or(&context.user_id),
            "API key validated"
        );

        Ok(context)
    }

    /// Cache key from the first characters of the key, never the secret
    fn cache_key(&self, api_key: &str) -> String {
        let prefix: String = api_key.chars().take(8).collect();
        format!("api_key:{}...", prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_sha256_hex() {
        let hash = ApiKeyValidator::hash_key("mcp_test_key");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Deterministic
        assert_eq!(hash, ApiKeyValidator::hash_key("mcp_test_key"));
        assert_ne!(hash, ApiKeyValidator::hash_key("mcp_other_key"));
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            ApiKeyValidator::hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
