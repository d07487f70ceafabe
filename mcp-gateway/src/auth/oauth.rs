//! OAuth bearer validation against the external identity provider
//!
//! Tokens are RS256 JWTs signed by the provider; signing keys come from the
//! tenant's JWKS endpoint and are cached by `kid`. The provider does not
//! support dynamic client registration, so the registered client id/secret
//! pair is configured statically, PKCE parameters are forwarded, and the
//! token endpoint uses `client_secret_post`.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::OAuthConfig;
use crate::error::{Error, Result};

use super::UserContext;

/// JWKS responses are cached this long before a refetch is allowed
const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Claims expected in provider-issued access tokens
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderClaims {
    pub sub: String,

    #[serde(default)]
    pub tid: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub preferred_username: Option<String>,

    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwksKey>,
}

#[derive(Debug, Deserialize)]
struct JwksKey {
    kid: String,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Validates provider JWTs using the tenant's JWKS
pub struct OAuthValidator {
    config: OAuthConfig,
    http: reqwest::Client,
    cache: RwLock<KeyCache>,
}

impl OAuthValidator {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build OAuth HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            cache: RwLock::new(KeyCache {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Validate a bearer token and map its claims to a user context
    pub async fn validate(&self, token: &str) -> Result<UserContext> {
        let (context, _) = self.validate_detailed(token).await?;
        Ok(context)
    }

    /// Validate a bearer token, returning the context and the token expiry
    /// (for refresh scheduling)
    pub async fn validate_detailed(
        &self,
        token: &str,
    ) -> Result<(UserContext, chrono::DateTime<chrono::Utc>)> {
        let header = decode_header(token)
            .map_err(|e| Error::Unauthorized(format!("Malformed token: {}", e)))?;

        if header.alg != Algorithm::RS256 {
            return Err(Error::Unauthorized(format!(
                "Unsupported token algorithm: {:?}",
                header.alg
            )));
        }

        let kid = header
            .kid
            .ok_or_else(|| Error::Unauthorized("Token missing key id".to_string()))?;

        let key = self.signing_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer()]);
        validation.set_audience(&[self.config.client_id.clone()]);

        let data = decode::<ProviderClaims>(token, &key, &validation)
            .map_err(|e| Error::Unauthorized(format!("Token validation failed: {}", e)))?;

        let expires_at = chrono::DateTime::from_timestamp(data.claims.exp, 0)
            .unwrap_or_else(chrono::Utc::now);

        Ok((claims_to_context(data.claims), expires_at))
    }

    /// Fetch the decoding key for `kid`, refreshing the JWKS if needed
    async fn signing_key(&self, kid: &str) -> Result<DecodingKey> {
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // A concurrent task may have refreshed while we waited for the lock
        if let Some(key) = cache.keys.get(kid) {
            return Ok(key.clone());
        }

        let recently_fetched = cache
            .fetched_at
            .is_some_and(|at| at.elapsed() < JWKS_REFRESH_INTERVAL);
        if recently_fetched {
            return Err(Error::Unauthorized(format!(
                "Unknown token signing key: {}",
                kid
            )));
        }

        let document: JwksDocument = self
            .http
            .get(self.config.jwks_uri())
            .send()
            .await
            .map_err(|e| Error::External(format!("JWKS fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::External(format!("Invalid JWKS document: {}", e)))?;

        cache.keys.clear();
        for key in document.keys {
            if key.kty != "RSA" {
                continue;
            }
            let (Some(n), Some(e)) = (key.n, key.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(decoded) => {
                    cache.keys.insert(key.kid, decoded);
                }
                Err(err) => {
                    tracing::warn!("Skipping malformed JWKS key {}: {}", key.kid, err);
                }
            }
        }
        cache.fetched_at = Some(Instant::now());

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| Error::Unauthorized(format!("Unknown token signing key: {}", kid)))
    }
}

/// Map provider claims to the gateway's user context
pub fn claims_to_context(claims: ProviderClaims) -> UserContext {
    let role = claims
        .roles
        .first()
        .cloned()
        .unwrap_or_else(|| "user".to_string());

    UserContext {
        user_id: claims.sub,
        email: claims.email.or(claims.preferred_username),
        name: None,
        role,
        roles: claims.roles,
        tenant_id: claims.tid.and_then(|t| Uuid::parse_str(&t).ok()),
        api_key_id: None,
        permissions: Vec::new(),
        rate_limit: None,
        auth_method: "oauth".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(roles: Vec<&str>, tid: Option<&str>) -> ProviderClaims {
        ProviderClaims {
            sub: "user-123".to_string(),
            tid: tid.map(String::from),
            roles: roles.into_iter().map(String::from).collect(),
            email: Some("user@example.com".to_string()),
            preferred_username: None,
            exp: 2_000_000_000,
        }
    }

    #[test]
    fn test_claims_mapping() {
        let tenant = Uuid::new_v4();
        let context = claims_to_context(claims(vec!["admin", "user"], Some(&tenant.to_string())));

        assert_eq!(context.user_id, "user-123");
        assert_eq!(context.role, "admin");
        assert!(context.has_role("user"));
        assert_eq!(context.tenant_id, Some(tenant));
        assert_eq!(context.auth_method, "oauth");
    }

    #[test]
    fn test_claims_default_role() {
        let context = claims_to_context(claims(vec![], None));
        assert_eq!(context.role, "user");
        assert_eq!(context.tenant_id, None);
    }

    #[test]
    fn test_non_uuid_tenant_claim_is_dropped() {
        let context = claims_to_context(claims(vec!["user"], Some("not-a-uuid")));
        assert_eq!(context.tenant_id, None);
    }

    #[test]
    fn test_email_falls_back_to_preferred_username() {
        let mut c = claims(vec![], None);
        c.email = None;
        c.preferred_username = Some("alias@example.com".to_string());
        let context = claims_to_context(c);
        assert_eq!(context.email.as_deref(), Some("alias@example.com"));
    }
}
