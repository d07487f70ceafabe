//! Background OAuth token refresh
//!
//! One monitoring task per OAuth session refreshes the access token against
//! the provider's token endpoint shortly before expiry. Refreshed tokens are
//! stored in the cache store; permanent failure flags the session so the
//! next request forces re-authentication.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deadpool_redis::Pool as RedisPool;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache;
use crate::config::OAuthConfig;
use crate::error::{Error, Result};
use crate::middleware::metrics::GatewayMetrics;

/// Retry attempts per refresh before the session is flagged
const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Base delay between refresh retries
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Refreshes OAuth sessions near expiry
pub struct TokenRefreshService {
    config: OAuthConfig,
    redis: Option<RedisPool>,
    http: reqwest::Client,
    metrics: Arc<GatewayMetrics>,
    monitors: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl TokenRefreshService {
    pub fn new(
        config: OAuthConfig,
        redis: Option<RedisPool>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build refresh HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            config,
            redis,
            http,
            metrics,
            monitors: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Start monitoring one user's session; replaces any existing monitor
    pub fn start_monitoring(self: &Arc<Self>, user_id: &str, expires_at: DateTime<Utc>) {
        if !self.config.enable_token_refresh {
            return;
        }

        self.cancel_monitoring(user_id);

        let cancel = self.shutdown.child_token();
        self.monitors.insert(user_id.to_string(), cancel.clone());

        let service = Arc::clone(self);
        let user = user_id.to_string();

        tokio::spawn(async move {
            service.monitor_session(&user, expires_at, cancel).await;
            service.monitors.remove(&user);
        });
    }

    /// Stop monitoring one user's session
    pub fn cancel_monitoring(&self, user_id: &str) {
        if let Some((_, token)) = self.monitors.remove(user_id) {
            token.cancel();
        }
    }

    /// Cancel every monitor
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.monitors.clear();
        tracing::info!("Token refresh service shutdown");
    }

    async fn monitor_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        let margin = chrono::Duration::seconds(self.config.refresh_margin_secs as i64);
        let refresh_at = expires_at - margin;
        let wait = (refresh_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tracing::debug!(
            user_id = %user_id,
            wait_secs = wait.as_secs(),
            "Scheduling token refresh"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        match self.refresh_with_retry(user_id, &cancel).await {
            Ok(()) => {
                self.metrics.token_refresh.with_label_values(&[user_id, "success"]).inc();
            }
            Err(e) => {
                tracing::warn!("Token refresh failed permanently for {}: {}", user_id, e);
                self.metrics.token_refresh.with_label_values(&[user_id, "failure"]).inc();
                self.flag_reauth_required(user_id).await;
            }
        }
    }

    async fn refresh_with_retry(&self, user_id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut last_error = Error::Internal("No refresh attempts made".to_string());

        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::Internal("Refresh cancelled".to_string()));
            }

            match self.refresh_once(user_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "Token refresh attempt {} failed for {}: {}",
                        attempt + 1,
                        user_id,
                        e
                    );
                    last_error = e;
                }
            }

            let delay = RETRY_BASE_DELAY * 2_u32.pow(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Internal("Refresh cancelled".to_string())),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(last_error)
    }

    /// Exchange the stored refresh token at the provider's token endpoint
    ///
    /// The provider requires `client_secret_post`: credentials go in the
    /// form body, not a basic-auth header.
    async fn refresh_once(&self, user_id: &str) -> Result<()> {
        let redis = self
            .redis
            .as_ref()
            .ok_or_else(|| Error::Cache("Cache store unavailable".to_string()))?;

        let refresh_token = cache::get(redis, &format!("refresh_token:{}", user_id))
            .await?
            .ok_or_else(|| Error::Unauthorized("No refresh token stored".to_string()))?;

        let scopes = self.config.scopes.join(" ");
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scopes.as_str()),
        ];

        let response = self
            .http
            .post(self.config.token_endpoint())
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::External(format!("Token endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "Token refresh rejected: HTTP {} {}",
                status, body
            )));
        }

        let tokens: TokenEndpointResponse = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Invalid token response: {}", e)))?;

        let ttl = tokens.expires_in.unwrap_or(3600);
        cache::set_ex(
            redis,
            &format!("access_token:{}", user_id),
            &tokens.access_token,
            ttl,
        )
        .await?;

        if let Some(new_refresh) = tokens.refresh_token {
            cache::set_ex(
                redis,
                &format!("refresh_token:{}", user_id),
                &new_refresh,
                86_400 * 30,
            )
            .await?;
        }

        tracing::info!(user_id = %user_id, "Access token refreshed");
        Ok(())
    }

    /// Mark the session as requiring interactive re-authentication
    async fn flag_reauth_required(&self, user_id: &str) {
        let Some(redis) = &self.redis else {
            return;
        };

        if let Err(e) = cache::set_ex(redis, &format!("auth_required:{}", user_id), "1", 86_400).await
        {
            tracing::warn!("Failed to flag re-auth for {}: {}", user_id, e);
        }
    }

    /// Number of sessions currently monitored
    pub fn monitored_sessions(&self) -> usize {
        self.monitors.len()
    }
}
