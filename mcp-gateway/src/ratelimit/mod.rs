//! Multi-tier distributed rate limiting with tenant fairness and DDoS
//! quarantine
//!
//! Checks run in priority order and short-circuit on the first denial:
//! DDoS ban, global bucket, tenant fairness window + tenant bucket, user
//! bucket, IP bucket. Buckets live in Redis behind an atomic script; a cache
//! outage degrades to in-process buckets with identical semantics.

use deadpool_redis::Pool as RedisPool;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::TokenBucketScript;
use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::middleware::metrics::GatewayMetrics;

pub mod bucket;

use bucket::TokenBucket;

/// Redis key namespace for buckets
const KEY_PREFIX: &str = "rate_limit";

/// DDoS violation counters reset after this long
const DDOS_COUNTER_WINDOW: Duration = Duration::from_secs(3600);

/// Identity facets a request is limited on
#[derive(Debug, Clone, Default)]
pub struct RateIdentity {
    pub user_id: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub client_ip: Option<String>,
    pub role: String,
}

/// Per-role bucket parameters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoleLimits {
    pub rpm: u32,
    pub capacity: f64,
    pub refill_rate: f64,
}

/// Runtime-tunable tenant limit configuration
#[derive(Debug, Clone, Serialize)]
pub struct TenantRateConfig {
    pub base_rpm: u32,
    pub burst_capacity: f64,
    pub fairness_weight: f64,
}

/// Decision detail from a bucket check
#[derive(Debug, Clone)]
struct BucketDecision {
    allowed: bool,
    retry_after_secs: u64,
    tokens: f64,
    capacity: f64,
    fallback: bool,
}

/// Current limiter state for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub limits: RoleLimits,
    pub user: Option<BucketStatus>,
    pub tenant: Option<BucketStatus>,
    pub ip: Option<BucketStatus>,
    pub ddos: DdosStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub tokens_remaining: f64,
    pub capacity: f64,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DdosStatus {
    pub enabled: bool,
    pub banned_ip_count: usize,
    pub is_ip_banned: bool,
}

/// The advanced rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    script: Option<TokenBucketScript>,
    redis: Option<RedisPool>,
    metrics: Arc<GatewayMetrics>,

    fallback_buckets: Mutex<HashMap<String, TokenBucket>>,

    banned_ips: Mutex<HashMap<String, Instant>>,
    ddos_counters: Mutex<HashMap<String, (u32, Instant)>>,

    tenant_configs: Mutex<HashMap<Uuid, TenantRateConfig>>,
    fairness_windows: Mutex<HashMap<Uuid, VecDeque<f64>>>,

    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        redis: Option<RedisPool>,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        let script = redis
            .as_ref()
            .filter(|_| config.enable_distributed)
            .map(|pool| TokenBucketScript::new(pool.clone()));

        if script.is_none() {
            tracing::info!("Rate limiting will use in-process fallback buckets");
        }

        Arc::new(Self {
            config,
            script,
            redis,
            metrics,
            fallback_buckets: Mutex::new(HashMap::new()),
            banned_ips: Mutex::new(HashMap::new()),
            ddos_counters: Mutex::new(HashMap::new()),
            tenant_configs: Mutex::new(HashMap::new()),
            fairness_windows: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Check every applicable limit for this identity, short-circuiting on
    /// the first denial
    pub async fn check(&self, identity: &RateIdentity) -> Result<()> {
        // DDoS quarantine comes first
        if self.is_ip_banned(identity.client_ip.as_deref()) {
            self.record_hit(identity, "ddos_protection", "blocked");
            return Err(Error::RateLimited {
                description: "IP temporarily blocked due to suspicious activity".to_string(),
                limit_type: "ddos_protection".to_string(),
                retry_after_secs: self.config.ddos_ban_duration_seconds,
            });
        }

        let result = self.check_tiers(identity).await;

        if let Err(Error::RateLimited { limit_type, .. }) = &result {
            self.record_hit(identity, limit_type, "exceeded");
            self.bump_ddos_counter(identity.client_ip.as_deref());
        }

        result
    }

    async fn check_tiers(&self, identity: &RateIdentity) -> Result<()> {
        let role_limits = self.limits_for_role(&identity.role);

        // Global bucket
        let global_capacity = self.config.global_rpm as f64 * self.config.burst_factor;
        let global_refill = self.config.global_rpm as f64 / 60.0;
        let decision = self
            .check_bucket("global:all", global_capacity, global_refill)
            .await;
        if !decision.allowed {
            return Err(Error::RateLimited {
                description: format!(
                    "Global rate limit: {} requests per minute",
                    self.config.global_rpm
                ),
                limit_type: "global".to_string(),
                retry_after_secs: decision.retry_after_secs,
            });
        }

        // Tenant fairness window and tenant bucket
        if self.config.enable_per_tenant_limits {
            if let Some(tenant_id) = identity.tenant_id {
                self.check_tenant(tenant_id, &identity.role).await?;
            }
        }

        // Per-user bucket for authenticated callers
        if let Some(user_id) = &identity.user_id {
            let decision = self
                .check_bucket(
                    &format!("user:{}", user_id),
                    role_limits.capacity,
                    role_limits.refill_rate,
                )
                .await;
            if !decision.allowed {
                return Err(Error::RateLimited {
                    description: format!(
                        "User rate limit ({}): {} requests per minute",
                        identity.role, role_limits.rpm
                    ),
                    limit_type: "user".to_string(),
                    retry_after_secs: decision.retry_after_secs,
                });
            }
        }

        // Per-IP bucket, always at the anonymous tier
        if let Some(client_ip) = &identity.client_ip {
            let ip_limits = self.limits_for_role("anonymous");
            let decision = self
                .check_bucket(
                    &format!("ip:{}", client_ip),
                    ip_limits.capacity,
                    ip_limits.refill_rate,
                )
                .await;
            if !decision.allowed {
                return Err(Error::RateLimited {
                    description: format!(
                        "IP rate limit: {} requests per minute",
                        ip_limits.rpm
                    ),
                    limit_type: "ip".to_string(),
                    retry_after_secs: decision.retry_after_secs,
                });
            }
        }

        Ok(())
    }

    async fn check_tenant(&self, tenant_id: Uuid, role: &str) -> Result<()> {
        let tenant_config = self.tenant_config(tenant_id, role);

        self.check_tenant_fairness(tenant_id, &tenant_config)?;

        let refill_rate = tenant_config.base_rpm as f64 / 60.0;
        let decision = self
            .check_bucket(
                &format!("tenant_advanced:{}", tenant_id),
                tenant_config.burst_capacity,
                refill_rate,
            )
            .await;

        if !decision.allowed {
            return Err(Error::RateLimited {
                description: format!(
                    "Tenant {} rate limit: {} requests per minute",
                    tenant_id, tenant_config.base_rpm
                ),
                limit_type: "tenant_advanced".to_string(),
                retry_after_secs: decision.retry_after_secs,
            });
        }

        Ok(())
    }

    /// Sliding-window fairness across active tenants
    ///
    /// The tenant's fair share of the global window is its weight fraction;
    /// admission beyond `fair_share * burst_allowance_factor` is denied with
    /// a retry hint derived from the share.
    fn check_tenant_fairness(&self, tenant_id: Uuid, config: &TenantRateConfig) -> Result<()> {
        let now = epoch_secs();
        let window = self.config.fairness_window_seconds as f64;
        let window_start = now - window;

        let mut windows = self.fairness_windows.lock().expect("fairness lock");

        // Evict aged entries for this tenant
        let queue = windows.entry(tenant_id).or_default();
        while queue.front().is_some_and(|&ts| ts <= window_start) {
            queue.pop_front();
        }
        let tenant_usage = queue.len();

        let total_weight: f64 = {
            let configs = self.tenant_configs.lock().expect("tenant config lock");
            let sum: f64 = configs.values().map(|c| c.fairness_weight).sum();
            if sum > 0.0 {
                sum
            } else {
                1.0
            }
        };

        let fair_share_ratio = config.fairness_weight / total_weight;
        let global_window_limit = self.config.global_rpm as f64 * window / 60.0;
        let allocated_quota = (global_window_limit * fair_share_ratio).floor();
        let burst_allowance = (allocated_quota * self.config.burst_allowance_factor).floor();

        if tenant_usage as f64 >= burst_allowance {
            let retry_after = if allocated_quota > 0.0 {
                ((window / allocated_quota).floor() as u64).max(1)
            } else {
                60
            };

            return Err(Error::RateLimited {
                description: format!("Tenant {} fairness limit exceeded", tenant_id),
                limit_type: "tenant_advanced".to_string(),
                retry_after_secs: retry_after,
            });
        }

        windows.entry(tenant_id).or_default().push_back(now);
        Ok(())
    }

    /// Check one bucket: Redis when available, in-process fallback otherwise
    /// (and on any Redis failure)
    async fn check_bucket(&self, key: &str, capacity: f64, refill_rate: f64) -> BucketDecision {
        if let Some(script) = &self.script {
            let redis_key = format!("{}:{}", KEY_PREFIX, key);
            match script
                .consume(
                    &redis_key,
                    capacity,
                    refill_rate,
                    1.0,
                    epoch_secs(),
                    self.config.window_seconds,
                )
                .await
            {
                Ok(state) => {
                    return BucketDecision {
                        allowed: state.allowed,
                        retry_after_secs: retry_after(state.allowed, refill_rate),
                        tokens: state.tokens,
                        capacity: state.capacity,
                        fallback: false,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        "Redis rate limit check failed for {}: {}. Using fallback bucket.",
                        key,
                        e
                    );
                }
            }
        }

        self.check_fallback_bucket(key, capacity, refill_rate)
    }

    fn check_fallback_bucket(&self, key: &str, capacity: f64, refill_rate: f64) -> BucketDecision {
        let mut buckets = self.fallback_buckets.lock().expect("fallback bucket lock");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, refill_rate));

        let allowed = bucket.consume(1.0);

        let decision = BucketDecision {
            allowed,
            retry_after_secs: retry_after(allowed, refill_rate),
            tokens: bucket.tokens,
            capacity: bucket.capacity,
            fallback: true,
        };

        if !decision.allowed {
            tracing::debug!(
                key = %key,
                tokens = decision.tokens,
                capacity = decision.capacity,
                fallback = decision.fallback,
                "Rate limit bucket exhausted"
            );
        }

        decision
    }

    fn limits_for_role(&self, role: &str) -> RoleLimits {
        let rpm = self.config.rpm_for_role(role);
        RoleLimits {
            rpm,
            capacity: rpm as f64 * self.config.burst_factor,
            refill_rate: rpm as f64 / 60.0,
        }
    }

    fn tenant_config(&self, tenant_id: Uuid, role: &str) -> TenantRateConfig {
        let mut configs = self.tenant_configs.lock().expect("tenant config lock");
        configs
            .entry(tenant_id)
            .or_insert_with(|| {
                let base = self.limits_for_role(role);
                let base_rpm = (base.rpm as f64 * self.config.tenant_multiplier) as u32;
                TenantRateConfig {
                    base_rpm,
                    burst_capacity: base_rpm as f64 * self.config.burst_factor,
                    fairness_weight: 1.0,
                }
            })
            .clone()
    }

    // DDoS protection

    fn is_ip_banned(&self, client_ip: Option<&str>) -> bool {
        if !self.config.enable_ddos_protection {
            return false;
        }
        let Some(ip) = client_ip else {
            return false;
        };

        let banned = self.banned_ips.lock().expect("banned ip lock");
        banned.get(ip).is_some_and(|&until| Instant::now() < until)
    }

    fn bump_ddos_counter(&self, client_ip: Option<&str>) {
        if !self.config.enable_ddos_protection {
            return;
        }
        let Some(ip) = client_ip else {
            return;
        };

        let now = Instant::now();
        let count = {
            let mut counters = self.ddos_counters.lock().expect("ddos counter lock");
            let entry = counters.entry(ip.to_string()).or_insert((0, now));

            // Counter resets after an hour of quiet
            if now.duration_since(entry.1) > DDOS_COUNTER_WINDOW {
                entry.0 = 0;
            }
            entry.0 += 1;
            entry.1 = now;
            entry.0
        };

        if count >= self.config.ddos_threshold {
            let ban_duration = Duration::from_secs(self.config.ddos_ban_duration_seconds);
            self.banned_ips
                .lock()
                .expect("banned ip lock")
                .insert(ip.to_string(), now + ban_duration);

            tracing::warn!(
                "IP {} blocked for DDoS protection: {} rate limit violations",
                ip,
                count
            );
        }
    }

    fn record_hit(&self, identity: &RateIdentity, limit_type: &str, action: &str) {
        let user = identity.user_id.as_deref().unwrap_or("anonymous");
        let tenant = identity
            .tenant_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.metrics
            .record_rate_limit_hit(user, &tenant, limit_type, action);
    }

    // Administrative operations

    /// Configure tenant limits and fairness weight at runtime
    pub fn configure_tenant(
        &self,
        tenant_id: Uuid,
        base_rpm: Option<u32>,
        fairness_weight: Option<f64>,
        burst_factor: Option<f64>,
    ) {
        let mut configs = self.tenant_configs.lock().expect("tenant config lock");
        let entry = configs.entry(tenant_id).or_insert_with(|| TenantRateConfig {
            base_rpm: 100,
            burst_capacity: 200.0,
            fairness_weight: 1.0,
        });

        if let Some(rpm) = base_rpm {
            entry.base_rpm = rpm;
            entry.burst_capacity = rpm as f64 * burst_factor.unwrap_or(self.config.burst_factor);
        }
        if let Some(weight) = fairness_weight {
            entry.fairness_weight = weight;
        }

        tracing::info!(
            "Updated tenant rate configuration for {}: {:?}",
            tenant_id,
            entry
        );
    }

    /// Bucket utilization and DDoS state for the admin surface
    pub fn status(&self, identity: &RateIdentity) -> RateLimitStatus {
        let buckets = self.fallback_buckets.lock().expect("fallback bucket lock");

        let bucket_status = |key: String| {
            buckets.get(&key).map(|bucket| BucketStatus {
                tokens_remaining: bucket.tokens,
                capacity: bucket.capacity,
                utilization_percent: bucket.utilization_percent(),
            })
        };

        let banned = self.banned_ips.lock().expect("banned ip lock");
        let live_bans = banned
            .values()
            .filter(|&&until| Instant::now() < until)
            .count();

        RateLimitStatus {
            limits: self.limits_for_role(&identity.role),
            user: identity
                .user_id
                .as_ref()
                .and_then(|u| bucket_status(format!("user:{}", u))),
            tenant: identity
                .tenant_id
                .and_then(|t| bucket_status(format!("tenant_advanced:{}", t))),
            ip: identity
                .client_ip
                .as_ref()
                .and_then(|ip| bucket_status(format!("ip:{}", ip))),
            ddos: DdosStatus {
                enabled: self.config.enable_ddos_protection,
                banned_ip_count: live_bans,
                is_ip_banned: self.is_ip_banned(identity.client_ip.as_deref()),
            },
        }
    }

    /// Reset buckets and DDoS counters for the given entities
    pub async fn reset(
        &self,
        user_id: Option<&str>,
        tenant_id: Option<Uuid>,
        client_ip: Option<&str>,
    ) -> u32 {
        let mut reset_count = 0;

        let mut keys = Vec::new();
        if let Some(user) = user_id {
            keys.push(format!("user:{}", user));
        }
        if let Some(tenant) = tenant_id {
            keys.push(format!("tenant_advanced:{}", tenant));
            keys.push(format!("tenant:{}", tenant));
            self.fairness_windows
                .lock()
                .expect("fairness lock")
                .remove(&tenant);
        }
        if let Some(ip) = client_ip {
            keys.push(format!("ip:{}", ip));

            if self
                .banned_ips
                .lock()
                .expect("banned ip lock")
                .remove(ip)
                .is_some()
            {
                reset_count += 1;
            }
            if self
                .ddos_counters
                .lock()
                .expect("ddos counter lock")
                .remove(ip)
                .is_some()
            {
                reset_count += 1;
            }
        }

        {
            let mut buckets = self.fallback_buckets.lock().expect("fallback bucket lock");
            for key in &keys {
                if let Some(bucket) = buckets.get_mut(key) {
                    bucket.reset();
                    reset_count += 1;
                }
            }
        }

        if let Some(pool) = &self.redis {
            for key in &keys {
                let redis_key = format!("{}:{}", KEY_PREFIX, key);
                match crate::cache::del(pool, &redis_key).await {
                    Ok(()) => reset_count += 1,
                    Err(e) => {
                        tracing::warn!("Failed to reset Redis rate limit {}: {}", redis_key, e)
                    }
                }
            }
        }

        reset_count
    }

    /// Spawn the periodic cleanup loop; terminates on shutdown
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        let interval = limiter.config.cleanup_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => limiter.cleanup_stale_data(),
                }
            }
            tracing::debug!("Rate limit cleanup loop stopped");
        })
    }

    /// Evict stale buckets, expired bans and aged DDoS counters
    fn cleanup_stale_data(&self) {
        let stale_after = 2.0 * self.config.cleanup_interval_secs as f64;

        let buckets_cleaned = {
            let mut buckets = self.fallback_buckets.lock().expect("fallback bucket lock");
            let before = buckets.len();
            buckets.retain(|_, bucket| bucket.idle_secs() < stale_after);
            before - buckets.len()
        };

        let now = Instant::now();

        {
            let mut banned = self.banned_ips.lock().expect("banned ip lock");
            banned.retain(|_, &mut until| now < until);
        }

        let ddos_cleaned = {
            let mut counters = self.ddos_counters.lock().expect("ddos counter lock");
            let before = counters.len();
            counters.retain(|_, (_, ts)| now.duration_since(*ts) <= DDOS_COUNTER_WINDOW);
            before - counters.len()
        };

        if buckets_cleaned > 0 || ddos_cleaned > 0 {
            tracing::debug!(
                "Rate limit cleanup: {} buckets, {} DDoS counters",
                buckets_cleaned,
                ddos_cleaned
            );
        }
    }

    /// Stop the cleanup loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn retry_after(allowed: bool, refill_rate: f64) -> u64 {
    if allowed {
        0
    } else if refill_rate > 0.0 {
        ((1.0 / refill_rate).ceil() as u64).max(1)
    } else {
        60
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimitConfig) -> Arc<RateLimiter> {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        RateLimiter::new(config, None, metrics)
    }

    fn identity(user: Option<&str>, tenant: Option<Uuid>, ip: Option<&str>, role: &str) -> RateIdentity {
        RateIdentity {
            user_id: user.map(String::from),
            tenant_id: tenant,
            client_ip: ip.map(String::from),
            role: role.to_string(),
        }
    }

    #[tokio::test]
    async fn test_user_tier_denial() {
        let config = RateLimitConfig {
            anonymous_rpm: 2,
            burst_factor: 1.0,
            enable_per_tenant_limits: false,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let id = identity(Some("u1"), None, None, "anonymous");

        assert!(limiter.check(&id).await.is_ok());
        assert!(limiter.check(&id).await.is_ok());

        let err = limiter.check(&id).await.unwrap_err();
        match err {
            Error::RateLimited {
                limit_type,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit_type, "user");
                assert!(retry_after_secs > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_global_tier_denial() {
        let config = RateLimitConfig {
            global_rpm: 1,
            burst_factor: 1.0,
            enable_per_tenant_limits: false,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let id = identity(None, None, None, "anonymous");

        assert!(limiter.check(&id).await.is_ok());
        let err = limiter.check(&id).await.unwrap_err();
        match err {
            Error::RateLimited { limit_type, .. } => assert_eq!(limit_type, "global"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ip_tier_uses_anonymous_limits() {
        let config = RateLimitConfig {
            anonymous_rpm: 1,
            admin_rpm: 1000,
            burst_factor: 1.0,
            enable_per_tenant_limits: false,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        // Admin role but IP tier still applies anonymous limits
        let id = identity(None, None, Some("10.0.0.9"), "admin");

        assert!(limiter.check(&id).await.is_ok());
        let err = limiter.check(&id).await.unwrap_err();
        match err {
            Error::RateLimited { limit_type, .. } => assert_eq!(limit_type, "ip"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tenant_fairness_denial() {
        // Single tenant with weight 1.0 gets the whole global window.
        // global_rpm=6, window=60s -> allocated 6, burst 1.0 -> denial at 6.
        let config = RateLimitConfig {
            global_rpm: 6,
            user_rpm: 1000,
            anonymous_rpm: 1000,
            burst_factor: 100.0,
            tenant_multiplier: 100.0,
            fairness_window_seconds: 60,
            burst_allowance_factor: 1.0,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let tenant = Uuid::new_v4();
        let id = identity(Some("u1"), Some(tenant), None, "user");

        for _ in 0..6 {
            limiter.check(&id).await.unwrap();
        }

        let err = limiter.check(&id).await.unwrap_err();
        match err {
            Error::RateLimited {
                limit_type,
                retry_after_secs,
                ..
            } => {
                assert_eq!(limit_type, "tenant_advanced");
                assert!(retry_after_secs > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fairness_isolates_tenants() {
        // Two tenants with equal weights: one tenant hitting its share does
        // not affect the other.
        let config = RateLimitConfig {
            global_rpm: 12,
            user_rpm: 1000,
            anonymous_rpm: 1000,
            burst_factor: 100.0,
            tenant_multiplier: 100.0,
            fairness_window_seconds: 60,
            burst_allowance_factor: 1.0,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        // Materialize both tenant configs so shares settle at 50% each
        limiter.configure_tenant(tenant_a, None, Some(1.0), None);
        limiter.configure_tenant(tenant_b, None, Some(1.0), None);

        let id_a = identity(Some("a"), Some(tenant_a), None, "user");
        let id_b = identity(Some("b"), Some(tenant_b), None, "user");

        // A's fair share is 6 in the window; drive it to denial
        for _ in 0..6 {
            limiter.check(&id_a).await.unwrap();
        }
        assert!(limiter.check(&id_a).await.is_err());

        // B is unaffected
        assert!(limiter.check(&id_b).await.is_ok());
    }

    #[tokio::test]
    async fn test_ddos_ban_after_violations() {
        let config = RateLimitConfig {
            anonymous_rpm: 1,
            burst_factor: 1.0,
            ddos_threshold: 3,
            enable_per_tenant_limits: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let id = identity(None, None, Some("10.0.0.66"), "anonymous");

        // First request passes; subsequent ones violate the IP tier
        assert!(limiter.check(&id).await.is_ok());
        for _ in 0..3 {
            assert!(limiter.check(&id).await.is_err());
        }

        // The ban now takes effect before any bucket is consulted
        let err = limiter.check(&id).await.unwrap_err();
        match err {
            Error::RateLimited { limit_type, .. } => {
                assert_eq!(limit_type, "ddos_protection")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_user_bucket() {
        let config = RateLimitConfig {
            user_rpm: 1,
            burst_factor: 1.0,
            enable_per_tenant_limits: false,
            enable_ddos_protection: false,
            ..Default::default()
        };
        let limiter = limiter(config);
        let id = identity(Some("u9"), None, None, "user");

        assert!(limiter.check(&id).await.is_ok());
        assert!(limiter.check(&id).await.is_err());

        let status = limiter.status(&id);
        assert!(status.user.as_ref().unwrap().utilization_percent > 0.0);

        let reset = limiter.reset(Some("u9"), None, None).await;
        assert!(reset >= 1);

        let status = limiter.status(&id);
        assert_eq!(status.user.unwrap().utilization_percent, 0.0);

        assert!(limiter.check(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_reports_role_limits() {
        let limiter = limiter(RateLimitConfig::default());
        let id = identity(Some("u1"), None, None, "admin");
        let status = limiter.status(&id);
        assert_eq!(status.limits.rpm, 1000);
        assert!(!status.ddos.is_ip_banned);
    }
}
