//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: MCPGW_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/mcp-gateway/config.toml
//! 4. System directory: /etc/mcp-gateway/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::routing::RoutePolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    pub redis: RedisConfig,

    /// Registry and health-probe configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Authentication configuration (optional; anonymous-only when absent)
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Grace period for draining active requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Test connections on checkout
    #[serde(default = "default_true")]
    pub test_before_acquire: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether Redis is optional (service can start without it; rate
    /// limiting degrades to in-process buckets)
    #[serde(default = "default_true")]
    pub optional: bool,
}

/// Registry and health-probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between health probes per server (seconds)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Per-probe timeout (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for capability auto-discovery calls (seconds)
    #[serde(default = "default_probe_timeout")]
    pub discovery_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            discovery_timeout_secs: default_probe_timeout(),
        }
    }
}

impl RegistryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Load balancing policy
    #[serde(default)]
    pub policy: RoutePolicy,

    /// Enable circuit breaking
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a half-open attempt (seconds)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,

    /// Consecutive half-open successes before the circuit closes
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Interval of the stale-metrics sweep (seconds)
    #[serde(default = "default_router_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: RoutePolicy::default(),
            circuit_breaker_enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
            cleanup_interval_secs: default_router_cleanup_interval(),
        }
    }
}

impl RouterConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Default forward timeout (seconds)
    #[serde(default = "default_proxy_timeout")]
    pub default_timeout_secs: f64,

    /// Upper bound a client may request as timeout (seconds)
    #[serde(default = "default_proxy_max_timeout")]
    pub max_timeout_secs: f64,

    /// Max pooled connections per back-end server
    #[serde(default = "default_proxy_max_connections")]
    pub max_connections_per_server: usize,

    /// Max idle keep-alive connections per back-end server
    #[serde(default = "default_proxy_keepalive")]
    pub max_keepalive_per_server: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_proxy_timeout(),
            max_timeout_secs: default_proxy_max_timeout(),
            max_connections_per_server: default_proxy_max_connections(),
            max_keepalive_per_server: default_proxy_keepalive(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Use Redis-backed distributed buckets (in-process fallback otherwise)
    #[serde(default = "default_true")]
    pub enable_distributed: bool,

    /// Enable per-tenant limits and the fairness window
    #[serde(default = "default_true")]
    pub enable_per_tenant_limits: bool,

    /// Enable DDoS quarantine
    #[serde(default = "default_true")]
    pub enable_ddos_protection: bool,

    /// Global requests per minute across all callers
    #[serde(default = "default_global_rpm")]
    pub global_rpm: u32,

    /// Role-tier requests per minute
    #[serde(default = "default_admin_rpm")]
    pub admin_rpm: u32,
    #[serde(default = "default_server_owner_rpm")]
    pub server_owner_rpm: u32,
    #[serde(default = "default_user_rpm")]
    pub user_rpm: u32,
    #[serde(default = "default_anonymous_rpm")]
    pub anonymous_rpm: u32,

    /// Burst capacity factor applied to every bucket
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,

    /// Tenant limit multiplier over the role base
    #[serde(default = "default_tenant_multiplier")]
    pub tenant_multiplier: f64,

    /// Token bucket window (seconds); Redis keys expire at twice this
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,

    /// Sliding fairness window (seconds)
    #[serde(default = "default_fairness_window")]
    pub fairness_window_seconds: u64,

    /// Burst allowance factor over the tenant fair share
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance_factor: f64,

    /// Rate-limit violations per hour before an IP is banned
    #[serde(default = "default_ddos_threshold")]
    pub ddos_threshold: u32,

    /// Ban duration for quarantined IPs (seconds)
    #[serde(default = "default_ddos_ban_duration")]
    pub ddos_ban_duration_seconds: u64,

    /// Interval of the stale-bucket cleanup loop (seconds)
    #[serde(default = "default_ratelimit_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enable_distributed: true,
            enable_per_tenant_limits: true,
            enable_ddos_protection: true,
            global_rpm: default_global_rpm(),
            admin_rpm: default_admin_rpm(),
            server_owner_rpm: default_server_owner_rpm(),
            user_rpm: default_user_rpm(),
            anonymous_rpm: default_anonymous_rpm(),
            burst_factor: default_burst_factor(),
            tenant_multiplier: default_tenant_multiplier(),
            window_seconds: default_rate_window(),
            fairness_window_seconds: default_fairness_window(),
            burst_allowance_factor: default_burst_allowance(),
            ddos_threshold: default_ddos_threshold(),
            ddos_ban_duration_seconds: default_ddos_ban_duration(),
            cleanup_interval_secs: default_ratelimit_cleanup_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Requests per minute for a role tier
    pub fn rpm_for_role(&self, role: &str) -> u32 {
        match role {
            "admin" => self.admin_rpm,
            "server_owner" => self.server_owner_rpm,
            "user" | "service" | "readonly" => self.user_rpm,
            _ => self.anonymous_rpm,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// OAuth identity provider (optional; API keys work without it)
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,

    /// API-key validation settings
    #[serde(default)]
    pub api_key: ApiKeyConfig,
}

/// OAuth provider configuration for the external identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Provider tenant id
    pub tenant_id: String,

    /// Registered application (client) id; also the expected JWT audience
    pub client_id: String,

    /// Client secret for the token endpoint
    pub client_secret: String,

    /// Public callback URL of this gateway
    #[serde(default = "default_oauth_callback")]
    pub callback_url: String,

    /// Scopes requested from the provider
    #[serde(default = "default_oauth_scopes")]
    pub scopes: Vec<String>,

    /// Forward PKCE parameters to the provider
    #[serde(default = "default_true")]
    pub forward_pkce: bool,

    /// Token endpoint auth method; the provider requires client_secret_post
    #[serde(default = "default_token_auth_method")]
    pub token_endpoint_auth_method: String,

    /// Enable the background token refresh loop
    #[serde(default = "default_true")]
    pub enable_token_refresh: bool,

    /// Refresh tokens this close to expiry (seconds)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl OAuthConfig {
    /// Provider authority base URL for this tenant
    pub fn authority(&self) -> String {
        format!("https://login.microsoftonline.com/{}", self.tenant_id)
    }

    /// JWKS URI used to fetch RS256 signing keys
    pub fn jwks_uri(&self) -> String {
        format!("{}/discovery/v2.0/keys", self.authority())
    }

    /// Expected token issuer
    pub fn issuer(&self) -> String {
        format!("{}/v2.0", self.authority())
    }

    /// Authorization endpoint
    pub fn authorization_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority())
    }

    /// Token endpoint
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority())
    }
}

/// API-key validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Recognized key prefix on bearer tokens
    #[serde(default = "default_api_key_prefix")]
    pub prefix: String,

    /// TTL for cached valid keys (seconds)
    #[serde(default = "default_api_key_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// TTL for cached invalid keys (seconds)
    #[serde(default = "default_api_key_negative_ttl")]
    pub negative_cache_ttl_secs: u64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: default_api_key_prefix(),
            cache_ttl_secs: default_api_key_cache_ttl(),
            negative_cache_ttl_secs: default_api_key_negative_ttl(),
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_db_max_connections() -> u32 {
    50
}

fn default_db_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    20
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

fn default_router_cleanup_interval() -> u64 {
    300
}

fn default_proxy_timeout() -> f64 {
    30.0
}

fn default_proxy_max_timeout() -> f64 {
    300.0
}

fn default_proxy_max_connections() -> usize {
    50
}

fn default_proxy_keepalive() -> usize {
    10
}

fn default_global_rpm() -> u32 {
    10_000
}

fn default_admin_rpm() -> u32 {
    1000
}

fn default_server_owner_rpm() -> u32 {
    500
}

fn default_user_rpm() -> u32 {
    100
}

fn default_anonymous_rpm() -> u32 {
    20
}

fn default_burst_factor() -> f64 {
    2.0
}

fn default_tenant_multiplier() -> f64 {
    10.0
}

fn default_rate_window() -> u64 {
    60
}

fn default_fairness_window() -> u64 {
    300
}

fn default_burst_allowance() -> f64 {
    1.5
}

fn default_ddos_threshold() -> u32 {
    1000
}

fn default_ddos_ban_duration() -> u64 {
    3600
}

fn default_ratelimit_cleanup_interval() -> u64 {
    300
}

fn default_oauth_callback() -> String {
    "http://localhost:8000/auth/callback".to_string()
}

fn default_oauth_scopes() -> Vec<String> {
    vec![
        "User.Read".to_string(),
        "email".to_string(),
        "openid".to_string(),
        "profile".to_string(),
    ]
}

fn default_token_auth_method() -> String {
    "client_secret_post".to_string()
}

fn default_refresh_margin() -> u64 {
    300
}

fn default_api_key_prefix() -> String {
    "mcp_".to_string()
}

fn default_api_key_cache_ttl() -> u64 {
    300
}

fn default_api_key_negative_ttl() -> u64 {
    60
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found wins):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/mcp-gateway/config.toml
    /// 3. System directory: /etc/mcp-gateway/config.toml
    ///
    /// Environment variables (MCPGW_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Merge config files in reverse order (lowest priority first)
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("MCPGW_").split("_"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the XDG search path; useful for tests and non-standard
    /// deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MCPGW_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("mcp-gateway");
        if let Ok(path) = xdg_dirs.place_config_file("config.toml") {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/mcp-gateway/config.toml"));

        paths
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "mcp-gateway".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                environment: default_environment(),
                shutdown_grace_secs: default_shutdown_grace(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost:5432/mcp_gateway".to_string(),
                max_connections: default_db_max_connections(),
                min_connections: default_db_min_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
                test_before_acquire: true,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                max_connections: default_redis_max_connections(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
                optional: true,
            },
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
            proxy: ProxyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            auth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8000);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.rate_limit.user_rpm, 100);
        assert_eq!(config.rate_limit.anonymous_rpm, 20);
        assert_eq!(config.router.failure_threshold, 5);
        assert_eq!(config.registry.probe_interval_secs, 30);
    }

    #[test]
    fn test_role_tier_lookup() {
        let config = RateLimitConfig::default();
        assert_eq!(config.rpm_for_role("admin"), 1000);
        assert_eq!(config.rpm_for_role("server_owner"), 500);
        assert_eq!(config.rpm_for_role("user"), 100);
        assert_eq!(config.rpm_for_role("anonymous"), 20);
        assert_eq!(config.rpm_for_role("something-else"), 20);
    }

    #[test]
    fn test_oauth_endpoint_derivation() {
        let oauth = OAuthConfig {
            tenant_id: "tid-123".to_string(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            callback_url: default_oauth_callback(),
            scopes: default_oauth_scopes(),
            forward_pkce: true,
            token_endpoint_auth_method: default_token_auth_method(),
            enable_token_refresh: true,
            refresh_margin_secs: 300,
        };

        assert!(oauth.jwks_uri().contains("tid-123"));
        assert!(oauth.jwks_uri().ends_with("/discovery/v2.0/keys"));
        assert!(oauth.issuer().ends_with("/v2.0"));
        assert!(oauth.token_endpoint().ends_with("/oauth2/v2.0/token"));
    }

    #[test]
    fn test_config_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[service]
name = "gateway-under-test"
port = 9100

[database]
url = "postgres://db/test"

[redis]
url = "redis://cache:6379"

[rate_limit]
global_rpm = 600
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "gateway-under-test");
        assert_eq!(config.service.port, 9100);
        assert_eq!(config.rate_limit.global_rpm, 600);
        // Untouched sections keep defaults
        assert_eq!(config.rate_limit.burst_factor, 2.0);
    }
}
