//! Application state: every service the handlers touch, constructed once at
//! startup and disposed in reverse order at shutdown

use deadpool_redis::Pool as RedisPool;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    ApiKeyValidator, OAuthValidator, ToolAccessPolicy, TokenRefreshService,
};
use crate::config::Config;
use crate::error::Result;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::trace::TraceStore;
use crate::proxy::ProxyService;
use crate::ratelimit::RateLimiter;
use crate::registry::RegistryService;
use crate::routing::Router;
use crate::{cache, db};

/// Shared application state
///
/// Cloning is cheap: every field is an `Arc` or an internally-shared pool.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: PgPool,
    pub redis: Option<RedisPool>,

    pub registry: Arc<RegistryService>,
    pub router: Arc<Router>,
    pub proxy: Arc<ProxyService>,
    pub rate_limiter: Arc<RateLimiter>,

    pub api_keys: ApiKeyValidator,
    pub oauth: Option<Arc<OAuthValidator>>,
    pub token_refresh: Option<Arc<TokenRefreshService>>,
    pub tool_policy: Arc<ToolAccessPolicy>,

    pub metrics: Arc<GatewayMetrics>,
    pub traces: Arc<TraceStore>,

    housekeeping: Arc<Housekeeping>,
}

struct Housekeeping {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Connect stores, build services, restore probes, start housekeeping
    pub async fn initialize(config: Config) -> Result<Self> {
        let metrics = Arc::new(GatewayMetrics::new()?);

        let pool = db::create_pool(&config.database).await?;

        let redis = match cache::create_pool(&config.redis).await {
            Ok(pool) => Some(pool),
            Err(e) if config.redis.optional => {
                tracing::warn!(
                    "Optional Redis connection failed: {}. Rate limiting degrades to in-process buckets.",
                    e
                );
                None
            }
            Err(e) => return Err(e),
        };

        let registry = RegistryService::new(pool.clone(), config.registry.clone())?;

        let candidate_source: Arc<dyn crate::routing::CandidateSource> = registry.clone();
        let router = Arc::new(Router::new(config.router.clone(), candidate_source));

        let proxy = Arc::new(ProxyService::new(
            config.proxy.clone(),
            Arc::clone(&router),
            pool.clone(),
            Arc::clone(&metrics),
        ));

        let rate_limiter = RateLimiter::new(
            config.rate_limit.clone(),
            redis.clone(),
            Arc::clone(&metrics),
        );

        let api_key_config = config
            .auth
            .as_ref()
            .map(|auth| auth.api_key.clone())
            .unwrap_or_default();
        let api_keys = ApiKeyValidator::new(pool.clone(), redis.clone(), api_key_config);

        let oauth_config = config.auth.as_ref().and_then(|auth| auth.oauth.clone());
        let oauth = match &oauth_config {
            Some(oauth_config) => Some(Arc::new(OAuthValidator::new(oauth_config.clone())?)),
            None => {
                tracing::info!("OAuth not configured; bearer auth accepts API keys only");
                None
            }
        };

        let token_refresh = match oauth_config {
            Some(oauth_config) if oauth_config.enable_token_refresh => Some(
                TokenRefreshService::new(oauth_config, redis.clone(), Arc::clone(&metrics))?,
            ),
            _ => None,
        };

        let housekeeping = Arc::new(Housekeeping {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // Re-launch a probe per persisted server
        registry.restore().await?;

        // Housekeeping loops
        {
            let mut tasks = housekeeping.tasks.lock().expect("housekeeping lock");
            tasks.push(router.spawn_cleanup(housekeeping.cancel.child_token()));
            tasks.push(rate_limiter.spawn_cleanup());
        }

        tracing::info!("Application state initialized");

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            redis,
            registry,
            router,
            proxy,
            rate_limiter,
            api_keys,
            oauth,
            token_refresh,
            tool_policy: Arc::new(ToolAccessPolicy::default()),
            metrics,
            traces: Arc::new(TraceStore::new()),
            housekeeping,
        })
    }

    /// Ordered teardown: cancel probes and housekeeping, drain actives
    /// within the grace period, dispose clients, close pools
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application state");

        self.registry.shutdown().await;

        self.housekeeping.cancel.cancel();
        self.rate_limiter.shutdown();
        if let Some(refresh) = &self.token_refresh {
            refresh.shutdown();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.housekeeping.tasks.lock().expect("housekeeping lock");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        self.drain_active_requests().await;

        self.proxy.shutdown();
        self.db.close().await;

        tracing::info!("Application state shutdown complete");
    }

    /// Wait for in-flight proxied requests, bounded by the grace period
    async fn drain_active_requests(&self) {
        let grace = Duration::from_secs(self.config.service.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let active = self.proxy.active_requests().len();
            if active == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Shutdown grace period elapsed with {} requests still active",
                    active
                );
                return;
            }

            tracing::info!("Draining {} active requests...", active);
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}
