//! Redis connection pool management and the atomic token-bucket script

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use redis::Script;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Lua script implementing the token-bucket update as a single
/// non-interleaving step. Two concurrent callers can never both consume the
/// last token.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local tokens_requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local window_seconds = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local current_tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill)
local tokens_to_add = elapsed * refill_rate
current_tokens = math.min(capacity, current_tokens + tokens_to_add)

local success = current_tokens >= tokens_requested
if success then
    current_tokens = current_tokens - tokens_requested
end

redis.call('HMSET', key,
    'tokens', current_tokens,
    'last_refill', now,
    'capacity', capacity,
    'refill_rate', refill_rate
)
redis.call('EXPIRE', key, window_seconds * 2)

return {
    success and 1 or 0,
    tostring(current_tokens),
    tostring(capacity),
    tostring(refill_rate),
    tostring(now - last_refill)
}
"#;

/// Result of an atomic bucket evaluation
#[derive(Debug, Clone)]
pub struct BucketState {
    pub allowed: bool,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub elapsed: f64,
}

/// Create a Redis connection pool with retry logic
///
/// Uses exponential backoff between attempts.
pub(crate) async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));

                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| Error::Cache(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Cache(format!("Failed to create Redis pool: {}", e)))?;

    // Test the connection
    let conn = pool
        .get()
        .await
        .map_err(|e| Error::Cache(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

/// Handle on the atomic token-bucket evaluator
#[derive(Clone)]
pub struct TokenBucketScript {
    pool: Pool,
    script: Script,
}

impl TokenBucketScript {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    /// Atomically refill and consume `requested` tokens from `key`
    pub async fn consume(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        requested: f64,
        now: f64,
        window_seconds: u64,
    ) -> Result<BucketState> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Cache(format!("Failed to get Redis connection: {}", e)))?;

        let (allowed, tokens, capacity, refill_rate, elapsed): (i64, String, String, String, String) =
            self.script
                .key(key)
                .arg(capacity)
                .arg(refill_rate)
                .arg(requested)
                .arg(now)
                .arg(window_seconds)
                .invoke_async(&mut *conn)
                .await?;

        Ok(BucketState {
            allowed: allowed == 1,
            tokens: tokens.parse().unwrap_or(0.0),
            capacity: capacity.parse().unwrap_or(0.0),
            refill_rate: refill_rate.parse().unwrap_or(0.0),
            elapsed: elapsed.parse().unwrap_or(0.0),
        })
    }
}

/// Read a string value
pub async fn get(pool: &Pool, key: &str) -> Result<Option<String>> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Cache(format!("Failed to get Redis connection: {}", e)))?;

    let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
    Ok(value)
}

/// Write a string value with a TTL
pub async fn set_ex(pool: &Pool, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Cache(format!("Failed to get Redis connection: {}", e)))?;

    let _: () = redis::cmd("SETEX")
        .arg(key)
        .arg(ttl_secs as i64)
        .arg(value)
        .query_async(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a key
pub async fn del(pool: &Pool, key: &str) -> Result<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| Error::Cache(format!("Failed to get Redis connection: {}", e)))?;

    let _: () = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::RedisConfig;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 20,
            max_retries: 5,
            retry_delay_secs: 2,
            optional: true,
        };

        assert_eq!(config.max_connections, 20);
        assert!(config.optional);
    }

    #[test]
    fn test_bucket_script_mentions_all_fields() {
        // The script contract returns (success, tokens, capacity, refill_rate, elapsed)
        assert!(super::TOKEN_BUCKET_SCRIPT.contains("HMGET"));
        assert!(super::TOKEN_BUCKET_SCRIPT.contains("last_refill"));
        assert!(super::TOKEN_BUCKET_SCRIPT.contains("EXPIRE"));
    }
}
