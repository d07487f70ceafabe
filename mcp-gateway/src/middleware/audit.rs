//! Audit logging: parameter sanitization and best-effort request-log appends

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::dao;
use crate::db::models::RequestLogRow;

/// Parameter keys masked before persistence (matched as case-insensitive
/// substrings)
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "auth",
    "credential",
    "client_secret",
    "private_key",
    "api_key",
];

const REDACTED: &str = "***REDACTED***";

/// Recursively mask sensitive keys in request parameters
///
/// A single pass over the value tree; any map key containing one of the
/// sensitive substrings has its value replaced wholesale.
pub fn sanitize_params(params: &serde_json::Value) -> serde_json::Value {
    match params {
        serde_json::Value::Object(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let key_lower = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| key_lower.contains(s)) {
                    sanitized.insert(key.clone(), serde_json::Value::String(REDACTED.into()));
                } else {
                    sanitized.insert(key.clone(), sanitize_params(value));
                }
            }
            serde_json::Value::Object(sanitized)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_params).collect())
        }
        other => other.clone(),
    }
}

/// Append-only audit writer over the request-log table
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one audit row. Persistence failures are logged and swallowed.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_request(
        &self,
        request_id: &str,
        method: &str,
        tenant_id: Option<Uuid>,
        user_id: Option<String>,
        client_ip: Option<String>,
        target_server_id: Option<Uuid>,
        duration_ms: Option<f64>,
        status_code: Option<i32>,
        error_type: Option<String>,
        error_message: Option<String>,
        metadata: serde_json::Value,
    ) {
        let row = RequestLogRow {
            request_id: request_id.to_string(),
            user_id,
            tenant_id,
            ip_address: client_ip,
            method: "POST".to_string(),
            path: "/mcp/proxy".to_string(),
            target_server_id,
            request_time: Utc::now(),
            duration_ms,
            status_code,
            error_type,
            error_message,
            request_metadata: serde_json::json!({
                "mcp_method": method,
                "detail": sanitize_params(&metadata),
            }),
        };

        dao::append_request_log(&self.pool, &row).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_top_level_keys() {
        let params = json!({
            "path": "/etc/hosts",
            "password": "hunter2",
            "api_key": "mcp_abc",
            "Authorization": "Bearer xyz",
        });

        let sanitized = sanitize_params(&params);
        assert_eq!(sanitized["path"], "/etc/hosts");
        assert_eq!(sanitized["password"], REDACTED);
        assert_eq!(sanitized["api_key"], REDACTED);
        assert_eq!(sanitized["Authorization"], REDACTED);
    }

    #[test]
    fn test_sanitize_nested_and_arrays() {
        let params = json!({
            "arguments": {
                "client_secret": "shh",
                "items": [
                    {"token": "t", "name": "fine"},
                    {"value": 42}
                ]
            }
        });

        let sanitized = sanitize_params(&params);
        assert_eq!(sanitized["arguments"]["client_secret"], REDACTED);
        assert_eq!(sanitized["arguments"]["items"][0]["token"], REDACTED);
        assert_eq!(sanitized["arguments"]["items"][0]["name"], "fine");
        assert_eq!(sanitized["arguments"]["items"][1]["value"], 42);
    }

    #[test]
    fn test_sanitize_substring_match() {
        let params = json!({
            "my_private_key_pem": "----",
            "credential_store": "x",
            "keyboard": "qwerty",
        });

        let sanitized = sanitize_params(&params);
        assert_eq!(sanitized["my_private_key_pem"], REDACTED);
        assert_eq!(sanitized["credential_store"], REDACTED);
        // "keyboard" contains "key"; the fixed key set is substring-based
        assert_eq!(sanitized["keyboard"], REDACTED);
    }

    #[test]
    fn test_sanitize_leaves_scalars_alone() {
        let params = json!([1, "two", null, true]);
        assert_eq!(sanitize_params(&params), params);
    }
}
