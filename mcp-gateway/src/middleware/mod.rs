//! Request middleware: path-based auth gating and identity extraction

use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::auth::UserContext;
use crate::error::{Error, Result};
use crate::state::AppState;

pub mod audit;
pub mod metrics;
pub mod trace;

/// Path prefixes that require authentication
const PROTECTED_PREFIXES: &[&str] = &["/mcp"];

/// Exact paths that are always public
const PUBLIC_PATHS: &[&str] = &["/", "/health", "/ready", "/metrics"];

/// Path prefixes that are public by design (the REST plane)
const PUBLIC_PREFIXES: &[&str] = &["/api/v1/"];

/// Whether a path requires authentication
///
/// The REST plane and operational endpoints are public; everything under
/// `/mcp` requires a validated identity. Unlisted paths default to public.
pub fn is_protected_path(path: &str) -> bool {
    if PUBLIC_PATHS.contains(&path) {
        return false;
    }

    if PUBLIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return false;
    }

    PROTECTED_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)))
}

/// Extract a bearer token from the Authorization header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Best-effort client IP from proxy headers
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Path-based authentication gate
///
/// Public paths pass through untouched. Protected paths must carry a
/// credential that validates as an API key or as a provider JWT; the
/// resulting [`UserContext`] is attached as a request extension. A token
/// that validates as neither is rejected, regardless of its shape.
pub async fn path_auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let path = request.uri().path().to_string();

    if !is_protected_path(&path) {
        tracing::debug!("Public path accessed: {}", path);
        return Ok(next.run(request).await);
    }

    let headers = request.headers();

    let api_key_header = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    let bearer = extract_bearer(headers).map(String::from);

    if api_key_header.is_none() && bearer.is_none() {
        tracing::warn!("Missing authentication token for protected path: {}", path);
        return Err(Error::Unauthorized(
            "Authentication required for this endpoint".to_string(),
        ));
    }

    let context = authenticate(&state, api_key_header.as_deref(), bearer.as_deref()).await;

    match context {
        Ok(context) => {
            let tenant = context
                .tenant_id
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            state.metrics.record_auth_event(
                &context.user_id,
                &tenant,
                "success",
                &context.auth_method,
            );

            tracing::info!(
                user_id = %context.user_id,
                path = %path,
                method = %context.auth_method,
                "Authenticated request"
            );

            request.extensions_mut().insert(context);
            Ok(next.run(request).await)
        }
        Err(e) => {
            state
                .metrics
                .record_auth_event("unknown", "unknown", "failure", "bearer");
            tracing::warn!("Invalid authentication token for path {}: {}", path, e);
            Err(e)
        }
    }
}

/// Try the API-key path first, then the OAuth path
async fn authenticate(
    state: &AppState,
    api_key_header: Option<&str>,
    bearer: Option<&str>,
) -> Result<UserContext> {
    if let Some(key) = api_key_header {
        return state.api_keys.validate(key).await;
    }

    let token = bearer.expect("caller checked that one credential is present");

    if state.api_keys.looks_like_api_key(token) {
        return state.api_keys.validate(token).await;
    }

    match &state.oauth {
        Some(oauth) => {
            let (context, expires_at) = oauth.validate_detailed(token).await?;

            // Keep the session fresh: schedule a refresh near expiry
            if let Some(refresh) = &state.token_refresh {
                refresh.start_monitoring(&context.user_id, expires_at);
            }

            Ok(context)
        }
        None => Err(Error::Unauthorized(
            "Invalid authentication token".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_path_gating_table() {
        // Protected
        assert!(is_protected_path("/mcp"));
        assert!(is_protected_path("/mcp/proxy"));
        assert!(is_protected_path("/mcp/tools"));
        assert!(is_protected_path("/mcp/tools/read_file"));

        // Public
        assert!(!is_protected_path("/"));
        assert!(!is_protected_path("/health"));
        assert!(!is_protected_path("/ready"));
        assert!(!is_protected_path("/metrics"));
        assert!(!is_protected_path("/api/v1/servers"));
        assert!(!is_protected_path("/api/v1/discovery/tools"));

        // Unlisted paths default to public
        assert!(!is_protected_path("/anything-else"));
        // Prefix must match on a path boundary
        assert!(!is_protected_path("/mcpx"));
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("Authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer(&headers), Some("abc123"));

        headers.insert("Authorization", HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);

        headers.insert("x-real-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.1.1.1"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }
}
