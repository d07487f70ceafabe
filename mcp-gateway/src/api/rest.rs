//! REST plane: server CRUD, capability discovery, routing metrics and
//! limiter administration
//!
//! This plane is unauthenticated by design; production deployments front it
//! with network controls.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::dao::NewServer;
use crate::db::models::{CapabilitySet, HealthStatus, ServerFilter, ServerRecord, TransportType};
use crate::error::{Error, Result};
use crate::ratelimit::RateIdentity;
use crate::state::AppState;

/// Service identity and links
pub async fn service_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": state.config.service.name,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.service.environment,
        "links": {
            "health": "/health",
            "ready": "/ready",
            "metrics": "/metrics",
            "servers": "/api/v1/servers",
            "proxy": "/mcp",
        },
    }))
}

/// Prometheus exposition
pub async fn metrics_scrape(State(state): State<AppState>) -> Result<Response> {
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub name: String,
    pub endpoint_url: String,
    pub transport_type: TransportType,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    #[serde(default)]
    pub registered_by: Option<String>,

    #[serde(default = "default_true")]
    pub auto_discover: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Register a new server
pub async fn register_server(
    State(state): State<AppState>,
    Json(request): Json<RegisterServerRequest>,
) -> Result<(StatusCode, Json<ServerRecord>)> {
    if request.name.is_empty() {
        return Err(Error::ValidationError("name must not be empty".to_string()));
    }
    if !request.endpoint_url.starts_with("http://")
        && !request.endpoint_url.starts_with("https://")
        && request.transport_type != TransportType::Stdio
    {
        return Err(Error::ValidationError(format!(
            "invalid endpoint URL: {}",
            request.endpoint_url
        )));
    }

    let new = NewServer {
        name: request.name,
        description: request.description,
        version: request.version,
        endpoint_url: request.endpoint_url,
        transport_type: request.transport_type,
        capabilities: request.capabilities.unwrap_or_default(),
        tags: request.tags,
        tenant_id: request.tenant_id,
        registered_by: request.registered_by,
    };

    let server = state.registry.register(new, request.auto_discover).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListServersQuery {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    /// Comma-separated tool names; servers must expose all of them
    #[serde(default)]
    pub tools: Option<String>,

    /// Comma-separated resource URI prefixes; any match qualifies
    #[serde(default)]
    pub resources: Option<String>,

    /// Comma-separated tags; servers must carry all of them
    #[serde(default)]
    pub tags: Option<String>,

    #[serde(default)]
    pub health_status: Option<HealthStatus>,

    #[serde(default)]
    pub limit: Option<i64>,

    #[serde(default)]
    pub include_capabilities: bool,
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// List and filter servers
pub async fn list_servers(
    State(state): State<AppState>,
    Query(query): Query<ListServersQuery>,
) -> Result<Json<Vec<ServerRecord>>> {
    let filter = ServerFilter {
        name: query.name,
        tools: split_csv(&query.tools),
        resources: split_csv(&query.resources),
        tags: split_csv(&query.tags),
        health_status: query.health_status,
        tenant_id: query.tenant_id,
        limit: query.limit,
    };

    let servers = state
        .registry
        .find(&filter, query.include_capabilities)
        .await?;
    Ok(Json(servers))
}

/// Fetch one server with its capabilities
pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerRecord>> {
    let server = state
        .registry
        .get(id, None, true)
        .await?
        .ok_or(Error::ServerNotFound(id))?;
    Ok(Json(server))
}

/// Unregister a server
pub async fn unregister_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.registry.unregister(id, None).await?;
    state.proxy.close_server_connection(id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DiscoverToolsQuery {
    pub tools: String,
}

/// Find servers exposing all of the given tools
pub async fn discover_tools(
    State(state): State<AppState>,
    Query(query): Query<DiscoverToolsQuery>,
) -> Result<Json<Vec<ServerRecord>>> {
    let tools = split_csv(&Some(query.tools));
    if tools.is_empty() {
        return Err(Error::ValidationError(
            "tools query parameter must not be empty".to_string(),
        ));
    }

    let filter = ServerFilter {
        tools,
        ..Default::default()
    };
    let servers = state.registry.find(&filter, true).await?;
    Ok(Json(servers))
}

#[derive(Debug, Deserialize)]
pub struct DiscoverResourcesQuery {
    pub resources: String,
}

/// Find servers matching any of the given resource patterns
pub async fn discover_resources(
    State(state): State<AppState>,
    Query(query): Query<DiscoverResourcesQuery>,
) -> Result<Json<Vec<ServerRecord>>> {
    let resources = split_csv(&Some(query.resources));
    if resources.is_empty() {
        return Err(Error::ValidationError(
            "resources query parameter must not be empty".to_string(),
        ));
    }

    let filter = ServerFilter {
        resources,
        ..Default::default()
    };
    let servers = state.registry.find(&filter, true).await?;
    Ok(Json(servers))
}

/// Per-server routing metrics
pub async fn router_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "servers": state.router.all_server_metrics() }))
}

/// In-flight proxied requests
pub async fn active_requests(State(state): State<AppState>) -> Json<serde_json::Value> {
    let active = state.proxy.active_requests();
    Json(json!({ "count": active.len(), "requests": active }))
}

/// Cancel an in-flight request (tracking only)
pub async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if state.proxy.cancel(&id) {
        Ok(Json(json!({ "request_id": id, "cancelled": true })))
    } else {
        Err(Error::NotFound(format!("No active request with id {}", id)))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RateLimitStatusQuery {
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    #[serde(default)]
    pub client_ip: Option<String>,

    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "anonymous".to_string()
}

/// Current bucket utilization and DDoS state
pub async fn rate_limit_status(
    State(state): State<AppState>,
    Query(query): Query<RateLimitStatusQuery>,
) -> Json<crate::ratelimit::RateLimitStatus> {
    let identity = RateIdentity {
        user_id: query.user_id,
        tenant_id: query.tenant_id,
        client_ip: query.client_ip,
        role: query.role,
    };
    Json(state.rate_limiter.status(&identity))
}

#[derive(Debug, Deserialize)]
pub struct RateLimitResetRequest {
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,

    #[serde(default)]
    pub client_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RateLimitResetResponse {
    pub reset_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct TenantLimitsRequest {
    #[serde(default)]
    pub base_rpm: Option<u32>,

    #[serde(default)]
    pub fairness_weight: Option<f64>,

    #[serde(default)]
    pub burst_factor: Option<f64>,
}

/// Reconfigure a tenant's rate limits and fairness weight at runtime
pub async fn configure_tenant_limits(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<TenantLimitsRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.base_rpm.is_none()
        && request.fairness_weight.is_none()
        && request.burst_factor.is_none()
    {
        return Err(Error::ValidationError(
            "at least one of base_rpm, fairness_weight, burst_factor is required".to_string(),
        ));
    }

    if request.fairness_weight.is_some_and(|w| w <= 0.0) {
        return Err(Error::ValidationError(
            "fairness_weight must be positive".to_string(),
        ));
    }

    state.rate_limiter.configure_tenant(
        tenant_id,
        request.base_rpm,
        request.fairness_weight,
        request.burst_factor,
    );

    Ok(Json(json!({ "tenant_id": tenant_id, "updated": true })))
}

/// Clear buckets and DDoS counters for the given entities
pub async fn rate_limit_reset(
    State(state): State<AppState>,
    Json(request): Json<RateLimitResetRequest>,
) -> Result<Json<RateLimitResetResponse>> {
    if request.user_id.is_none() && request.tenant_id.is_none() && request.client_ip.is_none() {
        return Err(Error::ValidationError(
            "at least one of user_id, tenant_id, client_ip is required".to_string(),
        ));
    }

    let reset_count = state
        .rate_limiter
        .reset(
            request.user_id.as_deref(),
            request.tenant_id,
            request.client_ip.as_deref(),
        )
        .await;

    Ok(Json(RateLimitResetResponse { reset_count }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_csv() {
        assert_eq!(
            split_csv(&Some("read_file, write_file".to_string())),
            vec!["read_file".to_string(), "write_file".to_string()]
        );
        assert_eq!(split_csv(&Some(" ,, ".to_string())), Vec::<String>::new());
        assert_eq!(split_csv(&None), Vec::<String>::new());
    }

    #[test]
    fn test_register_request_defaults() {
        let request: RegisterServerRequest = serde_json::from_value(json!({
            "name": "files",
            "endpoint_url": "http://s:3001",
            "transport_type": "http",
            "capabilities": {"tools": ["read_file"]},
        }))
        .unwrap();

        assert_eq!(request.version, "1.0.0");
        assert!(request.auto_discover);
        assert!(request.tags.is_empty());
        assert_eq!(
            request.capabilities.unwrap().tools.unwrap(),
            vec!["read_file".to_string()]
        );
    }
}
