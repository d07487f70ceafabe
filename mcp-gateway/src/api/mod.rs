//! Public HTTP surface: REST plane, MCP plane and operational endpoints

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};

use crate::health;
use crate::middleware::path_auth_middleware;
use crate::state::AppState;

pub mod mcp;
pub mod rest;
pub mod rpc;

/// Build the complete application router
pub fn build_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route(
            "/servers",
            post(rest::register_server).get(rest::list_servers),
        )
        .route(
            "/servers/{id}",
            get(rest::get_server).delete(rest::unregister_server),
        )
        .route("/discovery/tools", get(rest::discover_tools))
        .route("/discovery/resources", get(rest::discover_resources))
        .route("/router/metrics", get(rest::router_metrics))
        .route("/proxy/active-requests", get(rest::active_requests))
        .route("/proxy/requests/{id}", delete(rest::cancel_request))
        .route("/ratelimit/status", get(rest::rate_limit_status))
        .route("/ratelimit/reset", post(rest::rate_limit_reset))
        .route(
            "/ratelimit/tenants/{id}",
            post(rest::configure_tenant_limits),
        );

    let mcp_routes = Router::new()
        .route("/proxy", post(mcp::advanced_proxy))
        .route("/tools", get(mcp::list_tools))
        .route("/tools/{name}", post(mcp::invoke_tool));

    Router::new()
        .route("/", get(rest::service_info))
        .route("/health", get(health::health))
        .route("/ready", get(health::readiness))
        .route("/metrics", get(rest::metrics_scrape))
        .route("/mcp", post(mcp::simple_proxy))
        .nest("/api/v1", api_v1)
        .nest("/mcp", mcp_routes)
        .layer(from_fn_with_state(state.clone(), path_auth_middleware))
        .with_state(state)
}
