//! # mcp-gateway
//!
//! Registry gateway and reverse proxy for fleets of MCP (Model Context
//! Protocol) servers. Exposes a unified JSON-RPC endpoint to clients and
//! handles service discovery, load balancing, health monitoring, fault
//! isolation, authentication and per-tenant rate limiting.
//!
//! ## Components
//!
//! - **Registry**: server catalog with capability discovery and one
//!   cancellable health-probe task per server
//! - **Router**: capability matching, health/circuit filtering, five load
//!   balancing policies including consistent hashing
//! - **Circuit breaker**: per-server fault isolation feeding the weighted
//!   balancing score
//! - **Proxy**: JSON-RPC forwarding over HTTP or WebSocket with pooled
//!   per-server clients and structured error mapping
//! - **Rate limiter**: Redis-backed multi-tier token buckets with tenant
//!   fairness and DDoS quarantine, degrading to in-process buckets on cache
//!   outage
//! - **Auth pipeline**: path-based gating, API-key validation, provider
//!   JWT validation over JWKS, role-based tool access control
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::initialize(config.clone()).await?;
//!     let app = build_router(state.clone());
//!
//!     Server::new(config).serve(app, state).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod routing;
pub mod server;
pub mod state;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::build_router;
    pub use crate::api::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
    pub use crate::auth::{ToolAccessPolicy, UserContext};
    pub use crate::config::Config;
    pub use crate::db::models::{
        CapabilitySet, HealthStatus, ServerFilter, ServerRecord, TransportType,
    };
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::observability::init_tracing;
    pub use crate::proxy::{ProxyRequest, ProxyResponse, ProxyService};
    pub use crate::ratelimit::{RateIdentity, RateLimiter};
    pub use crate::registry::RegistryService;
    pub use crate::routing::{RoutePolicy, RouteRequest, Router as McpRouter};
    pub use crate::server::Server;
    pub use crate::state::AppState;

    pub use axum::{
        extract::{Path, Query, State},
        http::StatusCode,
        response::{IntoResponse, Json},
        Router,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn};
    pub use uuid::Uuid;
}
