//! JSON-RPC request forwarding to back-end MCP servers
//!
//! Routes through the registry/router, forwards over the server's transport,
//! records outcomes for circuit breaking, and appends audit rows. Transport
//! failures surface to the client as JSON-RPC error envelopes, never as raw
//! transport errors.

use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::api::rpc::JsonRpcRequest;
use crate::config::ProxyConfig;
use crate::db::dao;
use crate::db::models::{ServerRecord, TransportType};
use crate::error::{Error, Result, JSONRPC_INTERNAL_ERROR};
use crate::middleware::audit::AuditLogger;
use crate::middleware::metrics::GatewayMetrics;
use crate::registry::probe::to_ws_url;
use crate::routing::{RouteRequest, Router};

/// One proxied request, as accepted by [`ProxyService::proxy`]
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub envelope: JsonRpcRequest,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub required_tools: Vec<String>,
    pub required_resources: Vec<String>,
    pub preferred_servers: Vec<Uuid>,
    pub timeout_secs: Option<f64>,
}

/// A proxied response with forwarding metadata
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    pub envelope: Value,
    pub server_id: Uuid,
    pub response_time_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entry in the active-request table
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequest {
    pub request_id: String,
    pub method: String,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub started_at: chrono::DateTime<Utc>,
}

/// Outcome of one transport-level forward
struct ForwardOutcome {
    envelope: Value,
    success: bool,
    error: Option<String>,
}

/// Per-server HTTP clients with pooling, created lazily under a
/// per-server lock
struct ConnectionManager {
    config: ProxyConfig,
    clients: DashMap<Uuid, reqwest::Client>,
    init_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl ConnectionManager {
    fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            init_locks: DashMap::new(),
        }
    }

    async fn get_client(&self, server_id: Uuid) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(&server_id) {
            return Ok(client.clone());
        }

        let lock = self
            .init_locks
            .entry(server_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another task may have created the client while we waited
        if let Some(client) = self.clients.get(&server_id) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.max_keepalive_per_server)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs_f64(self.config.max_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build proxy HTTP client: {}", e)))?;

        self.clients.insert(server_id, client.clone());
        Ok(client)
    }

    fn close(&self, server_id: Uuid) {
        self.clients.remove(&server_id);
        self.init_locks.remove(&server_id);
    }

    fn close_all(&self) {
        self.clients.clear();
        self.init_locks.clear();
    }
}

/// MCP request proxy
pub struct ProxyService {
    config: ProxyConfig,
    router: Arc<Router>,
    pool: PgPool,
    audit: AuditLogger,
    metrics: Arc<GatewayMetrics>,
    connections: ConnectionManager,
    active: Mutex<HashMap<String, ActiveRequest>>,
}

impl ProxyService {
    pub fn new(
        config: ProxyConfig,
        router: Arc<Router>,
        pool: PgPool,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self {
            connections: ConnectionManager::new(config.clone()),
            config,
            router,
            pool: pool.clone(),
            audit,
            metrics,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Proxy one JSON-RPC request to an appropriate back-end
    ///
    /// Routing failures (`NoCompatibleServer`, `ServerUnavailable`) are
    /// logged and returned as errors; transport failures come back as a
    /// successful `Result` whose envelope carries the JSON-RPC error.
    pub async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        request.envelope.validate()?;
        let timeout = self.effective_timeout(request.timeout_secs)?;

        let request_id = request
            .envelope
            .id
            .as_ref()
            .map(id_to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();

        self.track_request(&request_id, &request);

        let result = self
            .proxy_inner(&request_id, &request, timeout, started)
            .await;

        self.untrack_request(&request_id);

        result
    }

    async fn proxy_inner(
        &self,
        request_id: &str,
        request: &ProxyRequest,
        timeout: Duration,
        started: Instant,
    ) -> Result<ProxyResponse> {
        let method = request.envelope.method.clone();

        let route_request = RouteRequest {
            method: method.clone(),
            required_tools: request.required_tools.clone(),
            required_resources: request.required_resources.clone(),
            tenant_id: request.tenant_id,
            user_id: request.user_id.clone(),
            preferred_servers: request.preferred_servers.clone(),
        };

        let server = match self.router.route(&route_request, &HashSet::new()).await {
            Ok(server) => server,
            Err(e) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.audit
                    .log_request(
                        request_id,
                        &method,
                        request.tenant_id,
                        request.user_id.clone(),
                        request.client_ip.clone(),
                        None,
                        Some(duration_ms),
                        None,
                        Some(e.error_code().to_string()),
                        Some("No compatible servers available".to_string()),
                        json!({ "mcp_request": request.envelope, "success": false }),
                    )
                    .await;
                return Err(e);
            }
        };

        tracing::info!(
            request_id = %request_id,
            method = %method,
            server_id = %server.id,
            server_name = %server.name,
            "Proxying request"
        );

        self.router.increment_connection_count(server.id);
        self.metrics.active_connections.inc();

        let outcome = self.forward(&request.envelope, &server, timeout).await;

        self.router.decrement_connection_count(server.id);
        self.metrics.active_connections.dec();

        let duration = started.elapsed();
        let duration_ms = duration.as_secs_f64() * 1000.0;

        match outcome {
            Ok(outcome) => {
                self.router.record_result(server.id, duration, outcome.success);
                self.metrics.proxy_duration.observe(duration.as_secs_f64());

                self.audit
                    .log_request(
                        request_id,
                        &method,
                        request.tenant_id,
                        request.user_id.clone(),
                        request.client_ip.clone(),
                        Some(server.id),
                        Some(duration_ms),
                        outcome.success.then_some(200),
                        (!outcome.success).then(|| "PROXY_ERROR".to_string()),
                        outcome.error.clone(),
                        json!({
                            "mcp_request": request.envelope,
                            "mcp_response": outcome.envelope,
                            "success": outcome.success,
                            "user_agent": request.user_agent,
                        }),
                    )
                    .await;

                self.record_perf_snapshot(&server).await;

                Ok(ProxyResponse {
                    envelope: outcome.envelope,
                    server_id: server.id,
                    response_time_ms: duration_ms,
                    success: outcome.success,
                    error: outcome.error,
                })
            }
            Err(e) => {
                // Unsupported transport and friends: recorded as a failure
                // against the server, then surfaced.
                self.router.record_result(server.id, duration, false);

                self.audit
                    .log_request(
                        request_id,
                        &method,
                        request.tenant_id,
                        request.user_id.clone(),
                        request.client_ip.clone(),
                        Some(server.id),
                        Some(duration_ms),
                        None,
                        Some(e.error_code().to_string()),
                        Some(e.to_string()),
                        json!({ "mcp_request": request.envelope, "success": false }),
                    )
                    .await;

                Err(e)
            }
        }
    }

    /// Transport-specific forward
    async fn forward(
        &self,
        envelope: &JsonRpcRequest,
        server: &ServerRecord,
        timeout: Duration,
    ) -> Result<ForwardOutcome> {
        match server.transport_type {
            TransportType::Http => Ok(self.forward_http(envelope, server, timeout).await),
            TransportType::Websocket => Ok(self.forward_websocket(envelope, server, timeout).await),
            TransportType::Stdio | TransportType::Sse => Err(Error::UnsupportedTransport {
                transport: server.transport_type.to_string(),
                server_id: server.id,
            }),
        }
    }

    async fn forward_http(
        &self,
        envelope: &JsonRpcRequest,
        server: &ServerRecord,
        timeout: Duration,
    ) -> ForwardOutcome {
        let client = match self.connections.get_client(server.id).await {
            Ok(client) => client,
            Err(e) => {
                return error_outcome(envelope, "Internal error", json!({ "error": e.to_string() }))
            }
        };

        let url = format!("{}/mcp", server.endpoint_url.trim_end_matches('/'));

        let response = client
            .post(&url)
            .json(envelope)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => match response.json::<Value>().await {
                Ok(body) => ForwardOutcome {
                    envelope: body,
                    success: true,
                    error: None,
                },
                Err(e) => error_outcome(
                    envelope,
                    "Internal error",
                    json!({ "error": format!("Invalid JSON from back-end: {}", e) }),
                ),
            },
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error_msg = format!("HTTP {}: {}", status, body);
                error_outcome(envelope, "Internal error", json!({ "server_error": error_msg }))
            }
            Err(e) if e.is_timeout() => {
                let error_msg = format!("Request timeout after {:.1}s", timeout.as_secs_f64());
                tracing::error!("HTTP request to {} timed out", server.endpoint_url);
                ForwardOutcome {
                    envelope: json!({
                        "jsonrpc": "2.0",
                        "id": envelope.id,
                        "error": {
                            "code": JSONRPC_INTERNAL_ERROR,
                            "message": "Request timeout",
                            "data": { "timeout": timeout.as_secs_f64() },
                        },
                    }),
                    success: false,
                    error: Some(error_msg),
                }
            }
            Err(e) => {
                tracing::error!("HTTP request to {} failed: {}", server.endpoint_url, e);
                error_outcome(
                    envelope,
                    "Internal error",
                    json!({ "error": format!("HTTP request failed: {}", e) }),
                )
            }
        }
    }

    async fn forward_websocket(
        &self,
        envelope: &JsonRpcRequest,
        server: &ServerRecord,
        timeout: Duration,
    ) -> ForwardOutcome {
        let ws_url = to_ws_url(&server.endpoint_url);

        let exchange = async {
            let (mut stream, _) = connect_async(&ws_url).await.map_err(|e| e.to_string())?;

            let payload = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
            stream
                .send(Message::Text(payload.into()))
                .await
                .map_err(|e| e.to_string())?;

            let reply = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => break text.to_string(),
                    Some(Ok(Message::Binary(bytes))) => {
                        break String::from_utf8_lossy(&bytes).to_string()
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Err("Connection closed before response".to_string()),
                }
            };

            let _ = stream.close(None).await;

            serde_json::from_str::<Value>(&reply).map_err(|e| e.to_string())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(body)) => ForwardOutcome {
                envelope: body,
                success: true,
                error: None,
            },
            Ok(Err(e)) => {
                tracing::error!("WebSocket request to {} failed: {}", ws_url, e);
                error_outcome(
                    envelope,
                    "Internal error",
                    json!({ "error": format!("WebSocket request failed: {}", e) }),
                )
            }
            Err(_) => {
                let error_msg = format!("WebSocket timeout after {:.1}s", timeout.as_secs_f64());
                ForwardOutcome {
                    envelope: json!({
                        "jsonrpc": "2.0",
                        "id": envelope.id,
                        "error": {
                            "code": JSONRPC_INTERNAL_ERROR,
                            "message": "Request timeout",
                            "data": { "timeout": timeout.as_secs_f64() },
                        },
                    }),
                    success: false,
                    error: Some(error_msg),
                }
            }
        }
    }

    /// Refresh the advisory performance snapshot on the server row.
    /// Best-effort; failures are logged and swallowed.
    async fn record_perf_snapshot(&self, server: &ServerRecord) {
        let snapshot = self.router.server_metrics(server.id);
        if let Err(e) = dao::update_perf_snapshot(
            &self.pool,
            server.id,
            snapshot.avg_response_time_ms,
            snapshot.success_rate,
            snapshot.active_connections as i32,
        )
        .await
        {
            tracing::error!("Failed to update metrics for server {}: {}", server.id, e);
        }
    }

    fn effective_timeout(&self, requested: Option<f64>) -> Result<Duration> {
        let timeout = requested.unwrap_or(self.config.default_timeout_secs);

        if timeout <= 0.0 {
            return Err(Error::ValidationError(
                "timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Duration::from_secs_f64(
            timeout.min(self.config.max_timeout_secs),
        ))
    }

    fn track_request(&self, request_id: &str, request: &ProxyRequest) {
        let mut active = self.active.lock().expect("active request lock");
        active.insert(
            request_id.to_string(),
            ActiveRequest {
                request_id: request_id.to_string(),
                method: request.envelope.method.clone(),
                tenant_id: request.tenant_id,
                user_id: request.user_id.clone(),
                started_at: Utc::now(),
            },
        );

        self.metrics
            .concurrent_users
            .with_label_values(&[&tenant_label(request.tenant_id)])
            .inc();
    }

    fn untrack_request(&self, request_id: &str) {
        let mut active = self.active.lock().expect("active request lock");
        if let Some(entry) = active.remove(request_id) {
            self.metrics
                .concurrent_users
                .with_label_values(&[&tenant_label(entry.tenant_id)])
                .dec();
        }
    }

    /// Snapshot of in-flight requests
    pub fn active_requests(&self) -> Vec<ActiveRequest> {
        let active = self.active.lock().expect("active request lock");
        active.values().cloned().collect()
    }

    /// Cancel an active request
    ///
    /// Removes the tracking entry immediately; the in-flight transport call
    /// is not aborted and runs to its own timeout.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut active = self.active.lock().expect("active request lock");
        if let Some(entry) = active.remove(request_id) {
            self.metrics
                .concurrent_users
                .with_label_values(&[&tenant_label(entry.tenant_id)])
                .dec();
            tracing::info!("Cancelled request {}", request_id);
            true
        } else {
            false
        }
    }

    /// Drop the pooled client for an unregistered server
    pub fn close_server_connection(&self, server_id: Uuid) {
        self.connections.close(server_id);
    }

    /// Dispose all pooled clients
    pub fn shutdown(&self) {
        self.connections.close_all();
        tracing::info!("Proxy service shutdown");
    }
}

fn tenant_label(tenant_id: Option<Uuid>) -> String {
    tenant_id
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn error_outcome(envelope: &JsonRpcRequest, message: &str, data: Value) -> ForwardOutcome {
    let error_text = data
        .get("error")
        .or_else(|| data.get("server_error"))
        .and_then(|v| v.as_str())
        .map(String::from);

    ForwardOutcome {
        envelope: json!({
            "jsonrpc": "2.0",
            "id": envelope.id,
            "error": {
                "code": JSONRPC_INTERNAL_ERROR,
                "message": message,
                "data": data,
            },
        }),
        success: false,
        error: error_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_to_string() {
        assert_eq!(id_to_string(&json!("r1")), "r1");
        assert_eq!(id_to_string(&json!(42)), "42");
        assert_eq!(id_to_string(&json!(null)), "null");
    }

    #[test]
    fn test_error_outcome_envelope() {
        let request = JsonRpcRequest::new("r9", "tools/call", None);
        let outcome = error_outcome(
            &request,
            "Internal error",
            json!({ "error": "Unsupported transport" }),
        );

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Unsupported transport"));
        assert_eq!(outcome.envelope["id"], "r9");
        assert_eq!(outcome.envelope["error"]["code"], JSONRPC_INTERNAL_ERROR);
        assert_eq!(
            outcome.envelope["error"]["data"]["error"],
            "Unsupported transport"
        );
    }
}
