//! Server catalog: registration, discovery and continuous health probing

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::db::dao::{self, NewServer};
use crate::db::models::{HealthStatus, ServerFilter, ServerRecord, TransportType};
use crate::error::{Error, Result};
use crate::routing::CandidateSource;

pub mod probe;

use probe::TransportProber;

/// Backoff applied inside a probe loop after an unexpected error
const PROBE_ERROR_BACKOFF: Duration = Duration::from_secs(60);

struct ProbeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Service owning the MCP server catalog
///
/// Owns server lifecycle, capability discovery, and one health-probe task
/// per registered server. Probe tasks are cancellable and terminate cleanly
/// on unregister and on shutdown.
pub struct RegistryService {
    pool: PgPool,
    config: RegistryConfig,
    http_client: reqwest::Client,
    prober: Arc<TransportProber>,
    probes: DashMap<Uuid, ProbeHandle>,
    shutdown: CancellationToken,
}

impl RegistryService {
    pub fn new(pool: PgPool, config: RegistryConfig) -> Result<Arc<Self>> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build registry HTTP client: {}", e)))?;

        let prober = Arc::new(TransportProber::new(
            http_client.clone(),
            config.probe_timeout(),
        ));

        Ok(Arc::new(Self {
            pool,
            config,
            http_client,
            prober,
            probes: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Register a new MCP server
    ///
    /// Fails with `AlreadyRegistered` when `(tenant, name)` is taken.
    /// Capability discovery failures never fail registration. On success a
    /// health-probe task is started for the server.
    pub async fn register(
        self: &Arc<Self>,
        new: NewServer,
        auto_discover: bool,
    ) -> Result<ServerRecord> {
        if dao::server_name_exists(&self.pool, &new.name, new.tenant_id).await? {
            return Err(Error::AlreadyRegistered {
                name: new.name,
                tenant_id: new.tenant_id,
            });
        }

        let server = dao::insert_server(&self.pool, &new).await?;

        tracing::info!(
            server_id = %server.id,
            name = %server.name,
            "Server registered"
        );

        if let Err(e) = self.discover_capabilities(&server, auto_discover).await {
            tracing::warn!(
                "Auto-discovery failed for server '{}': {}",
                server.name,
                e
            );
        }

        self.start_probe(server.id);

        // Return the hydrated record so callers see materialized capabilities
        let registered = dao::get_server(&self.pool, server.id, None, true)
            .await?
            .ok_or(Error::ServerNotFound(server.id))?;

        Ok(registered)
    }

    /// Unregister a server: stops its probe and deletes the record with its
    /// owned tools and resources
    pub async fn unregister(&self, server_id: Uuid, tenant_id: Option<Uuid>) -> Result<()> {
        self.stop_probe(server_id).await;
        dao::delete_server(&self.pool, server_id, tenant_id).await?;
        tracing::info!(server_id = %server_id, "Server unregistered");
        Ok(())
    }

    /// Fetch a server by id
    pub async fn get(
        &self,
        server_id: Uuid,
        tenant_id: Option<Uuid>,
        hydrate: bool,
    ) -> Result<Option<ServerRecord>> {
        dao::get_server(&self.pool, server_id, tenant_id, hydrate).await
    }

    /// Find servers matching the filter
    pub async fn find(&self, filter: &ServerFilter, hydrate: bool) -> Result<Vec<ServerRecord>> {
        dao::find_servers(&self.pool, filter, hydrate).await
    }

    /// Update health status and the probe liveness timestamp
    pub async fn update_health(
        &self,
        server_id: Uuid,
        status: HealthStatus,
        metadata: Option<serde_json::Value>,
    ) -> Result<bool> {
        dao::mark_server_health(&self.pool, server_id, status, metadata, Utc::now()).await
    }

    /// Re-launch a probe per persisted server after a restart
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let servers = self.find(&ServerFilter::default(), false).await?;

        if servers.is_empty() {
            tracing::info!("No existing servers found to monitor");
            return Ok(());
        }

        for server in &servers {
            tracing::info!(
                server_id = %server.id,
                name = %server.name,
                "Restoring health monitoring"
            );
            self.start_probe(server.id);
        }

        tracing::info!("Health monitoring restored for {} servers", servers.len());
        Ok(())
    }

    /// Cancel every probe task and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<(Uuid, ProbeHandle)> = {
            let keys: Vec<Uuid> = self.probes.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|k| self.probes.remove(&k))
                .collect()
        };

        for (_, handle) in handles {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }

        tracing::info!("Registry service shutdown");
    }

    /// Materialize capabilities into tool/resource rows
    ///
    /// Declared capabilities win; otherwise, when allowed and the transport
    /// is HTTP, the endpoint is asked via `tools/list` and `resources/list`.
    async fn discover_capabilities(&self, server: &ServerRecord, live_allowed: bool) -> Result<()> {
        let caps = &server.capabilities.0;

        if !caps.is_empty() {
            tracing::info!("Using declared capabilities for server {}", server.id);

            let tools: Vec<(String, Option<String>, serde_json::Value)> = caps
                .tools
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|name| (name.clone(), None, json!({})))
                .collect();

            let resources: Vec<(String, Option<String>, Option<String>, Option<String>)> = caps
                .resources
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|pattern| (pattern.clone(), None, None, Some("*/*".to_string())))
                .collect();

            dao::replace_capabilities(&self.pool, server.id, &tools, &resources).await?;
            return Ok(());
        }

        if !live_allowed || server.transport_type != TransportType::Http {
            return Ok(());
        }

        let tools = self
            .call_listing(server, "tools/list", 1)
            .await
            .map(|result| {
                result["tools"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tool| {
                        let name = tool["name"].as_str()?.to_string();
                        let description = tool["description"].as_str().map(String::from);
                        let schema = tool.get("inputSchema").cloned().unwrap_or(json!({}));
                        Some((name, description, schema))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|e| {
                tracing::debug!("Failed to discover tools for {}: {}", server.id, e);
                Vec::new()
            });

        let resources = self
            .call_listing(server, "resources/list", 2)
            .await
            .map(|result| {
                result["resources"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|resource| {
                        let uri = resource["uri"].as_str()?.to_string();
                        let name = resource["name"].as_str().map(String::from);
                        let description = resource["description"].as_str().map(String::from);
                        let mime_type = resource["mimeType"].as_str().map(String::from);
                        Some((uri, name, description, mime_type))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|e| {
                tracing::debug!("Failed to discover resources for {}: {}", server.id, e);
                Vec::new()
            });

        if tools.is_empty() && resources.is_empty() {
            return Ok(());
        }

        dao::replace_capabilities(&self.pool, server.id, &tools, &resources).await
    }

    /// Issue one JSON-RPC listing call against the server's `/mcp` endpoint
    async fn call_listing(
        &self,
        server: &ServerRecord,
        method: &str,
        id: i64,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/mcp", server.endpoint_url.trim_end_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
            }))
            .timeout(self.config.discovery_timeout())
            .send()
            .await
            .map_err(|e| Error::External(format!("{} call failed: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::External(format!("{} returned invalid JSON: {}", method, e)))?;

        Ok(body.get("result").cloned().unwrap_or(json!({})))
    }

    fn start_probe(self: &Arc<Self>, server_id: Uuid) {
        if self.probes.contains_key(&server_id) {
            tracing::info!("Health monitoring already running for server {}", server_id);
            return;
        }

        tracing::info!("Starting health monitoring for server {}", server_id);

        let cancel = self.shutdown.child_token();
        let registry = Arc::clone(self);
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            registry.probe_loop(server_id, loop_cancel).await;
        });

        self.probes.insert(server_id, ProbeHandle { cancel, task });
    }

    async fn stop_probe(&self, server_id: Uuid) {
        if let Some((_, handle)) = self.probes.remove(&server_id) {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    /// Continuous health-check loop for one server
    ///
    /// Errors never escape: they degrade the stored status and back off.
    async fn probe_loop(&self, server_id: Uuid, cancel: CancellationToken) {
        let interval = self.config.probe_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let server = match self.get(server_id, None, false).await {
                Ok(Some(server)) => server,
                Ok(None) => {
                    tracing::warn!("Server {} not found, stopping health checks", server_id);
                    break;
                }
                Err(e) => {
                    tracing::error!("Health check error for server {}: {}", server_id, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(PROBE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let status = self.prober.probe(&server).await;

            if status != server.health_status {
                tracing::info!(
                    server_name = %server.name,
                    old = %server.health_status,
                    new = %status,
                    "Server health changed"
                );
            }

            // Refresh the timestamp every cycle to prove probe liveness
            if let Err(e) = self.update_health(server_id, status, None).await {
                tracing::error!("Failed to update server health {}: {}", server_id, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PROBE_ERROR_BACKOFF) => {}
                }
            }
        }

        tracing::debug!("Health check loop for server {} stopped", server_id);
    }

    /// Number of live probe tasks (health/readiness reporting)
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

#[async_trait]
impl CandidateSource for RegistryService {
    async fn find_candidates(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>> {
        self.find(filter, true).await
    }

    async fn list_server_ids(&self) -> Result<Vec<Uuid>> {
        let servers = self.find(&ServerFilter::default(), false).await?;
        Ok(servers.into_iter().map(|s| s.id).collect())
    }
}
