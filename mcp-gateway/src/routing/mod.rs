//! Request routing with capability filtering, circuit breaking and
//! policy-driven load balancing

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::db::models::{HealthStatus, ServerFilter, ServerRecord};
use crate::error::{Error, Result};

pub mod breaker;

pub use breaker::{CircuitBreaker, CircuitState, ServerMetrics};

/// Methods routable to any server in tenant scope when no capability
/// requirements are present
const GENERIC_METHODS: &[&str] = &["tools/list", "resources/list", "ping", "initialize"];

/// Virtual nodes per server on the consistent-hash ring
const VIRTUAL_NODES: usize = 100;

/// Metrics idle longer than this are swept
const STALE_METRICS_AGE: Duration = Duration::from_secs(3600);

/// Load balancing policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    RoundRobin,
    Random,
    LeastConnections,
    #[default]
    Weighted,
    ConsistentHash,
}

/// A request to be routed
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub method: String,
    pub required_tools: Vec<String>,
    pub required_resources: Vec<String>,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub preferred_servers: Vec<Uuid>,
}

impl RouteRequest {
    /// Key used for consistent-hash placement
    fn hash_key(&self) -> String {
        let tenant = self
            .tenant_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "default".to_string());
        let user = self.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
        format!("{}:{}", tenant, user)
    }
}

/// Source of routable candidates; implemented by the registry
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Servers matching the filter, hydrated with tools and resources
    async fn find_candidates(&self, filter: &ServerFilter) -> Result<Vec<ServerRecord>>;

    /// Ids of every registered server (for the housekeeping sweep)
    async fn list_server_ids(&self) -> Result<Vec<Uuid>>;
}

/// Snapshot of routing state for one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerRoutingMetrics {
    pub server_id: Uuid,
    pub active_connections: u32,
    pub total_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub circuit_breaker_state: &'static str,
    pub failure_count: u32,
    pub seconds_since_update: f64,
}

#[derive(Default)]
struct HashRing {
    points: BTreeMap<u64, Uuid>,
    members: HashSet<Uuid>,
}

impl HashRing {
    fn rebuild(&mut self, servers: &[ServerRecord]) {
        self.points.clear();
        self.members = servers.iter().map(|s| s.id).collect();

        for server in servers {
            for i in 0..VIRTUAL_NODES {
                let point = fnv1a(format!("{}:{}", server.id, i).as_bytes());
                self.points.insert(point, server.id);
            }
        }
    }

    fn matches(&self, servers: &[ServerRecord]) -> bool {
        self.members.len() == servers.len() && servers.iter().all(|s| self.members.contains(&s.id))
    }

    fn lookup(&self, key: &str) -> Option<Uuid> {
        if self.points.is_empty() {
            return None;
        }
        let hash = fnv1a(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| *id)
    }
}

/// FNV-1a; stable across processes so ring placement survives restarts
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Request router
///
/// Selects a back-end per request: capability match through the registry,
/// health and circuit filtering, then the configured balancing policy.
pub struct Router {
    config: RouterConfig,
    source: Arc<dyn CandidateSource>,

    breakers: DashMap<Uuid, Mutex<CircuitBreaker>>,
    metrics: DashMap<Uuid, Mutex<ServerMetrics>>,
    round_robin_index: AtomicUsize,
    hash_ring: Mutex<HashRing>,
}

impl Router {
    pub fn new(config: RouterConfig, source: Arc<dyn CandidateSource>) -> Self {
        Self {
            config,
            source,
            breakers: DashMap::new(),
            metrics: DashMap::new(),
            round_robin_index: AtomicUsize::new(0),
            hash_ring: Mutex::new(HashRing::default()),
        }
    }

    /// Route a request to a server
    ///
    /// Fails with `NoCompatibleServer` when nothing matches the capability
    /// requirements, and `ServerUnavailable` when compatible servers exist
    /// but none is healthy with a permissive circuit.
    pub async fn route(
        &self,
        request: &RouteRequest,
        exclude: &HashSet<Uuid>,
    ) -> Result<ServerRecord> {
        let compatible = self.find_compatible(request).await?;

        if compatible.is_empty() {
            return Err(Error::NoCompatibleServer {
                required_tools: request.required_tools.clone(),
                required_resources: request.required_resources.clone(),
                tenant_id: request.tenant_id,
            });
        }

        self.route_candidates(compatible, request, exclude)
    }

    /// Steps 2-5 of the selection pipeline over an already-fetched
    /// candidate set
    pub fn route_candidates(
        &self,
        compatible: Vec<ServerRecord>,
        request: &RouteRequest,
        exclude: &HashSet<Uuid>,
    ) -> Result<ServerRecord> {
        let compatible_ids: Vec<Uuid> = compatible.iter().map(|s| s.id).collect();

        let mut circuits_open = Vec::new();
        let mut available = Vec::new();

        for server in compatible {
            if exclude.contains(&server.id) {
                continue;
            }

            if self.config.circuit_breaker_enabled && !self.circuit_allows(server.id) {
                tracing::debug!("Circuit breaker open for server {}", server.id);
                circuits_open.push(server.id);
                continue;
            }

            if server.health_status != HealthStatus::Healthy {
                tracing::debug!(
                    "Server {} is not healthy: {}",
                    server.id,
                    server.health_status
                );
                continue;
            }

            available.push(server);
        }

        if available.is_empty() {
            return Err(Error::ServerUnavailable {
                compatible: compatible_ids,
                circuits_open,
            });
        }

        let selected = self.select(available, request);

        tracing::info!(
            server_id = %selected.id,
            server_name = %selected.name,
            method = %request.method,
            policy = ?self.config.policy,
            "Routed request"
        );

        Ok(selected)
    }

    async fn find_compatible(&self, request: &RouteRequest) -> Result<Vec<ServerRecord>> {
        // Generic methods with no capability requirements are routable to
        // any server in tenant scope.
        let generic = request.required_tools.is_empty()
            && request.required_resources.is_empty()
            && GENERIC_METHODS.contains(&request.method.as_str());

        let filter = if generic {
            ServerFilter {
                tenant_id: request.tenant_id,
                ..Default::default()
            }
        } else {
            ServerFilter {
                tools: request.required_tools.clone(),
                resources: request.required_resources.clone(),
                tenant_id: request.tenant_id,
                ..Default::default()
            }
        };

        self.source.find_candidates(&filter).await
    }

    fn select(&self, mut servers: Vec<ServerRecord>, request: &RouteRequest) -> ServerRecord {
        if servers.len() == 1 {
            return servers.remove(0);
        }

        // Preferred servers short-circuit the policy when one is available
        if !request.preferred_servers.is_empty() {
            if let Some(pos) = servers
                .iter()
                .position(|s| request.preferred_servers.contains(&s.id))
            {
                return servers.remove(pos);
            }
        }

        match self.config.policy {
            RoutePolicy::RoundRobin => self.select_round_robin(servers),
            RoutePolicy::Random => self.select_random(servers),
            RoutePolicy::LeastConnections => self.select_least_connections(servers),
            RoutePolicy::Weighted => self.select_weighted(servers),
            RoutePolicy::ConsistentHash => self.select_consistent_hash(servers, request),
        }
    }

    fn select_round_robin(&self, mut servers: Vec<ServerRecord>) -> ServerRecord {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        servers.remove(index % servers.len())
    }

    fn select_random(&self, mut servers: Vec<ServerRecord>) -> ServerRecord {
        let index = rand::rng().random_range(0..servers.len());
        servers.remove(index)
    }

    fn select_least_connections(&self, servers: Vec<ServerRecord>) -> ServerRecord {
        let mut min_connections = u32::MAX;
        let mut best = Vec::new();

        for server in servers {
            let connections = self
                .metrics
                .get(&server.id)
                .map(|m| m.lock().expect("metrics lock").active_connections)
                .unwrap_or(0);

            if connections < min_connections {
                min_connections = connections;
                best = vec![server];
            } else if connections == min_connections {
                best.push(server);
            }
        }

        if best.len() > 1 {
            self.select_weighted(best)
        } else {
            best.remove(0)
        }
    }

    fn select_weighted(&self, servers: Vec<ServerRecord>) -> ServerRecord {
        let mut scored: Vec<(ServerRecord, f64)> = servers
            .into_iter()
            .map(|server| {
                let score = self
                    .metrics
                    .get(&server.id)
                    .map(|m| m.lock().expect("metrics lock").score())
                    .unwrap_or(1.0);
                (server, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Weighted random selection from the top half
        let top_count = (scored.len() / 2).max(1);
        scored.truncate(top_count);

        let total_weight: f64 = scored.iter().map(|(_, score)| score).sum();
        if total_weight <= 0.0 {
            let index = rand::rng().random_range(0..scored.len());
            return scored.remove(index).0;
        }

        let mut pick = rand::rng().random_range(0.0..total_weight);
        let mut chosen = 0;
        for (i, (_, score)) in scored.iter().enumerate() {
            chosen = i;
            if pick <= *score {
                break;
            }
            pick -= score;
        }

        scored.remove(chosen).0
    }

    fn select_consistent_hash(
        &self,
        mut servers: Vec<ServerRecord>,
        request: &RouteRequest,
    ) -> ServerRecord {
        let mut ring = self.hash_ring.lock().expect("hash ring lock");

        if !ring.matches(&servers) {
            ring.rebuild(&servers);
        }

        let selected = ring.lookup(&request.hash_key());
        drop(ring);

        match selected.and_then(|id| servers.iter().position(|s| s.id == id)) {
            Some(pos) => servers.remove(pos),
            // Ring and candidate set can only disagree transiently; fall
            // back to an arbitrary candidate.
            None => servers.remove(0),
        }
    }

    fn circuit_allows(&self, server_id: Uuid) -> bool {
        self.breaker_entry(server_id)
            .lock()
            .expect("breaker lock")
            .can_execute()
    }

    fn breaker_entry(
        &self,
        server_id: Uuid,
    ) -> dashmap::mapref::one::Ref<'_, Uuid, Mutex<CircuitBreaker>> {
        if let Some(entry) = self.breakers.get(&server_id) {
            return entry;
        }
        self.breakers
            .entry(server_id)
            .or_insert_with(|| {
                Mutex::new(CircuitBreaker::new(
                    self.config.failure_threshold,
                    self.config.recovery_timeout(),
                    self.config.success_threshold,
                ))
            })
            .downgrade()
    }

    /// Record a request outcome for metrics and the circuit breaker
    pub fn record_result(&self, server_id: Uuid, duration: Duration, success: bool) {
        let response_time_ms = duration.as_secs_f64() * 1000.0;

        {
            let entry = self.metrics.entry(server_id).or_default();
            entry
                .lock()
                .expect("metrics lock")
                .record_request(response_time_ms, success);
        }

        if self.config.circuit_breaker_enabled {
            let entry = self.breaker_entry(server_id);
            let mut breaker = entry.lock().expect("breaker lock");
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
                tracing::warn!(
                    server_id = %server_id,
                    failure_count = breaker.failure_count(),
                    "Request failed for server"
                );
            }
        }
    }

    /// Increment the active connection count for a server
    pub fn increment_connection_count(&self, server_id: Uuid) {
        let entry = self.metrics.entry(server_id).or_default();
        entry.lock().expect("metrics lock").active_connections += 1;
    }

    /// Decrement the active connection count for a server
    pub fn decrement_connection_count(&self, server_id: Uuid) {
        if let Some(entry) = self.metrics.get(&server_id) {
            let mut metrics = entry.lock().expect("metrics lock");
            metrics.active_connections = metrics.active_connections.saturating_sub(1);
        }
    }

    /// Current active connection count for a server
    pub fn active_connections(&self, server_id: Uuid) -> u32 {
        self.metrics
            .get(&server_id)
            .map(|m| m.lock().expect("metrics lock").active_connections)
            .unwrap_or(0)
    }

    /// Routing metrics snapshot for one server
    pub fn server_metrics(&self, server_id: Uuid) -> ServerRoutingMetrics {
        let (active, total, success_rate, error_rate, avg_ms, age) = self
            .metrics
            .get(&server_id)
            .map(|m| {
                let m = m.lock().expect("metrics lock");
                (
                    m.active_connections,
                    m.total_requests,
                    m.success_rate(),
                    m.error_rate(),
                    m.avg_response_time_ms,
                    m.last_update.elapsed().as_secs_f64(),
                )
            })
            .unwrap_or((0, 0, 1.0, 0.0, 0.0, 0.0));

        let (state, failure_count) = self
            .breakers
            .get(&server_id)
            .map(|b| {
                let b = b.lock().expect("breaker lock");
                (b.state().as_str(), b.failure_count())
            })
            .unwrap_or(("closed", 0));

        ServerRoutingMetrics {
            server_id,
            active_connections: active,
            total_requests: total,
            success_rate,
            error_rate,
            avg_response_time_ms: avg_ms,
            circuit_breaker_state: state,
            failure_count,
            seconds_since_update: age,
        }
    }

    /// Snapshot for every server currently tracked
    pub fn all_server_metrics(&self) -> Vec<ServerRoutingMetrics> {
        self.metrics
            .iter()
            .map(|entry| self.server_metrics(*entry.key()))
            .collect()
    }

    /// Spawn the periodic stale-state sweep; terminates on cancellation
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let interval = router.config.cleanup_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = router.sweep_stale_state().await {
                            tracing::error!("Error in routing cleanup loop: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Routing cleanup loop stopped");
        })
    }

    /// Drop metrics and breakers for servers no longer registered or idle
    /// for more than an hour
    async fn sweep_stale_state(&self) -> Result<()> {
        let active_ids: HashSet<Uuid> = self.source.list_server_ids().await?.into_iter().collect();

        let stale: Vec<Uuid> = self
            .metrics
            .iter()
            .filter(|entry| {
                let idle = entry
                    .value()
                    .lock()
                    .expect("metrics lock")
                    .last_update
                    .elapsed();
                !active_ids.contains(entry.key()) || idle > STALE_METRICS_AGE
            })
            .map(|entry| *entry.key())
            .collect();

        for server_id in stale {
            self.metrics.remove(&server_id);
            self.breakers.remove(&server_id);
            tracing::debug!("Cleaned up stale routing state for server {}", server_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CapabilitySet, TransportType};
    use chrono::Utc;
    use sqlx::types::Json;

    struct EmptySource;

    #[async_trait]
    impl CandidateSource for EmptySource {
        async fn find_candidates(&self, _filter: &ServerFilter) -> Result<Vec<ServerRecord>> {
            Ok(Vec::new())
        }

        async fn list_server_ids(&self) -> Result<Vec<Uuid>> {
            Ok(Vec::new())
        }
    }

    fn server(name: &str, health: HealthStatus) -> ServerRecord {
        ServerRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            version: "1.0.0".to_string(),
            endpoint_url: format!("http://{}:3001", name),
            transport_type: TransportType::Http,
            capabilities: Json(CapabilitySet::default()),
            tags: Json(Vec::new()),
            health_status: health,
            last_health_check: None,
            health_metadata: Json(serde_json::Value::Null),
            avg_response_time: None,
            success_rate: None,
            active_connections: None,
            tenant_id: None,
            registered_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }

    fn router(policy: RoutePolicy) -> Router {
        let config = RouterConfig {
            policy,
            ..Default::default()
        };
        Router::new(config, Arc::new(EmptySource))
    }

    fn request(user: &str) -> RouteRequest {
        RouteRequest {
            method: "tools/call".to_string(),
            user_id: Some(user.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_compatible_server() {
        let router = router(RoutePolicy::RoundRobin);
        let req = RouteRequest {
            method: "tools/call".to_string(),
            required_tools: vec!["read_file".to_string()],
            ..Default::default()
        };

        let err = router.route(&req, &HashSet::new()).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_COMPATIBLE_SERVER");
    }

    #[test]
    fn test_unhealthy_candidates_yield_unavailable() {
        let router = router(RoutePolicy::RoundRobin);
        let candidates = vec![
            server("s1", HealthStatus::Unhealthy),
            server("s2", HealthStatus::Degraded),
        ];
        let ids: Vec<Uuid> = candidates.iter().map(|s| s.id).collect();

        let err = router
            .route_candidates(candidates, &request("u"), &HashSet::new())
            .unwrap_err();

        match err {
            Error::ServerUnavailable { compatible, .. } => assert_eq!(compatible, ids),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_exclusion() {
        let router = router(RoutePolicy::RoundRobin);
        let s1 = server("s1", HealthStatus::Healthy);
        let s2 = server("s2", HealthStatus::Healthy);
        let exclude: HashSet<Uuid> = [s1.id].into_iter().collect();

        for _ in 0..5 {
            let selected = router
                .route_candidates(vec![s1.clone(), s2.clone()], &request("u"), &exclude)
                .unwrap();
            assert_eq!(selected.id, s2.id);
        }
    }

    #[test]
    fn test_single_candidate_shortcut() {
        let router = router(RoutePolicy::ConsistentHash);
        let s1 = server("only", HealthStatus::Healthy);

        for _ in 0..10 {
            let selected = router
                .route_candidates(vec![s1.clone()], &request("u"), &HashSet::new())
                .unwrap();
            assert_eq!(selected.id, s1.id);
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let router = router(RoutePolicy::RoundRobin);
        let servers: Vec<ServerRecord> = (0..3)
            .map(|i| server(&format!("s{i}"), HealthStatus::Healthy))
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let selected = router
                .route_candidates(servers.clone(), &request("u"), &HashSet::new())
                .unwrap();
            seen.insert(selected.id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_least_connections() {
        let router = router(RoutePolicy::LeastConnections);
        let s1 = server("busy", HealthStatus::Healthy);
        let s2 = server("idle", HealthStatus::Healthy);

        for _ in 0..5 {
            router.increment_connection_count(s1.id);
        }

        let selected = router
            .route_candidates(vec![s1.clone(), s2.clone()], &request("u"), &HashSet::new())
            .unwrap();
        assert_eq!(selected.id, s2.id);
    }

    #[test]
    fn test_consistent_hash_stability() {
        let router = router(RoutePolicy::ConsistentHash);
        let servers: Vec<ServerRecord> = (0..3)
            .map(|i| server(&format!("s{i}"), HealthStatus::Healthy))
            .collect();

        let req = RouteRequest {
            method: "tools/call".to_string(),
            tenant_id: Some(Uuid::new_v4()),
            user_id: Some("u1".to_string()),
            ..Default::default()
        };

        let first = router
            .route_candidates(servers.clone(), &req, &HashSet::new())
            .unwrap();

        for _ in 0..10 {
            let next = router
                .route_candidates(servers.clone(), &req, &HashSet::new())
                .unwrap();
            assert_eq!(next.id, first.id);
        }

        // Removing the selected server re-maps to one of the remaining two,
        // and stays stable afterwards.
        let remaining: Vec<ServerRecord> =
            servers.iter().filter(|s| s.id != first.id).cloned().collect();
        let second = router
            .route_candidates(remaining.clone(), &req, &HashSet::new())
            .unwrap();
        assert_ne!(second.id, first.id);
        for _ in 0..10 {
            let next = router
                .route_candidates(remaining.clone(), &req, &HashSet::new())
                .unwrap();
            assert_eq!(next.id, second.id);
        }
    }

    #[test]
    fn test_breaker_excludes_after_failures() {
        let router = router(RoutePolicy::RoundRobin);
        let s1 = server("failing", HealthStatus::Healthy);

        for _ in 0..5 {
            router.record_result(s1.id, Duration::from_millis(100), false);
        }

        let err = router
            .route_candidates(vec![s1.clone()], &request("u"), &HashSet::new())
            .unwrap_err();

        match err {
            Error::ServerUnavailable { circuits_open, .. } => {
                assert_eq!(circuits_open, vec![s1.id]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_connection_counts() {
        let router = router(RoutePolicy::RoundRobin);
        let id = Uuid::new_v4();

        router.increment_connection_count(id);
        router.increment_connection_count(id);
        assert_eq!(router.active_connections(id), 2);

        router.decrement_connection_count(id);
        router.decrement_connection_count(id);
        router.decrement_connection_count(id);
        assert_eq!(router.active_connections(id), 0);
    }

    #[test]
    fn test_preferred_servers_win() {
        let router = router(RoutePolicy::RoundRobin);
        let s1 = server("s1", HealthStatus::Healthy);
        let s2 = server("s2", HealthStatus::Healthy);

        let req = RouteRequest {
            method: "tools/call".to_string(),
            preferred_servers: vec![s2.id],
            ..Default::default()
        };

        for _ in 0..5 {
            let selected = router
                .route_candidates(vec![s1.clone(), s2.clone()], &req, &HashSet::new())
                .unwrap();
            assert_eq!(selected.id, s2.id);
        }
    }

    #[test]
    fn test_metrics_snapshot() {
        let router = router(RoutePolicy::Weighted);
        let id = Uuid::new_v4();

        router.record_result(id, Duration::from_millis(50), true);
        router.record_result(id, Duration::from_millis(150), false);

        let snapshot = router.server_metrics(id);
        assert_eq!(snapshot.total_requests, 2);
        assert!((snapshot.success_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.avg_response_time_ms - 100.0).abs() < 1e-9);
        assert_eq!(snapshot.circuit_breaker_state, "closed");
    }

    #[test]
    fn test_fnv1a_is_deterministic() {
        assert_eq!(fnv1a(b"t1:u1"), fnv1a(b"t1:u1"));
        assert_ne!(fnv1a(b"t1:u1"), fnv1a(b"t1:u2"));
    }
}
