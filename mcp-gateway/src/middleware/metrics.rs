//! Prometheus metric families for the gateway

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{Error, Result};

/// Latency buckets in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// All counter/gauge/histogram families emitted by the gateway
pub struct GatewayMetrics {
    registry: Registry,

    pub auth_events: IntCounterVec,
    pub token_refresh: IntCounterVec,
    pub request_duration: HistogramVec,
    pub rate_limit_hits: IntCounterVec,
    pub tool_calls: IntCounterVec,
    pub errors: IntCounterVec,
    pub concurrent_users: IntGaugeVec,
    pub active_connections: IntGauge,
    pub proxy_duration: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let auth_events = IntCounterVec::new(
            Opts::new("mcp_auth_events_total", "Authentication events"),
            &["user", "tenant", "result", "method"],
        )
        .map_err(internal)?;

        let token_refresh = IntCounterVec::new(
            Opts::new("mcp_token_refresh_total", "OAuth token refresh attempts"),
            &["user", "result"],
        )
        .map_err(internal)?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("mcp_request_duration_seconds", "Request duration")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "user", "tenant", "tool"],
        )
        .map_err(internal)?;

        let rate_limit_hits = IntCounterVec::new(
            Opts::new("mcp_rate_limit_hits_total", "Rate limit decisions"),
            &["user", "tenant", "limit_type", "action"],
        )
        .map_err(internal)?;

        let tool_calls = IntCounterVec::new(
            Opts::new("mcp_tool_calls_total", "Tool invocations"),
            &["tool", "user", "tenant", "result"],
        )
        .map_err(internal)?;

        let errors = IntCounterVec::new(
            Opts::new("mcp_errors_total", "Errors by class"),
            &["error_type", "user", "tenant", "method"],
        )
        .map_err(internal)?;

        let concurrent_users = IntGaugeVec::new(
            Opts::new("mcp_concurrent_users", "Users with in-flight requests"),
            &["tenant"],
        )
        .map_err(internal)?;

        let active_connections = IntGauge::new(
            "mcp_active_connections",
            "Active back-end connections across all servers",
        )
        .map_err(internal)?;

        let proxy_duration = Histogram::with_opts(
            HistogramOpts::new("mcp_proxy_forward_seconds", "Back-end forward duration")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )
        .map_err(internal)?;

        registry
            .register(Box::new(auth_events.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(token_refresh.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(rate_limit_hits.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(tool_calls.clone()))
            .map_err(internal)?;
        registry.register(Box::new(errors.clone())).map_err(internal)?;
        registry
            .register(Box::new(concurrent_users.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(active_connections.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(proxy_duration.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            auth_events,
            token_refresh,
            request_duration,
            rate_limit_hits,
            tool_calls,
            errors,
            concurrent_users,
            active_connections,
            proxy_duration,
        })
    }

    /// Record an authentication outcome
    pub fn record_auth_event(&self, user: &str, tenant: &str, result: &str, method: &str) {
        self.auth_events
            .with_label_values(&[user, tenant, result, method])
            .inc();
    }

    /// Record a rate-limit decision
    pub fn record_rate_limit_hit(&self, user: &str, tenant: &str, limit_type: &str, action: &str) {
        self.rate_limit_hits
            .with_label_values(&[user, tenant, limit_type, action])
            .inc();
    }

    /// Record a tool invocation outcome
    pub fn record_tool_call(&self, tool: &str, user: &str, tenant: &str, result: &str) {
        self.tool_calls
            .with_label_values(&[tool, user, tenant, result])
            .inc();
    }

    /// Record an error by class
    pub fn record_error(&self, error_type: &str, user: &str, tenant: &str, method: &str) {
        self.errors
            .with_label_values(&[error_type, user, tenant, method])
            .inc();
    }

    /// Observe a request duration in seconds
    pub fn observe_request(&self, method: &str, user: &str, tenant: &str, tool: &str, seconds: f64) {
        self.request_duration
            .with_label_values(&[method, user, tenant, tool])
            .observe(seconds);
    }

    /// Render the Prometheus exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(internal)
    }
}

fn internal<E: std::fmt::Display>(e: E) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_families_render() {
        let metrics = GatewayMetrics::new().unwrap();

        metrics.record_auth_event("u1", "t1", "success", "api_key");
        metrics.record_rate_limit_hit("u1", "t1", "user", "exceeded");
        metrics.record_tool_call("read_file", "u1", "t1", "success");
        metrics.record_error("proxy", "u1", "t1", "tools/call");
        metrics.observe_request("tools/call", "u1", "t1", "read_file", 0.042);
        metrics.active_connections.set(3);

        let output = metrics.render().unwrap();
        assert!(output.contains("mcp_auth_events_total"));
        assert!(output.contains("mcp_rate_limit_hits_total"));
        assert!(output.contains("mcp_tool_calls_total"));
        assert!(output.contains("mcp_errors_total"));
        assert!(output.contains("mcp_request_duration_seconds"));
        assert!(output.contains("mcp_active_connections 3"));
        // The duration histogram carries the full label set
        assert!(output.contains("tool=\"read_file\""));
        assert!(output.contains("user=\"u1\""));
    }

    #[test]
    fn test_rate_limit_labels() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_rate_limit_hit("anonymous", "unknown", "ddos_protection", "blocked");
        let output = metrics.render().unwrap();
        assert!(output.contains("ddos_protection"));
        assert!(output.contains("blocked"));
    }
}
