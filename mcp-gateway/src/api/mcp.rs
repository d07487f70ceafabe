//! MCP plane: JSON-RPC proxy endpoints and authenticated tool surface
//!
//! Errors on this plane come back as JSON-RPC error envelopes, not HTTP
//! error bodies; the path-auth gate has already established identity.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::UserContext;
use crate::db::models::ServerFilter;
use crate::error::Error;
use crate::middleware::client_ip;
use crate::middleware::trace::RequestTrace;
use crate::proxy::{ProxyRequest, ProxyResponse};
use crate::ratelimit::RateIdentity;
use crate::state::AppState;

use super::rpc::{JsonRpcRequest, JsonRpcResponse};

/// Simple JSON-RPC proxy: forwards the envelope and returns the back-end's
/// envelope untouched
pub async fn simple_proxy(
    State(state): State<AppState>,
    user: Option<Extension<UserContext>>,
    headers: HeaderMap,
    Json(envelope): Json<JsonRpcRequest>,
) -> Json<Value> {
    let user = user.map(|Extension(context)| context);

    match run_proxy(&state, &headers, user.as_ref(), envelope, ProxyOptions::default()).await {
        Ok(response) => Json(response.envelope),
        Err((id, error)) => Json(
            serde_json::to_value(JsonRpcResponse::from_error(id, &error))
                .unwrap_or_else(|_| json!({})),
        ),
    }
}

/// Extension fields accepted by the advanced proxy; stripped before the
/// envelope is forwarded
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub required_tools: Vec<String>,

    #[serde(default)]
    pub required_resources: Vec<String>,

    #[serde(default)]
    pub preferred_servers: Vec<Uuid>,

    /// Seconds; zero is rejected
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AdvancedProxyBody {
    #[serde(flatten)]
    envelope: JsonRpcRequest,

    #[serde(flatten)]
    options: ProxyOptions,
}

/// Advanced proxy: capability filters and server preferences, response
/// augmented with forwarding metadata
pub async fn advanced_proxy(
    State(state): State<AppState>,
    user: Option<Extension<UserContext>>,
    headers: HeaderMap,
    Json(body): Json<AdvancedProxyBody>,
) -> Json<Value> {
    let user = user.map(|Extension(context)| context);

    match run_proxy(&state, &headers, user.as_ref(), body.envelope, body.options).await {
        Ok(response) => Json(augment_envelope(response)),
        Err((id, error)) => Json(
            serde_json::to_value(JsonRpcResponse::from_error(id, &error))
                .unwrap_or_else(|_| json!({})),
        ),
    }
}

/// Tools visible to the authenticated caller, aggregated across the tenant's
/// healthy servers
pub async fn list_tools(
    State(state): State<AppState>,
    user: Option<Extension<UserContext>>,
) -> Result<Json<Value>, Error> {
    let tenant_id = user.as_ref().and_then(|Extension(context)| context.tenant_id);

    let filter = ServerFilter {
        tenant_id,
        ..Default::default()
    };
    let servers = state.registry.find(&filter, true).await?;

    let tools: Vec<Value> = servers
        .iter()
        .flat_map(|server| {
            server.tools.iter().map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "server_id": server.id,
                    "server_name": server.name,
                })
            })
        })
        .collect();

    Ok(Json(json!({ "tools": tools })))
}

#[derive(Debug, Deserialize)]
pub struct InvokeToolBody {
    #[serde(default)]
    pub arguments: Value,

    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Invoke a single tool by name
pub async fn invoke_tool(
    State(state): State<AppState>,
    Path(tool_name): Path<String>,
    user: Option<Extension<UserContext>>,
    headers: HeaderMap,
    body: Option<Json<InvokeToolBody>>,
) -> Json<Value> {
    let user = user.map(|Extension(context)| context);
    let Json(body) = body.unwrap_or_default();

    let envelope = JsonRpcRequest::new(
        Uuid::new_v4().to_string(),
        "tools/call",
        Some(json!({ "name": tool_name, "arguments": body.arguments })),
    );

    let options = ProxyOptions {
        required_tools: vec![tool_name],
        timeout: body.timeout,
        ..Default::default()
    };

    match run_proxy(&state, &headers, user.as_ref(), envelope, options).await {
        Ok(response) => Json(augment_envelope(response)),
        Err((id, error)) => Json(
            serde_json::to_value(JsonRpcResponse::from_error(id, &error))
                .unwrap_or_else(|_| json!({})),
        ),
    }
}

impl Default for InvokeToolBody {
    fn default() -> Self {
        Self {
            arguments: json!({}),
            timeout: None,
        }
    }
}

/// Shared proxy pipeline: authorization, rate limiting, tracing, forward,
/// metric emission
async fn run_proxy(
    state: &AppState,
    headers: &HeaderMap,
    user: Option<&UserContext>,
    envelope: JsonRpcRequest,
    options: ProxyOptions,
) -> Result<ProxyResponse, (Option<Value>, Error)> {
    let request_id = envelope.id.clone();
    let method = envelope.method.clone();
    let tool = envelope.tool_name().map(String::from);

    let tenant_id = user.and_then(|context| context.tenant_id);
    let tenant_label = tenant_id
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_label = user
        .map(|context| context.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let mut trace = RequestTrace::new(
        method.clone(),
        user.map(|context| context.user_id.clone()),
        tenant_id.map(|t| t.to_string()),
    );

    let outcome = async {
        // Rate limiting runs ahead of authorization
        let span = trace.start_span("rate_limit");
        let identity = RateIdentity {
            user_id: user.map(|context| context.user_id.clone()),
            tenant_id,
            client_ip: client_ip(headers),
            role: user
                .map(|context| context.role.clone())
                .unwrap_or_else(|| "anonymous".to_string()),
        };
        let limit_result = state.rate_limiter.check(&identity).await;
        trace.finish_span(
            span,
            if limit_result.is_ok() { "completed" } else { "denied" },
        );
        limit_result.map_err(|e| (request_id.clone(), e))?;

        // Authorization: the proxy operation itself, then resource scheme
        // checks for resource reads
        let registrant = registrant_for(state, &options).await;
        state
            .tool_policy
            .check_tool_access("proxy_request", user, registrant.as_deref())
            .map_err(|e| (request_id.clone(), e))?;

        if method == "resources/read" {
            if let Some(uri) = envelope
                .params
                .as_ref()
                .and_then(|params| params.get("uri"))
                .and_then(Value::as_str)
            {
                state
                    .tool_policy
                    .check_resource_access(uri, user)
                    .map_err(|e| (request_id.clone(), e))?;
            }
        }

        // Forward
        let span = trace.start_span("proxy_forward");
        let proxy_request = ProxyRequest {
            envelope,
            tenant_id,
            user_id: user.map(|context| context.user_id.clone()),
            client_ip: identity.client_ip.clone(),
            user_agent: headers
                .get("user-agent")
                .and_then(|value| value.to_str().ok())
                .map(String::from),
            required_tools: options.required_tools.clone(),
            required_resources: options.required_resources.clone(),
            preferred_servers: options.preferred_servers.clone(),
            timeout_secs: options.timeout,
        };
        let result = state.proxy.proxy(proxy_request).await;
        trace.finish_span(
            span,
            if result.is_ok() { "completed" } else { "failed" },
        );

        result.map_err(|e| (request_id.clone(), e))
    }
    .await;

    match &outcome {
        Ok(response) => {
            state.metrics.observe_request(
                &method,
                &user_label,
                &tenant_label,
                tool.as_deref().unwrap_or("none"),
                response.response_time_ms / 1000.0,
            );
            if let Some(tool) = &tool {
                let result = if response.success { "success" } else { "error" };
                state
                    .metrics
                    .record_tool_call(tool, &user_label, &tenant_label, result);
            }
            state.traces.complete(
                trace,
                if response.success { "success" } else { "error" },
            );
        }
        Err((_, error)) => {
            state.metrics.record_error(
                error.error_class(),
                &user_label,
                &tenant_label,
                &method,
            );
            if let Some(tool) = &tool {
                state
                    .metrics
                    .record_tool_call(tool, &user_label, &tenant_label, "error");
            }
            state.traces.complete(trace, "error");
        }
    }

    outcome
}

/// Registrant of the single preferred server, for dynamic owner grants
async fn registrant_for(state: &AppState, options: &ProxyOptions) -> Option<String> {
    let [server_id] = options.preferred_servers.as_slice() else {
        return None;
    };

    state
        .registry
        .get(*server_id, None, false)
        .await
        .ok()
        .flatten()
        .and_then(|server| server.registered_by)
}

/// Merge forwarding metadata into the response envelope
fn augment_envelope(response: ProxyResponse) -> Value {
    let mut envelope = response.envelope;

    if let Some(map) = envelope.as_object_mut() {
        map.insert("server_id".to_string(), json!(response.server_id));
        map.insert(
            "response_time_ms".to_string(),
            json!(response.response_time_ms),
        );
        map.insert("success".to_string(), json!(response.success));
    }

    envelope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advanced_body_splits_extensions_from_envelope() {
        let body: AdvancedProxyBody = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "r1",
            "method": "tools/call",
            "params": {"name": "read_file", "arguments": {"path": "/etc/hosts"}},
            "required_tools": ["read_file"],
            "timeout": 15,
        }))
        .unwrap();

        assert_eq!(body.envelope.method, "tools/call");
        assert_eq!(body.options.required_tools, vec!["read_file".to_string()]);
        assert_eq!(body.options.timeout, Some(15.0));

        // The forwarded envelope carries no extension fields
        let forwarded = serde_json::to_value(&body.envelope).unwrap();
        assert!(forwarded.get("required_tools").is_none());
        assert!(forwarded.get("timeout").is_none());
    }

    #[test]
    fn test_augment_envelope() {
        let id = Uuid::new_v4();
        let response = ProxyResponse {
            envelope: json!({"jsonrpc": "2.0", "id": "r1", "result": {"ok": true}}),
            server_id: id,
            response_time_ms: 12.5,
            success: true,
            error: None,
        };

        let augmented = augment_envelope(response);
        assert_eq!(augmented["server_id"], json!(id));
        assert_eq!(augmented["response_time_ms"], 12.5);
        assert_eq!(augmented["success"], true);
        assert_eq!(augmented["result"]["ok"], true);
    }
}
