//! Health probing, one implementation per transport

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::db::models::{HealthStatus, ServerRecord, TransportType};

/// Probe a server's health over its native transport
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, server: &ServerRecord) -> HealthStatus;
}

/// Dispatches to the right probe for a server's transport
pub struct TransportProber {
    http: HttpProbe,
    websocket: WebSocketProbe,
    stdio: StdioProbe,
}

impl TransportProber {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            http: HttpProbe { client, timeout },
            websocket: WebSocketProbe { timeout },
            stdio: StdioProbe,
        }
    }

    pub async fn probe(&self, server: &ServerRecord) -> HealthStatus {
        let probe: &dyn HealthProbe = match server.transport_type {
            TransportType::Http => &self.http,
            TransportType::Websocket => &self.websocket,
            TransportType::Stdio | TransportType::Sse => &self.stdio,
        };
        probe.probe(server).await
    }
}

/// GET `<endpoint>/health` and classify the response
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, server: &ServerRecord) -> HealthStatus {
        let url = format!("{}/health", server.endpoint_url.trim_end_matches('/'));

        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Health check failed for server {}: {}", server.id, e);
                return HealthStatus::Unhealthy;
            }
        };

        if !response.status().is_success() {
            return HealthStatus::Unhealthy;
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(_) => return HealthStatus::Degraded,
        };

        classify_health_body(&body)
    }
}

/// A 200 with `status == "ok"` is healthy; any other 200 body is degraded
pub fn classify_health_body(body: &serde_json::Value) -> HealthStatus {
    if body.get("status").and_then(|s| s.as_str()) == Some("ok") {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

/// Open a WebSocket connection and exchange a ping frame
pub struct WebSocketProbe {
    timeout: Duration,
}

#[async_trait]
impl HealthProbe for WebSocketProbe {
    async fn probe(&self, server: &ServerRecord) -> HealthStatus {
        let ws_url = to_ws_url(&server.endpoint_url);

        let attempt = async {
            let (mut stream, _) = connect_async(&ws_url).await?;
            stream.send(Message::Ping(Vec::new().into())).await?;
            // Any frame back proves the peer is responsive
            let _ = stream.next().await;
            let _ = stream.close(None).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>(())
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(e)) => {
                tracing::debug!("WebSocket probe failed for server {}: {}", server.id, e);
                HealthStatus::Unhealthy
            }
            Err(_) => HealthStatus::Unhealthy,
        }
    }
}

/// stdio and SSE back-ends cannot be probed remotely
pub struct StdioProbe;

#[async_trait]
impl HealthProbe for StdioProbe {
    async fn probe(&self, _server: &ServerRecord) -> HealthStatus {
        HealthStatus::Unknown
    }
}

/// Rewrite an HTTP endpoint URL to its WebSocket equivalent
pub fn to_ws_url(endpoint_url: &str) -> String {
    endpoint_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_ok_body() {
        assert_eq!(
            classify_health_body(&json!({"status": "ok"})),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_classify_non_ok_body() {
        assert_eq!(
            classify_health_body(&json!({"status": "draining"})),
            HealthStatus::Degraded
        );
        assert_eq!(classify_health_body(&json!({})), HealthStatus::Degraded);
        assert_eq!(
            classify_health_body(&json!({"healthy": true})),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_ws_url_rewrite() {
        assert_eq!(to_ws_url("http://s:3001"), "ws://s:3001");
        assert_eq!(to_ws_url("https://s:3001/path"), "wss://s:3001/path");
        assert_eq!(to_ws_url("ws://already"), "ws://already");
    }
}
