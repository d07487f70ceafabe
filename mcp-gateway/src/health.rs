//! Liveness and readiness probes

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// Aggregate health: process liveness plus store connectivity
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_healthy = sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .is_ok();

    let redis_healthy = match &state.redis {
        Some(pool) => match pool.get().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut *conn)
                .await
                .is_ok(),
            Err(_) => false,
        },
        // Redis is optional; absence is not unhealthy
        None => true,
    };

    let healthy = db_healthy && redis_healthy;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "service": state.config.service.name,
        "checks": {
            "database": if db_healthy { "ok" } else { "unavailable" },
            "cache": if redis_healthy { "ok" } else { "unavailable" },
        },
        "monitored_servers": state.registry.probe_count(),
        "active_requests": state.proxy.active_requests().len(),
    });

    (status, Json(body))
}

/// Readiness: the gateway can route once the database answers
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ready = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();

    if ready {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
    }
}
