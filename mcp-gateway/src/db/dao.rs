//! Narrow DAO over the relational store
//!
//! The service layer talks to Postgres exclusively through these functions.
//! Request-log appends are best-effort: failures are logged and swallowed so
//! persistence trouble never reaches the client path.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::models::{
    ApiKeyIdentity, CapabilitySet, HealthStatus, RequestLogRow, ResourceRecord, ServerFilter,
    ServerRecord, ToolRecord, TransportType,
};
use crate::error::{Error, Result};

const SERVER_COLUMNS: &str = "id, name, description, version, endpoint_url, transport_type, \
     capabilities, tags, health_status, last_health_check, health_metadata, \
     avg_response_time, success_rate, active_connections, tenant_id, registered_by, \
     created_at, updated_at";

/// Fields required to persist a new server record
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub endpoint_url: String,
    pub transport_type: TransportType,
    pub capabilities: CapabilitySet,
    pub tags: Vec<String>,
    pub tenant_id: Option<Uuid>,
    pub registered_by: Option<String>,
}

/// Check whether `(tenant_id, name)` is already taken
pub async fn server_name_exists(
    pool: &PgPool,
    name: &str,
    tenant_id: Option<Uuid>,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM mcp_servers WHERE name = $1 AND tenant_id IS NOT DISTINCT FROM $2)",
    )
    .bind(name)
    .bind(tenant_id)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Insert a new server record and return the persisted row
pub async fn insert_server(pool: &PgPool, new: &NewServer) -> Result<ServerRecord> {
    let query = format!(
        "INSERT INTO mcp_servers \
         (id, name, description, version, endpoint_url, transport_type, capabilities, tags, \
          health_status, health_metadata, tenant_id, registered_by, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) \
         RETURNING {SERVER_COLUMNS}"
    );

    let now = Utc::now();
    let server = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.version)
        .bind(&new.endpoint_url)
        .bind(new.transport_type)
        .bind(Json(new.capabilities.clone()))
        .bind(Json(new.tags.clone()))
        .bind(HealthStatus::Unknown)
        .bind(Json(serde_json::Value::Object(Default::default())))
        .bind(new.tenant_id)
        .bind(&new.registered_by)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(server)
}

/// Delete a server and its owned tool/resource rows
pub async fn delete_server(pool: &PgPool, id: Uuid, tenant_id: Option<Uuid>) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM server_tools WHERE server_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM server_resources WHERE server_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    let result = if let Some(tenant) = tenant_id {
        sqlx::query("DELETE FROM mcp_servers WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant)
            .execute(&mut *tx)
            .await?
    } else {
        sqlx::query("DELETE FROM mcp_servers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
    };

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(Error::ServerNotFound(id));
    }

    tx.commit().await?;
    Ok(())
}

/// Fetch a single server by id, optionally scoped to a tenant
pub async fn get_server(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Option<Uuid>,
    hydrate: bool,
) -> Result<Option<ServerRecord>> {
    let query = format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers \
         WHERE id = $1 AND ($2::uuid IS NULL OR tenant_id = $2)"
    );

    let server = sqlx::query_as::<_, ServerRecord>(&query)
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;

    match server {
        Some(mut server) => {
            if hydrate {
                hydrate_servers(pool, std::slice::from_mut(&mut server)).await?;
            }
            Ok(Some(server))
        }
        None => Ok(None),
    }
}

/// Find servers matching the filter
///
/// Tool names are an intersection (the server must expose all of them);
/// resource patterns are a union of prefix matches; tags are an
/// intersection via JSONB containment.
pub async fn find_servers(
    pool: &PgPool,
    filter: &ServerFilter,
    hydrate: bool,
) -> Result<Vec<ServerRecord>> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE 1 = 1"
    ));

    if let Some(name) = &filter.name {
        builder.push(" AND name = ").push_bind(name.clone());
    }

    if let Some(tenant_id) = filter.tenant_id {
        builder.push(" AND tenant_id = ").push_bind(tenant_id);
    }

    if let Some(status) = filter.health_status {
        builder.push(" AND health_status = ").push_bind(status);
    }

    for tag in &filter.tags {
        builder
            .push(" AND tags @> ")
            .push_bind(Json(vec![tag.clone()]));
    }

    if !filter.tools.is_empty() {
        builder
            .push(
                " AND id IN (SELECT server_id FROM server_tools WHERE name = ANY(",
            )
            .push_bind(filter.tools.clone())
            .push(
                ") GROUP BY server_id HAVING COUNT(DISTINCT name) = ",
            )
            .push_bind(filter.tools.len() as i64)
            .push(")");
    }

    if !filter.resources.is_empty() {
        builder.push(" AND id IN (SELECT server_id FROM server_resources WHERE ");
        let mut first = true;
        for resource in &filter.resources {
            if !first {
                builder.push(" OR ");
            }
            first = false;
            builder
                .push("uri_template LIKE ")
                .push_bind(format!("{}%", resource));
        }
        builder.push(")");
    }

    builder.push(" ORDER BY created_at");

    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ").push_bind(limit);
    }

    let mut servers = builder
        .build_query_as::<ServerRecord>()
        .fetch_all(pool)
        .await?;

    if hydrate && !servers.is_empty() {
        hydrate_servers(pool, &mut servers).await?;
    }

    Ok(servers)
}

/// Attach tool and resource rows to the given servers
async fn hydrate_servers(pool: &PgPool, servers: &mut [ServerRecord]) -> Result<()> {
    let ids: Vec<Uuid> = servers.iter().map(|s| s.id).collect();

    let tools = sqlx::query_as::<_, ToolRecord>(
        "SELECT id, server_id, name, description, tool_schema \
         FROM server_tools WHERE server_id = ANY($1) ORDER BY name",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let resources = sqlx::query_as::<_, ResourceRecord>(
        "SELECT id, server_id, uri_template, name, description, mime_type \
         FROM server_resources WHERE server_id = ANY($1) ORDER BY uri_template",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    for server in servers.iter_mut() {
        server.tools = tools
            .iter()
            .filter(|t| t.server_id == server.id)
            .cloned()
            .collect();
        server.resources = resources
            .iter()
            .filter(|r| r.server_id == server.id)
            .cloned()
            .collect();
    }

    Ok(())
}

/// Update health status, metadata and the probe liveness timestamp
pub async fn mark_server_health(
    pool: &PgPool,
    id: Uuid,
    status: HealthStatus,
    metadata: Option<serde_json::Value>,
    ts: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE mcp_servers SET health_status = $2, last_health_check = $3, \
         health_metadata = COALESCE($4, health_metadata), updated_at = $3 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(status)
    .bind(ts)
    .bind(metadata.map(Json))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Refresh the advisory performance snapshot on a server row
pub async fn update_perf_snapshot(
    pool: &PgPool,
    id: Uuid,
    avg_response_time_ms: f64,
    success_rate: f64,
    active_connections: i32,
) -> Result<()> {
    sqlx::query(
        "UPDATE mcp_servers SET avg_response_time = $2, success_rate = $3, \
         active_connections = $4, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(avg_response_time_ms)
    .bind(success_rate)
    .bind(active_connections)
    .execute(pool)
    .await?;

    Ok(())
}

/// Replace the owned tool and resource rows for a server with the
/// discovered capability set
pub async fn replace_capabilities(
    pool: &PgPool,
    server_id: Uuid,
    tools: &[(String, Option<String>, serde_json::Value)],
    resources: &[(String, Option<String>, Option<String>, Option<String>)],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM server_tools WHERE server_id = $1")
        .bind(server_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM server_resources WHERE server_id = $1")
        .bind(server_id)
        .execute(&mut *tx)
        .await?;

    for (name, description, schema) in tools {
        sqlx::query(
            "INSERT INTO server_tools (id, server_id, name, description, tool_schema) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (server_id, name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(server_id)
        .bind(name)
        .bind(description)
        .bind(Json(schema.clone()))
        .execute(&mut *tx)
        .await?;
    }

    for (uri_template, name, description, mime_type) in resources {
        sqlx::query(
            "INSERT INTO server_resources (id, server_id, uri_template, name, description, mime_type) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (server_id, uri_template) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(server_id)
        .bind(uri_template)
        .bind(name)
        .bind(description)
        .bind(mime_type)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Append a request-log row. Best-effort: failures are logged, never raised.
pub async fn append_request_log(pool: &PgPool, row: &RequestLogRow) {
    let result = sqlx::query(
        "INSERT INTO request_logs \
         (id, request_id, user_id, tenant_id, ip_address, method, path, target_server_id, \
          request_time, duration_ms, status_code, error_type, error_message, request_metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(Uuid::new_v4())
    .bind(&row.request_id)
    .bind(&row.user_id)
    .bind(row.tenant_id)
    .bind(&row.ip_address)
    .bind(&row.method)
    .bind(&row.path)
    .bind(row.target_server_id)
    .bind(row.request_time)
    .bind(row.duration_ms)
    .bind(row.status_code)
    .bind(&row.error_type)
    .bind(&row.error_message)
    .bind(Json(row.request_metadata.clone()))
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::error!("Failed to log request {}: {}", row.request_id, e);
    }
}

/// Look up an API key by its SHA-256 digest, joined with the owning user.
///
/// Only enabled, unexpired keys are returned.
pub async fn lookup_api_key(pool: &PgPool, key_hash: &str) -> Result<Option<ApiKeyIdentity>> {
    let row = sqlx::query(
        "SELECT ak.id, ak.name, ak.user_id, ak.tenant_id, ak.permissions, ak.rate_limit, \
                u.email, u.name AS user_name, u.role \
         FROM api_keys ak \
         INNER JOIN users u ON ak.user_id = u.id \
         WHERE ak.key_hash = $1 \
           AND ak.enabled = TRUE \
           AND (ak.expires_at IS NULL OR ak.expires_at > NOW())",
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let permissions: Json<Vec<String>> = row.try_get("permissions").unwrap_or(Json(Vec::new()));

    Ok(Some(ApiKeyIdentity {
        api_key_id: row.try_get("id")?,
        key_name: row.try_get("name").ok(),
        user_id: row.try_get("user_id")?,
        email: row.try_get("email").ok(),
        user_name: row.try_get("user_name").ok(),
        role: row
            .try_get::<Option<String>, _>("role")?
            .unwrap_or_else(|| "user".to_string()),
        tenant_id: row.try_get("tenant_id").ok().flatten(),
        permissions: permissions.0,
        rate_limit: row.try_get("rate_limit").ok().flatten(),
    }))
}

/// Update the last-used timestamp on an API key
pub async fn touch_api_key(pool: &PgPool, api_key_id: &str) -> Result<()> {
    sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
        .bind(api_key_id)
        .execute(pool)
        .await?;

    Ok(())
}
