//! Record types shared between the DAO and the service layer
//!
//! Relationships are expressed as owned collections plus id back-references;
//! API responses never traverse deeper than server -> tools/resources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;

/// Transport protocol of a registered MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TransportType {
    Http,
    Websocket,
    Stdio,
    Sse,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Websocket => write!(f, "websocket"),
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Health state of a registered server, owned by the probe loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
    Maintenance,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
            Self::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Tenant lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Disabled,
}

/// User role projected from the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
    Service,
    Readonly,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Service => "service",
            Self::Readonly => "readonly",
        }
    }
}

/// Declared capability set of a server: optional tool names and resource
/// URI patterns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
}

impl CapabilitySet {
    pub fn is_empty(&self) -> bool {
        self.tools.as_ref().is_none_or(|t| t.is_empty())
            && self.resources.as_ref().is_none_or(|r| r.is_empty())
    }
}

/// A registered MCP server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerRecord {
    pub id: Uuid,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,

    /// Endpoint URL; never mutated after creation
    pub endpoint_url: String,
    pub transport_type: TransportType,

    pub capabilities: Json<CapabilitySet>,
    pub tags: Json<Vec<String>>,

    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_metadata: Json<serde_json::Value>,

    /// Cached performance snapshot; advisory only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,

    /// User id of the registrant; drives dynamic server_owner grants
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_by: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Hydrated tool rows; empty unless hydration was requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[sqlx(skip)]
    pub tools: Vec<ToolRecord>,

    /// Hydrated resource rows; empty unless hydration was requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[sqlx(skip)]
    pub resources: Vec<ResourceRecord>,
}

impl ServerRecord {
    /// Names of the tools this server exposes (hydrated rows first,
    /// declared capabilities otherwise)
    pub fn tool_names(&self) -> Vec<&str> {
        if !self.tools.is_empty() {
            self.tools.iter().map(|t| t.name.as_str()).collect()
        } else {
            self.capabilities
                .tools
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(String::as_str)
                .collect()
        }
    }

    /// Resource URI templates this server exposes
    pub fn resource_templates(&self) -> Vec<&str> {
        if !self.resources.is_empty() {
            self.resources
                .iter()
                .map(|r| r.uri_template.as_str())
                .collect()
        } else {
            self.capabilities
                .resources
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(String::as_str)
                .collect()
        }
    }
}

/// A tool exposed by a registered server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ToolRecord {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tool_schema: Json<serde_json::Value>,
}

/// A resource exposed by a registered server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub server_id: Uuid,
    pub uri_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// An API key joined with its owning user, as returned by the lookup query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyIdentity {
    pub api_key_id: String,
    pub key_name: Option<String>,
    pub user_id: String,
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub role: String,
    pub tenant_id: Option<Uuid>,
    pub permissions: Vec<String>,
    pub rate_limit: Option<i32>,
}

/// One handled request; immutable once written
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRow {
    pub request_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub method: String,
    pub path: String,
    pub target_server_id: Option<Uuid>,
    pub request_time: DateTime<Utc>,
    pub duration_ms: Option<f64>,
    pub status_code: Option<i32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// Sanitized request/response echo and outcome flags
    pub request_metadata: serde_json::Value,
}

/// Filter for registry find operations
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    /// Exact server name
    pub name: Option<String>,
    /// Server must expose all of these tool names
    pub tools: Vec<String>,
    /// Server must match any of these resource URI prefixes
    pub resources: Vec<String>,
    /// Server must carry all of these tags
    pub tags: Vec<String>,
    pub health_status: Option<HealthStatus>,
    pub tenant_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_empty() {
        assert!(CapabilitySet::default().is_empty());
        assert!(CapabilitySet {
            tools: Some(vec![]),
            resources: None,
        }
        .is_empty());
        assert!(!CapabilitySet {
            tools: Some(vec!["read_file".to_string()]),
            resources: None,
        }
        .is_empty());
    }

    #[test]
    fn test_capability_serialization_omits_absent_fields() {
        let caps = CapabilitySet {
            tools: Some(vec!["read_file".to_string()]),
            resources: None,
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert!(json.get("resources").is_none());
        assert_eq!(json["tools"][0], "read_file");
    }

    #[test]
    fn test_transport_round_trip() {
        let t: TransportType = serde_json::from_str("\"websocket\"").unwrap();
        assert_eq!(t, TransportType::Websocket);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"websocket\"");
        assert_eq!(t.to_string(), "websocket");
    }

    #[test]
    fn test_health_status_round_trip() {
        let h: HealthStatus = serde_json::from_str("\"healthy\"").unwrap();
        assert_eq!(h, HealthStatus::Healthy);
        assert_eq!(h.to_string(), "healthy");
    }
}
