//! Authentication and authorization pipeline
//!
//! Two independent authentication paths produce the same [`UserContext`]:
//! API keys validated against the relational store, and OAuth bearer tokens
//! validated against the external identity provider's JWKS.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api_key;
pub mod oauth;
pub mod rbac;
pub mod refresh;

pub use api_key::ApiKeyValidator;
pub use oauth::OAuthValidator;
pub use rbac::ToolAccessPolicy;
pub use refresh::TokenRefreshService;

/// Authenticated caller identity attached to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Primary role; drives rate-limit tiers
    pub role: String,

    /// All roles carried by the identity; drives tool access control
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,

    #[serde(default)]
    pub permissions: Vec<String>,

    /// Per-key rate-limit override, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<i32>,

    /// How this identity was established: "api_key" or "oauth"
    pub auth_method: String,
}

impl UserContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role || self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_role_checks_both_fields() {
        let context = UserContext {
            user_id: "u1".to_string(),
            email: None,
            name: None,
            role: "user".to_string(),
            roles: vec!["server_owner".to_string()],
            tenant_id: None,
            api_key_id: None,
            permissions: vec![],
            rate_limit: None,
            auth_method: "api_key".to_string(),
        };

        assert!(context.has_role("user"));
        assert!(context.has_role("server_owner"));
        assert!(!context.has_role("admin"));
        assert!(!context.is_admin());
    }
}
