//! Role-based access control for tools and resources

use std::collections::HashMap;

use crate::error::{Error, Result};

use super::UserContext;

/// Resources under this scheme are restricted to administrators
const ADMIN_RESOURCE_SCHEME: &str = "config://";

/// Maps tool names to the roles allowed to invoke them
///
/// An empty role list means public access. The `server_owner` role is
/// granted dynamically when the caller registered the target server.
#[derive(Debug, Clone)]
pub struct ToolAccessPolicy {
    permissions: HashMap<String, Vec<String>>,
}

impl Default for ToolAccessPolicy {
    fn default() -> Self {
        let mut permissions = HashMap::new();
        permissions.insert("register_server".to_string(), vec!["admin".to_string()]);
        permissions.insert(
            "delete_server".to_string(),
            vec!["admin".to_string(), "server_owner".to_string()],
        );
        permissions.insert(
            "proxy_request".to_string(),
            vec!["user".to_string(), "admin".to_string()],
        );
        permissions.insert("list_servers".to_string(), vec![]);
        permissions.insert("health_check".to_string(), vec![]);
        Self { permissions }
    }
}

impl ToolAccessPolicy {
    pub fn new(permissions: HashMap<String, Vec<String>>) -> Self {
        Self { permissions }
    }

    /// Roles required for a tool; unknown tools are public
    pub fn required_roles(&self, tool_name: &str) -> &[String] {
        self.permissions
            .get(tool_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Enforce access control for one tool invocation
    ///
    /// `server_registered_by` is the registrant of the target server, used
    /// for the dynamic `server_owner` grant.
    pub fn check_tool_access(
        &self,
        tool_name: &str,
        user: Option<&UserContext>,
        server_registered_by: Option<&str>,
    ) -> Result<()> {
        let required = self.required_roles(tool_name);

        if required.is_empty() {
            return Ok(());
        }

        let Some(user) = user else {
            tracing::warn!("Unauthenticated access attempt to tool: {}", tool_name);
            return Err(Error::Unauthorized(format!(
                "Authentication required for tool: {}",
                tool_name
            )));
        };

        let mut roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        if !roles.contains(&user.role.as_str()) {
            roles.push(&user.role);
        }

        // Dynamic grant: registrant of the target server counts as owner
        if required.iter().any(|r| r == "server_owner")
            && !roles.contains(&"server_owner")
            && server_registered_by.is_some_and(|owner| owner == user.user_id)
        {
            roles.push("server_owner");
        }

        if !required.iter().any(|r| roles.contains(&r.as_str())) {
            tracing::warn!(
                "Access denied: user {} with roles {:?} attempted {} requiring {:?}",
                user.user_id,
                roles,
                tool_name,
                required
            );
            return Err(Error::Forbidden(format!(
                "Access denied: {} requires roles {:?}",
                tool_name, required
            )));
        }

        tracing::debug!("Access granted: {} -> {}", user.user_id, tool_name);
        Ok(())
    }

    /// Enforce access control for a resource read
    pub fn check_resource_access(&self, uri: &str, user: Option<&UserContext>) -> Result<()> {
        if !uri.starts_with(ADMIN_RESOURCE_SCHEME) {
            return Ok(());
        }

        match user {
            Some(user) if user.is_admin() => Ok(()),
            Some(_) => Err(Error::Forbidden(format!(
                "Access denied: {} requires roles [\"admin\"]",
                uri
            ))),
            None => Err(Error::Unauthorized(format!(
                "Authentication required for resource: {}",
                uri
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: &str, extra_roles: &[&str]) -> UserContext {
        UserContext {
            user_id: "u1".to_string(),
            email: None,
            name: None,
            role: role.to_string(),
            roles: extra_roles.iter().map(|r| r.to_string()).collect(),
            tenant_id: None,
            api_key_id: None,
            permissions: vec![],
            rate_limit: None,
            auth_method: "api_key".to_string(),
        }
    }

    #[test]
    fn test_public_tool_allows_anonymous() {
        let policy = ToolAccessPolicy::default();
        assert!(policy.check_tool_access("list_servers", None, None).is_ok());
        assert!(policy.check_tool_access("unknown_tool", None, None).is_ok());
    }

    #[test]
    fn test_proxy_request_allowed_for_user_role() {
        let policy = ToolAccessPolicy::default();
        let caller = user("user", &[]);
        assert!(policy
            .check_tool_access("proxy_request", Some(&caller), None)
            .is_ok());
    }

    #[test]
    fn test_register_server_denied_for_user_role() {
        let policy = ToolAccessPolicy::default();
        let caller = user("user", &[]);

        let err = policy
            .check_tool_access("register_server", Some(&caller), None)
            .unwrap_err();

        assert_eq!(err.error_code(), "AUTHORIZATION_ERROR");
        assert!(err.to_string().contains("admin"));
    }

    #[test]
    fn test_protected_tool_requires_authentication() {
        let policy = ToolAccessPolicy::default();
        let err = policy
            .check_tool_access("register_server", None, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTHENTICATION_ERROR");
    }

    #[test]
    fn test_dynamic_server_owner_grant() {
        let policy = ToolAccessPolicy::default();
        let caller = user("user", &[]);

        // The caller registered the target server
        assert!(policy
            .check_tool_access("delete_server", Some(&caller), Some("u1"))
            .is_ok());

        // Somebody else registered it
        let err = policy
            .check_tool_access("delete_server", Some(&caller), Some("u2"))
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTHORIZATION_ERROR");
    }

    #[test]
    fn test_config_resources_require_admin() {
        let policy = ToolAccessPolicy::default();

        assert!(policy
            .check_resource_access("config://settings", Some(&user("admin", &[])))
            .is_ok());

        let err = policy
            .check_resource_access("config://settings", Some(&user("user", &[])))
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTHORIZATION_ERROR");

        let err = policy
            .check_resource_access("config://settings", None)
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTHENTICATION_ERROR");

        assert!(policy
            .check_resource_access("files://anything", None)
            .is_ok());
    }
}
