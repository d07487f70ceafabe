//! JSON-RPC 2.0 envelope types
//!
//! Absent fields are excluded from serialization so forwarded envelopes stay
//! byte-compatible with what the client sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A JSON-RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,

    /// String, integer or null per JSON-RPC 2.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Reject malformed envelopes before any routing work happens
    pub fn validate(&self) -> Result<()> {
        if self.jsonrpc != "2.0" {
            return Err(Error::ValidationError(format!(
                "Unsupported JSON-RPC version: {}",
                self.jsonrpc
            )));
        }
        if self.method.is_empty() {
            return Err(Error::ValidationError("Missing method".to_string()));
        }
        Ok(())
    }

    /// Name of the tool being invoked, for `tools/call` requests
    pub fn tool_name(&self) -> Option<&str> {
        if self.method != "tools/call" {
            return None;
        }
        self.params.as_ref()?.get("name")?.as_str()
    }
}

/// A JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    #[serde(default)]
    pub id: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error envelope from a gateway error, keyed to the request id
    pub fn from_error(id: Option<Value>, error: &Error) -> Self {
        let rpc = error.to_jsonrpc_error();
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: rpc["code"].as_i64().unwrap_or(crate::error::JSONRPC_INTERNAL_ERROR),
                message: rpc["message"].as_str().unwrap_or("Internal error").to_string(),
                data: rpc.get("data").cloned(),
            }),
        }
    }

    /// Method-not-found envelope
    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code: crate::error::JSONRPC_METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
                data: Some(serde_json::json!({ "method": method })),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": "r1",
            "method": "tools/call",
            "params": {"name": "read_file", "arguments": {"path": "/etc/hosts"}}
        });

        let request: JsonRpcRequest = serde_json::from_value(raw.clone()).unwrap();
        request.validate().unwrap();
        assert_eq!(request.tool_name(), Some("read_file"));

        let back = serde_json::to_value(&request).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_request_without_id_or_params_omits_fields() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "ping".to_string(),
            params: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let request = JsonRpcRequest {
            jsonrpc: "1.0".to_string(),
            id: Some(json!(1)),
            method: "ping".to_string(),
            params: None,
        };

        let err = request.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = Error::Timeout { timeout_secs: 30.0 };
        let response = JsonRpcResponse::from_error(Some(json!("r1")), &err);

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], "r1");
        assert_eq!(value["error"]["code"], -32603);
        assert_eq!(value["error"]["message"], "Request timeout");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_method_not_found() {
        let response = JsonRpcResponse::method_not_found(Some(json!(7)), "bogus/method");
        assert_eq!(response.error.as_ref().unwrap().code, -32601);
    }

    #[test]
    fn test_integer_id_preserved() {
        let raw = json!({"jsonrpc": "2.0", "id": 42, "method": "ping"});
        let request: JsonRpcRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.id, Some(json!(42)));
    }
}
