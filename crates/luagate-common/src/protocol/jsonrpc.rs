//! JSON-RPC 2.0 Protocol Types
//!
//! Wire types for the gateway. Requests carry the non-standard
//! `context-version` field that selects the back-end, and responses carry a
//! non-standard `data` block stamping the responding node, a random salt and a
//! checksum over the result-or-error payload.
//!
//! # Error Codes
//!
//! Standard JSON-RPC 2.0 error codes:
//! - `-32700`: Parse error
//! - `-32600`: Invalid Request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! Application-reserved codes:
//! - `-32010`: Invalid context version
//! - `-32020`: Invalid method format
//! - `-32021`: Method is missing
//! - `-32030`: The session is busy
//!
//! # Example
//!
//! ```
//! use luagate_common::protocol::jsonrpc::{RpcRequest, RpcResponse, RpcError};
//! use serde_json::json;
//!
//! let request: RpcRequest = serde_json::from_value(json!({
//!     "jsonrpc": "2.0",
//!     "id": 1,
//!     "method": "users.create",
//!     "context-version": "v1",
//!     "params": {"name": "a"}
//! })).unwrap();
//! assert!(!request.is_notification());
//!
//! let response = RpcResponse::success(json!(1), json!({"id": 1}))
//!     .stamp("node-a", None);
//! assert!(response.data.is_some());
//!
//! let error = RpcResponse::error(json!(1), RpcError::method_not_found());
//! assert_eq!(error.error.unwrap().code, -32601);
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The only protocol version tag the gateway accepts.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request.
///
/// `id` and `params` are optional. A JSON `null` id is treated the same as a
/// missing one, which makes the call a notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    /// JSON-RPC version (must be "2.0")
    #[serde(default)]
    pub jsonrpc: String,
    /// Correlation identifier; absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Dotted method name
    #[serde(default)]
    pub method: String,
    /// Parameter values (array or object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Selects the registered back-end that handles the call
    #[serde(rename = "context-version", default)]
    pub context_version: String,
}

impl RpcRequest {
    /// Builds a request with version "2.0".
    pub fn new(
        method: impl Into<String>,
        params: Option<Value>,
        id: Option<Value>,
        context_version: impl Into<String>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
            context_version: context_version.into(),
        }
    }

    /// A call without a correlation id never receives a response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
///
/// Exactly one of `result` and `error` is present. A successful call whose
/// result is `null` still serializes `"result": null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Correlation identifier echoed from the request, `null` if unknown
    #[serde(default)]
    pub id: Value,
    /// Result value on success
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub result: Option<Value>,
    /// Error object on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Envelope-integrity stamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Keeps `"result": null` distinguishable from a missing `result`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Non-standard `data` block attached to every response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseData {
    /// Identity of the node that produced the response
    #[serde(rename = "responsible-node")]
    pub responsible_node: String,
    /// Random per-response salt (UUID v4)
    pub salt: String,
    /// Hex SHA-256 of the compact JSON of the result or error payload
    pub checksum: String,
    /// Present when the server minted the caller's session id
    #[serde(
        rename = "new-session-uuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub new_session_uuid: Option<String>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    /// Error code
    pub code: i32,
    /// Short description of the error
    pub message: String,
    /// Additional data (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;

// Application-reserved codes
/// The `context-version` does not name a registered back-end
pub const INVALID_CONTEXT_VERSION: i32 = -32010;
/// The method name contains characters outside the allow-list
pub const INVALID_METHOD_FORMAT: i32 = -32020;
/// The method name is empty
pub const METHOD_MISSING: i32 = -32021;
/// Another call holding the same session id is still in flight
pub const SESSION_BUSY: i32 = -32030;

impl RpcError {
    /// Creates an error with an arbitrary code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a structured data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params() -> Self {
        Self::new(INVALID_PARAMS, "Invalid params")
    }

    /// Create an internal error (-32603)
    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR, "Internal error")
    }

    /// Internal error reported when a back-end panicked.
    pub fn panic() -> Self {
        Self::new(INTERNAL_ERROR, "Internal server error (panic)")
    }

    /// Create an invalid context version error (-32010)
    pub fn invalid_context_version() -> Self {
        Self::new(INVALID_CONTEXT_VERSION, "Invalid context version")
    }

    /// Create an invalid method format error (-32020)
    pub fn invalid_method_format() -> Self {
        Self::new(INVALID_METHOD_FORMAT, "Invalid method format")
    }

    /// Create a method missing error (-32021)
    pub fn method_missing() -> Self {
        Self::new(METHOD_MISSING, "Method is missing")
    }

    /// Create a session busy error (-32030)
    pub fn session_busy() -> Self {
        Self::new(SESSION_BUSY, "The session is busy")
    }
}

impl RpcResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
            data: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
            data: None,
        }
    }

    /// The value the checksum is computed over: the result, or the error object.
    pub fn payload(&self) -> Value {
        match (&self.result, &self.error) {
            (_, Some(error)) => serde_json::to_value(error).unwrap_or(Value::Null),
            (Some(result), None) => result.clone(),
            (None, None) => Value::Null,
        }
    }

    /// Attaches the envelope-integrity stamp with a fresh salt.
    pub fn stamp(mut self, node: &str, new_session: Option<&str>) -> Self {
        self.data = Some(ResponseData {
            responsible_node: node.to_string(),
            salt: uuid::Uuid::new_v4().to_string(),
            checksum: checksum(&self.payload()),
            new_session_uuid: new_session.map(str::to_string),
        });
        self
    }

    /// Recomputes the checksum and compares it with the stamped one.
    pub fn verify_checksum(&self) -> bool {
        self.data
            .as_ref()
            .map(|data| data.checksum == checksum(&self.payload()))
            .unwrap_or(false)
    }
}

/// Hex SHA-256 over the compact JSON encoding of `value`.
pub fn checksum(value: &Value) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}
