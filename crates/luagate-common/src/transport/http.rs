//! HTTP Transport Utilities
//!
//! Conversions between hyper messages and JSON-RPC envelopes.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: request and response construction
//! - **[`HyperRequest`]**: Type alias for Hyper incoming requests
//! - **[`HyperResponse`]**: Type alias for Hyper responses
//!
//! # Example
//!
//! ```
//! use luagate_common::transport::http::HttpTransport;
//! use luagate_common::protocol::RpcResponse;
//! use hyper::StatusCode;
//! use serde_json::json;
//!
//! let response = RpcResponse::success(json!(1), json!({"result": 42}));
//! let http = HttpTransport::json_response(StatusCode::OK, &response, Some("session-1"));
//! assert_eq!(http.status(), StatusCode::OK);
//! ```

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::jsonrpc::RpcRequest;

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// Header carrying the caller's session id, echoed on every response.
pub const SESSION_HEADER: &str = "X-Session-UUID";

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Serializes `body` as JSON with the given status.
    pub fn json_response<T: Serialize>(
        status: StatusCode,
        body: &T,
        session: Option<&str>,
    ) -> HyperResponse {
        let encoded = serde_json::to_vec(body).unwrap_or_default();
        Self::build(status, Bytes::from(encoded), session)
    }

    /// A response with an empty body, used for notification-only calls.
    pub fn empty_response(status: StatusCode, session: Option<&str>) -> HyperResponse {
        Self::build(status, Bytes::new(), session)
    }

    fn build(status: StatusCode, body: Bytes, session: Option<&str>) -> HyperResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(value) = session.and_then(|s| HeaderValue::from_str(s).ok()) {
            headers.insert(SESSION_HEADER, value);
        }
        response
    }

    /// Build a JSON-RPC request
    ///
    /// A `None` id produces a notification.
    pub fn build_request(
        method: &str,
        params: Option<Value>,
        id: Option<Value>,
        context_version: &str,
    ) -> RpcRequest {
        RpcRequest::new(method, params, id, context_version)
    }
}
