//! HTTP Server for the gateway
//!
//! hyper HTTP/1.1 front end. Each accepted connection runs on its own tokio
//! task; every request on the configured route is handed to the
//! [`Gateway`] together with the caller's identity.
//!
//! # Example
//!
//! ```no_run
//! use luagate_server::{Gateway, HttpServer, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::new();
//!     let gateway = Arc::new(Gateway::from_config(&config, tokio::runtime::Handle::current()));
//!     let server = HttpServer::from_config(&config, gateway);
//!     server.run(config.bind).await.unwrap();
//! }
//! ```

use http_body_util::{BodyExt, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use luagate_common::protocol::error::GatewayError;
use luagate_common::protocol::{RpcError, RpcResponse};
use luagate_common::transport::{HttpTransport, HyperRequest, HyperResponse, SESSION_HEADER};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::gateway::{Gateway, Reply};

struct Shared {
    gateway: Arc<Gateway>,
    route: String,
    max_body_bytes: usize,
}

/// HTTP server for the gateway.
pub struct HttpServer {
    gateway: Arc<Gateway>,
    route: String,
    max_body_bytes: usize,
    header_read_timeout: Duration,
}

impl HttpServer {
    pub fn new(gateway: Arc<Gateway>, route: impl Into<String>) -> Self {
        let defaults = ServerConfig::default();
        Self {
            gateway,
            route: route.into(),
            max_body_bytes: defaults.max_body_bytes,
            header_read_timeout: defaults.header_read_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig, gateway: Arc<Gateway>) -> Self {
        Self::new(gateway, config.route.clone())
            .with_header_read_timeout(config.header_read_timeout)
            .with_max_body_bytes(config.max_body_bytes)
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    /// Largest request body accepted; longer bodies fail to read.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Binds `addr` and serves until the listener fails.
    pub async fn run(self, addr: SocketAddr) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!(
            route = %self.route,
            node = %self.gateway.node_id(),
            "HTTP server listening on {}",
            local
        );

        let _sweeper = self.gateway.sessions().spawn_sweeper();
        let header_read_timeout = self.header_read_timeout;
        let shared = Arc::new(Shared {
            gateway: self.gateway,
            route: self.route,
            max_body_bytes: self.max_body_bytes,
        });

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| GatewayError::Transport(format!("Failed to accept connection: {}", e)))?;

            let io = TokioIo::new(stream);
            let shared = shared.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let shared = shared.clone();
                    async move { Ok::<_, Infallible>(handle_request(shared, peer, req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(header_read_timeout)
                    .serve_connection(io, service)
                    .await
                {
                    tracing::debug!(%peer, "Error serving connection: {}", err);
                }
            });
        }
    }
}

async fn handle_request(shared: Arc<Shared>, peer: SocketAddr, req: HyperRequest) -> HyperResponse {
    if req.uri().path() != shared.route {
        return HttpTransport::empty_response(StatusCode::NOT_FOUND, None);
    }

    let (session_id, minted) = match req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(id) => (id.to_string(), false),
        None => (uuid::Uuid::new_v4().to_string(), true),
    };

    if req.method() != Method::POST {
        let err = RpcResponse::error(Value::Null, RpcError::invalid_request())
            .stamp(shared.gateway.node_id(), minted.then_some(session_id.as_str()));
        return HttpTransport::json_response(StatusCode::METHOD_NOT_ALLOWED, &err, Some(&session_id));
    }

    let ctx = CallContext::new(session_id.clone())
        .minted(minted)
        .with_peer(peer)
        .with_headers(req.headers().clone());

    let body = Limited::new(req.into_body(), shared.max_body_bytes)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| GatewayError::Transport(format!("Failed to read request body: {}", e)));

    // Runs detached from the connection: a client hanging up must not release
    // the session while its script is still executing.
    let gateway = shared.gateway.clone();
    let outcome = match tokio::spawn(async move { gateway.handle(ctx, body).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(session = %session_id, "gateway task failed: {}", e);
            let err = RpcResponse::error(Value::Null, RpcError::internal_error())
                .stamp(shared.gateway.node_id(), minted.then_some(session_id.as_str()));
            return HttpTransport::json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &err,
                Some(&session_id),
            );
        }
    };
    match outcome.reply {
        Reply::Single(resp) => HttpTransport::json_response(outcome.status, &resp, Some(&session_id)),
        Reply::Batch(resps) => HttpTransport::json_response(outcome.status, &resps, Some(&session_id)),
        Reply::Empty => HttpTransport::empty_response(outcome.status, Some(&session_id)),
    }
}
