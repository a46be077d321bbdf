//! JSON-RPC routing: session admission, envelope parsing, batch fan-out.
//!
//! The gateway sits between the HTTP server and the context back-ends. It
//! never sees sockets; [`HttpServer`](crate::http_server::HttpServer) hands
//! it the caller identity and the raw body, and writes back whatever
//! [`GatewayOutcome`] it returns.

use futures::future::join_all;
use futures::FutureExt;
use hyper::body::Bytes;
use hyper::StatusCode;
use luagate_common::protocol::{
    BatchMember, Envelope, GatewayError, RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION,
};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::backend::{ContextBackend, ScriptBackend};
use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::session::{SessionConfig, SessionManager};

/// What to write back for one HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Single(RpcResponse),
    Batch(Vec<RpcResponse>),
    /// Nothing to answer (a lone notification)
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOutcome {
    pub status: StatusCode,
    pub reply: Reply,
}

impl GatewayOutcome {
    fn ok(reply: Reply) -> Self {
        Self {
            status: StatusCode::OK,
            reply,
        }
    }
}

pub struct Gateway {
    backends: HashMap<String, Arc<dyn ContextBackend>>,
    sessions: SessionManager,
    node_id: String,
}

impl Gateway {
    pub fn new(node_id: impl Into<String>, sessions: SessionManager) -> Self {
        Self {
            backends: HashMap::new(),
            sessions,
            node_id: node_id.into(),
        }
    }

    /// Registers `backend` under its context version, replacing any previous one.
    pub fn with_backend(mut self, backend: Arc<dyn ContextBackend>) -> Self {
        self.backends.insert(backend.version().to_string(), backend);
        self
    }

    /// Gateway with the scripted back-end and a session registry from `config`.
    pub fn from_config(config: &ServerConfig, runtime: Handle) -> Self {
        let sessions = SessionManager::new(SessionConfig::new(
            config.session_ttl,
            config.sweep_interval,
        ));
        Self::new(config.node_id.clone(), sessions)
            .with_backend(Arc::new(ScriptBackend::from_config(config, runtime)))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Handles one HTTP request body on behalf of `ctx`'s session.
    pub async fn handle(&self, ctx: CallContext, body: Result<Bytes, GatewayError>) -> GatewayOutcome {
        let ctx = Arc::new(ctx);

        let Some(_guard) = self.sessions.try_admit(&ctx.session_id) else {
            warn!(session = %ctx.session_id, "session busy");
            let busy = RpcResponse::error(Value::Null, RpcError::session_busy());
            return GatewayOutcome::ok(Reply::Single(self.stamp(&ctx, busy)));
        };

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                let err = RpcResponse::error(Value::Null, RpcError::internal_error());
                return GatewayOutcome {
                    status: StatusCode::BAD_REQUEST,
                    reply: Reply::Single(self.stamp(&ctx, err)),
                };
            }
        };

        let envelope = match Envelope::parse(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "unparseable request body");
                let err = RpcResponse::error(Value::Null, RpcError::parse_error());
                return GatewayOutcome {
                    status: StatusCode::BAD_REQUEST,
                    reply: Reply::Single(self.stamp(&ctx, err)),
                };
            }
        };

        match envelope {
            Envelope::Single(req) => match self.route(ctx.clone(), req).await {
                Some(resp) => GatewayOutcome::ok(Reply::Single(self.stamp(&ctx, resp))),
                None => GatewayOutcome::ok(Reply::Empty),
            },
            Envelope::Batch(members) if members.is_empty() => {
                let err = RpcResponse::error(Value::Null, RpcError::invalid_request());
                GatewayOutcome::ok(Reply::Single(self.stamp(&ctx, err)))
            }
            Envelope::Batch(members) => {
                debug!(session = %ctx.session_id, size = members.len(), "dispatching batch");
                let calls = members.into_iter().map(|member| {
                    let ctx = ctx.clone();
                    async move {
                        match member {
                            BatchMember::Call(req) => self.route(ctx, req).await,
                            BatchMember::Invalid => Some(RpcResponse::error(
                                Value::Null,
                                RpcError::invalid_request(),
                            )),
                        }
                    }
                });
                let responses = join_all(calls)
                    .await
                    .into_iter()
                    .flatten()
                    .map(|resp| self.stamp(&ctx, resp))
                    .collect();
                GatewayOutcome::ok(Reply::Batch(responses))
            }
        }
    }

    /// Validates and dispatches one call. `None` for notifications.
    pub async fn route(&self, ctx: Arc<CallContext>, req: RpcRequest) -> Option<RpcResponse> {
        let id = req.id.clone();

        if req.jsonrpc != JSONRPC_VERSION {
            return id.map(|id| RpcResponse::error(id, RpcError::invalid_request()));
        }
        let Some(backend) = self.backends.get(&req.context_version).cloned() else {
            debug!(version = %req.context_version, "unknown context version");
            return id.map(|id| RpcResponse::error(id, RpcError::invalid_context_version()));
        };

        let method = req.method.clone();
        let call = AssertUnwindSafe(async move { backend.handle(ctx, req).await }).catch_unwind();

        let Some(id) = id else {
            tokio::spawn(async move {
                if let Err(panic) = call.await {
                    error!(%method, panic = %panic_message(&panic), "notification handler panicked");
                }
            });
            return None;
        };

        Some(match call.await {
            Ok(resp) => resp,
            Err(panic) => {
                error!(%method, panic = %panic_message(&panic), "back-end panicked");
                RpcResponse::error(id, RpcError::panic())
            }
        })
    }

    fn stamp(&self, ctx: &CallContext, resp: RpcResponse) -> RpcResponse {
        let minted = ctx.minted_session.then_some(ctx.session_id.as_str());
        resp.stamp(&self.node_id, minted)
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use luagate_common::protocol::jsonrpc::{
        INTERNAL_ERROR, INVALID_CONTEXT_VERSION, INVALID_REQUEST, PARSE_ERROR, SESSION_BUSY,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    /// Echoes params back as the result.
    struct Echo;

    impl ContextBackend for Echo {
        fn version(&self) -> &str {
            "v1"
        }

        fn handle(self: Arc<Self>, _ctx: Arc<CallContext>, req: RpcRequest) -> BoxFuture<'static, RpcResponse> {
            Box::pin(async move {
                RpcResponse::success(req.id.unwrap_or(Value::Null), req.params.unwrap_or(Value::Null))
            })
        }
    }

    struct Panics;

    async fn explode() -> RpcResponse {
        panic!("handler exploded")
    }

    impl ContextBackend for Panics {
        fn version(&self) -> &str {
            "boom"
        }

        fn handle(self: Arc<Self>, _ctx: Arc<CallContext>, _req: RpcRequest) -> BoxFuture<'static, RpcResponse> {
            Box::pin(explode())
        }
    }

    /// Reports each call and then parks until released.
    struct Gate {
        entered: mpsc::UnboundedSender<String>,
        release: Arc<Notify>,
    }

    impl ContextBackend for Gate {
        fn version(&self) -> &str {
            "gate"
        }

        fn handle(self: Arc<Self>, _ctx: Arc<CallContext>, req: RpcRequest) -> BoxFuture<'static, RpcResponse> {
            Box::pin(async move {
                let _ = self.entered.send(req.method.clone());
                self.release.notified().await;
                RpcResponse::success(req.id.unwrap_or(Value::Null), json!("released"))
            })
        }
    }

    fn gateway() -> Gateway {
        Gateway::new("node-test", SessionManager::new(SessionConfig::default()))
            .with_backend(Arc::new(Echo))
            .with_backend(Arc::new(Panics))
    }

    fn body(value: Value) -> Result<Bytes, GatewayError> {
        Ok(Bytes::from(value.to_string()))
    }

    fn single(outcome: GatewayOutcome) -> RpcResponse {
        match outcome.reply {
            Reply::Single(resp) => resp,
            other => panic!("expected single reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_call_echoes_id() {
        let outcome = gateway()
            .handle(
                CallContext::new("s1"),
                body(json!({"jsonrpc": "2.0", "id": 1, "method": "x", "context-version": "v1", "params": {"a": 1}})),
            )
            .await;
        assert_eq!(outcome.status, StatusCode::OK);
        let resp = single(outcome);
        assert_eq!(resp.id, json!(1));
        assert_eq!(resp.result, Some(json!({"a": 1})));
        assert!(resp.verify_checksum());
        let data = resp.data.unwrap();
        assert_eq!(data.responsible_node, "node-test");
        assert!(data.new_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_minted_session_is_reported() {
        let ctx = CallContext::new("fresh").minted(true);
        let resp = single(
            gateway()
                .handle(ctx, body(json!({"jsonrpc": "2.0", "id": 1, "method": "x", "context-version": "v1"})))
                .await,
        );
        assert_eq!(resp.data.unwrap().new_session_uuid.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_parse_error_has_null_id() {
        let outcome = gateway()
            .handle(CallContext::new("s1"), Ok(Bytes::from_static(b"{not json")))
            .await;
        assert_eq!(outcome.status, StatusCode::BAD_REQUEST);
        let resp = single(outcome);
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_body_read_failure() {
        let outcome = gateway()
            .handle(
                CallContext::new("s1"),
                Err(GatewayError::Transport("connection reset".into())),
            )
            .await;
        assert_eq!(outcome.status, StatusCode::BAD_REQUEST);
        assert_eq!(single(outcome).error.unwrap().code, INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_wrong_version_keeps_id() {
        let resp = single(
            gateway()
                .handle(
                    CallContext::new("s1"),
                    body(json!({"jsonrpc": "1.0", "id": "abc", "method": "x", "context-version": "v1"})),
                )
                .await,
        );
        assert_eq!(resp.id, json!("abc"));
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_context_version() {
        let resp = single(
            gateway()
                .handle(
                    CallContext::new("s1"),
                    body(json!({"jsonrpc": "2.0", "id": 1, "method": "x", "context-version": "v9"})),
                )
                .await,
        );
        assert_eq!(resp.id, json!(1));
        assert_eq!(resp.error.unwrap().code, INVALID_CONTEXT_VERSION);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let gw = gateway();
        let resp = single(
            gw.handle(
                CallContext::new("s1"),
                body(json!({"jsonrpc": "2.0", "id": 5, "method": "x", "context-version": "boom"})),
            )
            .await,
        );
        assert_eq!(resp.id, json!(5));
        let err = resp.error.unwrap();
        assert_eq!(err, RpcError::panic());
        assert!(!gw.sessions().is_busy("s1"));
    }

    #[tokio::test]
    async fn test_notification_has_no_reply() {
        let outcome = gateway()
            .handle(
                CallContext::new("s1"),
                body(json!({"jsonrpc": "2.0", "method": "x", "context-version": "v1"})),
            )
            .await;
        assert_eq!(outcome, GatewayOutcome::ok(Reply::Empty));
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_drops_notifications() {
        let outcome = gateway()
            .handle(
                CallContext::new("s1"),
                body(json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "a", "context-version": "v1", "params": [1]},
                    {"jsonrpc": "2.0", "method": "b", "context-version": "v1"},
                    42,
                    {"jsonrpc": "2.0", "id": 2, "method": "c", "context-version": "v9"},
                ])),
            )
            .await;
        let Reply::Batch(responses) = outcome.reply else {
            panic!("expected batch");
        };
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].result, Some(json!([1])));
        assert_eq!(responses[1].id, Value::Null);
        assert_eq!(responses[1].error.as_ref().unwrap().code, INVALID_REQUEST);
        assert_eq!(responses[2].id, json!(2));
        assert_eq!(responses[2].error.as_ref().unwrap().code, INVALID_CONTEXT_VERSION);
    }

    #[tokio::test]
    async fn test_all_notification_batch_is_empty_array() {
        let outcome = gateway()
            .handle(
                CallContext::new("s1"),
                body(json!([{"jsonrpc": "2.0", "method": "a", "context-version": "v1"}])),
            )
            .await;
        assert_eq!(outcome.reply, Reply::Batch(Vec::new()));
    }

    #[tokio::test]
    async fn test_empty_batch_is_invalid_request() {
        let resp = single(gateway().handle(CallContext::new("s1"), body(json!([]))).await);
        assert_eq!(resp.id, Value::Null);
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_calls_on_one_session() {
        let (entered, mut entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Notify::new());
        let gw = Arc::new(
            Gateway::new("node", SessionManager::new(SessionConfig::default())).with_backend(
                Arc::new(Gate {
                    entered,
                    release: release.clone(),
                }),
            ),
        );
        let call = json!({"jsonrpc": "2.0", "id": 1, "method": "slow", "context-version": "gate"});

        let first = {
            let gw = gw.clone();
            let call = call.clone();
            tokio::spawn(async move { gw.handle(CallContext::new("shared"), body(call)).await })
        };
        entered_rx.recv().await.unwrap();

        let busy = single(gw.handle(CallContext::new("shared"), body(call.clone())).await);
        assert_eq!(busy.id, Value::Null);
        assert_eq!(busy.error.unwrap().code, SESSION_BUSY);

        release.notify_one();
        let done = single(first.await.unwrap());
        assert_eq!(done.result, Some(json!("released")));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!gw.sessions().is_busy("shared"));
    }
}
