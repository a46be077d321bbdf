//! API-context back-ends.
//!
//! The gateway routes each call by its `context-version` to a
//! [`ContextBackend`]. [`ScriptBackend`] is the scripted `v1` back-end:
//! resolve the method to a file, run it in the engine, translate the reply.

use futures::future::BoxFuture;
use luagate_common::protocol::{RpcError, RpcRequest, RpcResponse};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::resolver::{MethodResolver, ResolveError};
use crate::runtime::{ScriptEngine, ScriptReply};

/// Context version served by [`ScriptBackend`] unless configured otherwise.
pub const DEFAULT_CONTEXT_VERSION: &str = "v1";

/// A handler for every call tagged with one context version.
pub trait ContextBackend: Send + Sync {
    fn version(&self) -> &str;

    /// Answers one call. The response is not yet stamped.
    fn handle(self: Arc<Self>, ctx: Arc<CallContext>, req: RpcRequest)
        -> BoxFuture<'static, RpcResponse>;
}

pub struct ScriptBackend {
    version: String,
    resolver: MethodResolver,
    engine: ScriptEngine,
}

impl ScriptBackend {
    pub fn new(version: impl Into<String>, resolver: MethodResolver, engine: ScriptEngine) -> Self {
        Self {
            version: version.into(),
            resolver,
            engine,
        }
    }

    pub fn from_config(config: &ServerConfig, runtime: Handle) -> Self {
        Self::new(
            DEFAULT_CONTEXT_VERSION,
            MethodResolver::new(config.com_dir.clone()),
            ScriptEngine::from_config(config, runtime),
        )
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    /// Resolves and runs one call on the current thread.
    pub fn dispatch(&self, ctx: &CallContext, req: &RpcRequest) -> Result<Value, RpcError> {
        let script = self.resolver.resolve(&req.method).map_err(|e| match e {
            ResolveError::Missing => RpcError::method_missing(),
            ResolveError::InvalidFormat(_) => RpcError::invalid_method_format(),
            ResolveError::NotFound(_) => RpcError::method_not_found(),
        })?;

        let params = match &req.params {
            None => Value::Null,
            Some(params @ (Value::Object(_) | Value::Array(_))) => params.clone(),
            Some(_) => return Err(RpcError::invalid_params()),
        };

        match self.engine.execute(ctx, &req.method, &params, &script) {
            Ok(ScriptReply::Result(value)) => Ok(value),
            Ok(ScriptReply::Error(err)) => Err(err),
            Err(e) => {
                tracing::error!(method = %req.method, session = %ctx.session_id, error = %e, "script execution failed");
                Err(RpcError::internal_error())
            }
        }
    }
}

impl ContextBackend for ScriptBackend {
    fn version(&self) -> &str {
        &self.version
    }

    fn handle(
        self: Arc<Self>,
        ctx: Arc<CallContext>,
        req: RpcRequest,
    ) -> BoxFuture<'static, RpcResponse> {
        Box::pin(async move {
            let id = req.id.clone().unwrap_or(Value::Null);
            let outcome = tokio::task::spawn_blocking(move || self.dispatch(&ctx, &req)).await;
            match outcome {
                Ok(Ok(result)) => RpcResponse::success(id, result),
                Ok(Err(err)) => RpcResponse::error(id, err),
                Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                Err(join) => {
                    tracing::error!(error = %join, "script task cancelled");
                    RpcResponse::error(id, RpcError::internal_error())
                }
            }
        })
    }
}
