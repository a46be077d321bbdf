//! luagate server
//!
//! A JSON-RPC 2.0 gateway whose methods are Lua scripts on disk. Each call is
//! resolved to a script under the command root, run in a fresh sandboxed
//! interpreter, and its declared result or error is sent back as the
//! JSON-RPC response.
//!
//! - [`Gateway`]: session admission, envelope parsing, batch fan-out, routing
//! - [`HttpServer`]: hyper HTTP/1.1 front end
//! - [`ScriptEngine`]: per-call sandboxed Lua execution
//! - [`storage`]: serialized per-path SQLite writers for scripts

pub mod backend;
pub mod config;
pub mod context;
pub mod gateway;
pub mod http_server;
pub mod resolver;
pub mod runtime;
pub mod session;
pub mod storage;

pub use backend::{ContextBackend, ScriptBackend, DEFAULT_CONTEXT_VERSION};
pub use config::ServerConfig;
pub use context::CallContext;
pub use gateway::{Gateway, GatewayOutcome, Reply};
pub use http_server::HttpServer;
pub use resolver::{MethodResolver, ResolveError};
pub use runtime::{EngineError, ScriptEngine, ScriptReply};
pub use session::{SessionConfig, SessionManager};
