//! luagate Common Types and Transport
//!
//! Shared protocol definitions for the luagate JSON-RPC gateway:
//!
//! - **Protocol Layer**: [`RpcRequest`], [`RpcResponse`], [`RpcError`], the
//!   error-code taxonomy and the single/batch [`Envelope`] decoder
//! - **Transport Layer**: hyper request/response helpers and the session header
//!
//! # Wire format
//!
//! JSON-RPC 2.0 over HTTP POST with two non-standard extensions: the request
//! field `context-version` selects a back-end, and every response carries a
//! `data` block `{responsible-node, salt, checksum, new-session-uuid?}`.

pub mod protocol;
pub mod transport;

pub use protocol::*;
