pub mod envelope;
pub mod error;
pub mod jsonrpc;

pub use envelope::{BatchMember, Envelope};
pub use error::{GatewayError, Result};
pub use jsonrpc::{ResponseData, RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION};
