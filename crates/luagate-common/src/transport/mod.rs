//! HTTP transport helpers shared by the gateway server and the CLI client.

pub mod http;

pub use http::{HttpTransport, HyperRequest, HyperResponse, SESSION_HEADER};
