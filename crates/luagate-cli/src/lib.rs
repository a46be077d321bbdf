//! # luagate CLI
//!
//! Command-line interface for the luagate JSON-RPC gateway.
//!
//! - `luagate serve`: run the gateway over a command-script root
//! - `luagate call`: issue one JSON-RPC call and print the raw response JSON
//!
//! Argument parsing uses `argh`; the server itself lives in `luagate-server`.

pub mod call;
