//! Sandboxed Lua execution of method scripts.

pub mod conversions;
pub mod engine;
pub mod modules;
pub mod response;

pub use engine::{EngineError, EngineServices, ScriptEngine, PREPARE_SCRIPT};
pub use response::{ErrorFields, ResponseState, ScriptHalt, ScriptReply};
