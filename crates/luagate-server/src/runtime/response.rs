//! What a script declares as its answer.
//!
//! The session module writes into a [`ResponseState`] owned by the engine.
//! `set`/`set_error` accumulate; `send`/`send_error` record a terminal outcome
//! once and then halt the script. After the script exits the engine calls
//! [`ResponseState::harvest`] to turn the state into a [`ScriptReply`].

use luagate_common::protocol::jsonrpc::{RpcError, INTERNAL_ERROR};
use serde_json::Value;
use thiserror::Error;

/// Raised through Lua by `send`/`send_error` to stop the script.
///
/// The engine does not rely on seeing this error: the terminal flag in
/// [`ResponseState`] is what marks the run as finished, so a script that
/// swallows the halt with `pcall` still gets its sent answer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("script halted by response.send")]
pub struct ScriptHalt;

/// Final answer of a script run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Result,
    Error,
}

/// Error fields a script has declared so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorFields {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl ErrorFields {
    fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_none() && self.data.is_none()
    }

    fn merge(&mut self, other: ErrorFields) {
        if other.code.is_some() {
            self.code = other.code;
        }
        if other.message.is_some() {
            self.message = other.message;
        }
        if other.data.is_some() {
            self.data = other.data;
        }
    }

    fn into_rpc_error(self) -> RpcError {
        let code = self
            .code
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(INTERNAL_ERROR);
        let message = self.message.unwrap_or_else(|| "Internal error".to_string());
        RpcError {
            code,
            message,
            data: self.data,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseState {
    result: Option<Value>,
    error: ErrorFields,
    terminal: Option<Terminal>,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `send` or `send_error` has run.
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Merges maps into the pending result; anything else replaces it.
    pub fn set(&mut self, value: Value) {
        if self.is_terminal() {
            return;
        }
        match (&mut self.result, value) {
            (Some(Value::Object(pending)), Value::Object(fields)) => pending.extend(fields),
            (slot, value) => *slot = Some(value),
        }
    }

    pub fn set_error(&mut self, fields: ErrorFields) {
        if self.is_terminal() {
            return;
        }
        self.error.merge(fields);
    }

    /// Records a terminal result. `value` is merged first when present.
    pub fn send(&mut self, value: Option<Value>) {
        if self.is_terminal() {
            return;
        }
        if let Some(value) = value {
            self.set(value);
        }
        self.terminal = Some(Terminal::Result);
    }

    /// Records a terminal error. `fields` are merged first.
    pub fn send_error(&mut self, fields: ErrorFields) {
        if self.is_terminal() {
            return;
        }
        self.set_error(fields);
        self.terminal = Some(Terminal::Error);
    }

    pub fn harvest(self) -> ScriptReply {
        let result = self.result.unwrap_or(Value::Null);
        match self.terminal {
            Some(Terminal::Result) => ScriptReply::Result(result),
            Some(Terminal::Error) => ScriptReply::Error(self.error.into_rpc_error()),
            None if !self.error.is_empty() => ScriptReply::Error(self.error.into_rpc_error()),
            None => ScriptReply::Result(result),
        }
    }
}
