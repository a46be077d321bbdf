//! Capability modules exposed to scripts through `require`.
//!
//! Each module is registered in `package.preload` and built lazily on first
//! `require`, bound to the current call. Every module table carries the
//! per-call seed under [`SEED_KEY`] so the engine can tell its own session
//! module apart from a table a script planted in `package.loaded`.

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value as LuaValue};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt::Display;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use super::engine::EngineServices;
use super::response::ResponseState;
use crate::context::CallContext;

mod crypt;
mod logging;
mod net;
mod session;
mod sqlite;

pub use crypt::{decode_hs256, encode_hs256, TokenError};
pub use logging::{EVENT_TARGET, SCRIPT_TARGET};
pub use net::MAX_RESPONSE_BYTES;

/// Key holding the per-call seed in every module table.
pub const SEED_KEY: &str = "__seed";

pub const SESSION: &str = "internal.session";
pub const LOG: &str = "internal.log";
pub const NET: &str = "internal.net";
pub const BCRYPT: &str = "internal.crypt.bcrypt";
pub const SHA256: &str = "internal.crypt.sha256";
pub const JWT: &str = "internal.crypt.jwt";
pub const SQLITE: &str = "internal.database.sqlite";

/// Everything a module instance may see about the current call.
pub(crate) struct ModuleScope {
    pub seed: i64,
    pub script: PathBuf,
    pub script_label: String,
    pub method: String,
    pub params: Value,
    pub call: CallContext,
    pub response: RefCell<ResponseState>,
    pub services: Arc<EngineServices>,
}

type Builder = fn(&Lua, &Rc<ModuleScope>) -> LuaResult<Table>;

/// Registers every capability module in `package.preload`.
pub(crate) fn install(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<()> {
    let package: Table = lua.globals().raw_get("package")?;
    let preload: Table = package.raw_get("preload")?;

    let builders: [(&str, Builder); 7] = [
        (SESSION, session::build),
        (LOG, logging::build),
        (NET, net::build),
        (BCRYPT, crypt::build_bcrypt),
        (SHA256, crypt::build_sha256),
        (JWT, crypt::build_jwt),
        (SQLITE, sqlite::build),
    ];

    for (name, build) in builders {
        let scope = scope.clone();
        let loader = lua.create_function(move |lua, _: MultiValue| {
            let module = build(lua, &scope)?;
            module.raw_set(SEED_KEY, scope.seed)?;
            Ok(module)
        })?;
        preload.raw_set(name, loader)?;
    }
    Ok(())
}

/// `(nil, message)`, the failure half of the dual-return convention.
pub(crate) fn err_pair(lua: &Lua, message: impl Display) -> LuaResult<(LuaValue, LuaValue)> {
    Ok((
        LuaValue::Nil,
        LuaValue::String(lua.create_string(message.to_string())?),
    ))
}

/// Human-readable rendering of a script value for log lines.
pub(crate) fn render(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => n.to_string(),
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Table(_) => super::conversions::lua_to_json(value)
            .map(|json| json.to_string())
            .unwrap_or_else(|_| "<table>".to_string()),
        other => format!("<{}>", other.type_name()),
    }
}
