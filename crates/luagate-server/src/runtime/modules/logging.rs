//! `internal.log`: script log lines and named events.

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

use super::{render, ModuleScope};

/// Target for lines a script logs about itself.
pub const SCRIPT_TARGET: &str = "luagate::script";
/// Target for business events, prefixed with the script path.
pub const EVENT_TARGET: &str = "luagate::event";

#[derive(Debug, Clone, Copy)]
enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

pub(super) fn build(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let module = lua.create_table()?;

    let levels = [
        ("debug", Severity::Debug),
        ("info", Severity::Info),
        ("warn", Severity::Warn),
        ("error", Severity::Error),
    ];
    for (name, severity) in levels {
        let s = scope.clone();
        let f = lua.create_function(move |_, message: LuaValue| {
            script_line(severity, &s, &render(&message));
            Ok(())
        })?;
        module.raw_set(name, f)?;
    }

    let events = [
        ("event", Severity::Info),
        ("event_warn", Severity::Warn),
        ("event_error", Severity::Error),
    ];
    for (name, severity) in events {
        let s = scope.clone();
        let f = lua.create_function(move |_, message: LuaValue| {
            event_line(severity, &s.script_label, &render(&message));
            Ok(())
        })?;
        module.raw_set(name, f)?;
    }

    Ok(module)
}

fn script_line(severity: Severity, scope: &ModuleScope, message: &str) {
    let script = scope.script_label.as_str();
    let session = scope.call.session_id.as_str();
    match severity {
        Severity::Debug => debug!(target: SCRIPT_TARGET, script, session, "{message}"),
        Severity::Info => info!(target: SCRIPT_TARGET, script, session, "{message}"),
        Severity::Warn => warn!(target: SCRIPT_TARGET, script, session, "{message}"),
        Severity::Error => error!(target: SCRIPT_TARGET, script, session, "{message}"),
    }
}

fn event_line(severity: Severity, script: &str, message: &str) {
    match severity {
        Severity::Debug => debug!(target: EVENT_TARGET, "{script}: {message}"),
        Severity::Info => info!(target: EVENT_TARGET, "{script}: {message}"),
        Severity::Warn => warn!(target: EVENT_TARGET, "{script}: {message}"),
        Severity::Error => error!(target: EVENT_TARGET, "{script}: {message}"),
    }
}
