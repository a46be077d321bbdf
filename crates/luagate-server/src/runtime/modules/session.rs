//! `internal.session`: the current call's request and response.

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value as LuaValue};
use serde_json::Value;
use std::rc::Rc;

use super::ModuleScope;
use crate::runtime::conversions::{is_null, json_to_lua, lua_to_json};
use crate::runtime::response::{ErrorFields, ScriptHalt};

pub(super) fn build(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let module = lua.create_table()?;
    module.raw_set("id", scope.call.session_id.as_str())?;
    module.raw_set("request", request_table(lua, scope)?)?;
    module.raw_set("response", response_table(lua, scope)?)?;
    Ok(module)
}

fn request_table(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let request = lua.create_table()?;
    request.raw_set("method", scope.method.as_str())?;
    request.raw_set("address", scope.call.address())?;

    let params = lua.create_table()?;
    let s = scope.clone();
    params.raw_set(
        "get",
        lua.create_function(move |lua, (path, default): (LuaValue, LuaValue)| {
            let found = match key_text(&path) {
                None => Some(&s.params),
                Some(path) => lookup(&s.params, &path),
            };
            match found {
                Some(value) if !value.is_null() => json_to_lua(lua, value),
                _ => Ok(default),
            }
        })?,
    )?;
    request.raw_set("params", params)?;

    let headers = lua.create_table()?;
    let s = scope.clone();
    headers.raw_set(
        "get",
        lua.create_function(move |lua, (name, default): (LuaValue, LuaValue)| {
            let Some(name) = key_text(&name) else {
                let all = lua.create_table()?;
                for (name, value) in s.call.header_pairs() {
                    all.raw_set(name, value)?;
                }
                return Ok(LuaValue::Table(all));
            };
            match s.call.header(&name) {
                Some(value) => Ok(LuaValue::String(lua.create_string(value)?)),
                None => Ok(default),
            }
        })?,
    )?;
    request.raw_set("headers", headers)?;

    Ok(request)
}

fn response_table(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let response = lua.create_table()?;

    let s = scope.clone();
    response.raw_set(
        "set",
        lua.create_function(move |_, value: LuaValue| {
            let value = lua_to_json(&value)?;
            s.response.borrow_mut().set(value);
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    response.raw_set(
        "send",
        lua.create_function(move |_, value: LuaValue| {
            let value = match value {
                LuaValue::Nil => None,
                other => Some(lua_to_json(&other)?),
            };
            s.response.borrow_mut().send(value);
            Err::<(), _>(halt())
        })?,
    )?;

    let s = scope.clone();
    response.raw_set(
        "set_error",
        lua.create_function(move |_, args: MultiValue| {
            let fields = error_fields(args)?;
            s.response.borrow_mut().set_error(fields);
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    response.raw_set(
        "send_error",
        lua.create_function(move |_, args: MultiValue| {
            let fields = error_fields(args)?;
            s.response.borrow_mut().send_error(fields);
            Err::<(), _>(halt())
        })?,
    )?;

    Ok(response)
}

fn halt() -> mlua::Error {
    mlua::Error::external(ScriptHalt)
}

/// Walks a dotted path. List segments are 1-based.
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| index.checked_sub(1))
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

fn key_text(value: &LuaValue) -> Option<String> {
    match value {
        LuaValue::String(s) => Some(s.to_string_lossy().to_string()),
        LuaValue::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Accepts `(code, message, data)` or a single `{code=, message=, data=}`.
fn error_fields(args: MultiValue) -> LuaResult<ErrorFields> {
    let mut args = args.into_iter();
    let first = args.next().unwrap_or(LuaValue::Nil);
    if let LuaValue::Table(table) = &first {
        return Ok(ErrorFields {
            code: error_code(table.raw_get("code")?)?,
            message: error_message(table.raw_get("message")?),
            data: error_data(table.raw_get("data")?)?,
        });
    }
    let message = args.next().unwrap_or(LuaValue::Nil);
    let data = args.next().unwrap_or(LuaValue::Nil);
    Ok(ErrorFields {
        code: error_code(first)?,
        message: error_message(message),
        data: error_data(data)?,
    })
}

fn error_code(value: LuaValue) -> LuaResult<Option<i64>> {
    match value {
        LuaValue::Nil => Ok(None),
        LuaValue::Integer(code) => Ok(Some(code)),
        LuaValue::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(Some(n as i64)),
        LuaValue::String(s) => s
            .to_string_lossy()
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| mlua::Error::runtime("error code must be an integer")),
        _ => Err(mlua::Error::runtime("error code must be an integer")),
    }
}

fn error_message(value: LuaValue) -> Option<String> {
    match value {
        LuaValue::Nil => None,
        other => Some(super::render(&other)),
    }
}

fn error_data(value: LuaValue) -> LuaResult<Option<Value>> {
    if value.is_nil() || is_null(&value) {
        return Ok(None);
    }
    lua_to_json(&value).map(Some)
}
