//! JSON <-> Lua Value Conversions
//!
//! Bidirectional conversion between `serde_json::Value` (the host's tagged
//! union) and Lua values. Used to hand request params to scripts and to read
//! back what scripts declare as results, errors and storage parameters.
//!
//! # Type Mapping
//!
//! | JSON Type | Lua Type |
//! |-----------|----------|
//! | null | `NULL` sentinel (light userdata) |
//! | boolean | boolean |
//! | number (integral) | integer |
//! | number (other) | float |
//! | string | string |
//! | array | table tagged with the array metatable |
//! | object | plain table |
//!
//! # Tables
//!
//! Lua has one container type, so the direction Lua -> JSON needs a rule:
//!
//! - a table carrying the array metatable is a list over `1..raw_len`
//! - otherwise a table is a list only when its keys are exactly the integers
//!   `1..N` for some `N >= 1`
//! - everything else, including an empty untagged table, is a map
//!
//! Map keys that are numbers or booleans are written in their decimal or
//! literal form. `nil` inside a table is an absent key, while `NULL` is a
//! present `null`, so `{"a": null}` survives a round trip.
//!
//! # Limitations
//!
//! - Functions, userdata and threads become `null`
//! - Non-finite floats become `null`
//! - Nesting deeper than [`MAX_DEPTH`] (including cycles) is an error

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use serde_json::{Map, Value as JsonValue};

/// Deepest container nesting accepted in either direction.
pub const MAX_DEPTH: usize = 64;

const ARRAY_METATABLE: &str = "luagate.array_metatable";
const ARRAY_MARKER: &str = "__jsonarray";

/// True for the light-userdata `NULL` sentinel that stands for JSON `null`.
pub fn is_null(value: &LuaValue) -> bool {
    matches!(value, LuaValue::LightUserData(ud) if ud.0.is_null())
}

/// Convert serde_json::Value to a Lua value.
pub fn json_to_lua(lua: &Lua, value: &JsonValue) -> LuaResult<LuaValue> {
    to_lua(lua, value, 0)
}

/// Convert a Lua value to serde_json::Value.
///
/// A top-level `nil` converts to `null`.
pub fn lua_to_json(value: &LuaValue) -> LuaResult<JsonValue> {
    to_json(value, 0)
}

/// Creates an empty table that converts back to a JSON array even when empty.
pub fn new_array(lua: &Lua, capacity: usize) -> LuaResult<Table> {
    let table = lua.create_table_with_capacity(capacity, 0)?;
    table.set_metatable(Some(array_metatable(lua)?));
    Ok(table)
}

fn array_metatable(lua: &Lua) -> LuaResult<Table> {
    if let Some(mt) = lua.named_registry_value::<Option<Table>>(ARRAY_METATABLE)? {
        return Ok(mt);
    }
    let mt = lua.create_table()?;
    mt.raw_set(ARRAY_MARKER, true)?;
    lua.set_named_registry_value(ARRAY_METATABLE, mt.clone())?;
    Ok(mt)
}

fn too_deep() -> mlua::Error {
    mlua::Error::RuntimeError(format!("value nesting exceeds {MAX_DEPTH} levels"))
}

fn to_lua(lua: &Lua, value: &JsonValue, depth: usize) -> LuaResult<LuaValue> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }

    Ok(match value {
        JsonValue::Null => LuaValue::NULL,
        JsonValue::Bool(b) => LuaValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => LuaValue::Integer(i),
            None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => LuaValue::String(lua.create_string(s)?),
        JsonValue::Array(items) => {
            let table = new_array(lua, items.len())?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, to_lua(lua, item, depth + 1)?)?;
            }
            LuaValue::Table(table)
        }
        JsonValue::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_lua(lua, item, depth + 1)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

fn to_json(value: &LuaValue, depth: usize) -> LuaResult<JsonValue> {
    Ok(match value {
        LuaValue::Nil => JsonValue::Null,
        LuaValue::Boolean(b) => JsonValue::Bool(*b),
        LuaValue::Integer(i) => JsonValue::from(*i),
        LuaValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        LuaValue::String(s) => JsonValue::String(s.to_string_lossy().to_string()),
        LuaValue::Table(table) => table_to_json(table, depth)?,
        _ => JsonValue::Null,
    })
}

fn is_tagged_array(table: &Table) -> bool {
    table
        .metatable()
        .map(|mt| mt.raw_get::<bool>(ARRAY_MARKER).unwrap_or(false))
        .unwrap_or(false)
}

fn table_to_json(table: &Table, depth: usize) -> LuaResult<JsonValue> {
    if depth >= MAX_DEPTH {
        return Err(too_deep());
    }

    if is_tagged_array(table) {
        let len = table.raw_len();
        let mut items = Vec::with_capacity(len);
        for idx in 1..=len {
            items.push(to_json(&table.raw_get::<LuaValue>(idx)?, depth + 1)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let entries = table
        .pairs::<LuaValue, LuaValue>()
        .collect::<LuaResult<Vec<_>>>()?;

    if is_dense_sequence(&entries) {
        let mut items = vec![JsonValue::Null; entries.len()];
        for (key, item) in &entries {
            if let LuaValue::Integer(idx) = key {
                items[(*idx - 1) as usize] = to_json(item, depth + 1)?;
            }
        }
        return Ok(JsonValue::Array(items));
    }

    let mut map = Map::with_capacity(entries.len());
    for (key, item) in &entries {
        let Some(key) = map_key(key) else {
            continue;
        };
        map.insert(key, to_json(item, depth + 1)?);
    }
    Ok(JsonValue::Object(map))
}

/// Keys are exactly `1..=N` with `N >= 1`. Keys are unique, so a count check
/// plus a range check is enough.
fn is_dense_sequence(entries: &[(LuaValue, LuaValue)]) -> bool {
    let n = entries.len() as i64;
    n > 0
        && entries
            .iter()
            .all(|(key, _)| matches!(key, LuaValue::Integer(i) if (1..=n).contains(i)))
}

fn map_key(key: &LuaValue) -> Option<String> {
    match key {
        LuaValue::String(s) => Some(s.to_string_lossy().to_string()),
        LuaValue::Integer(i) => Some(i.to_string()),
        LuaValue::Number(n) => Some(n.to_string()),
        LuaValue::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}
