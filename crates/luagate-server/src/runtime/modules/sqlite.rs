//! `internal.database.sqlite`: per-path serialized storage.

use mlua::{
    Lua, Result as LuaResult, Table, UserData, UserDataFields, UserDataMethods,
    Value as LuaValue,
};
use rusqlite::types::Value as SqlValue;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::info;

use super::{err_pair, ModuleScope, SCRIPT_TARGET};
use crate::runtime::conversions::{is_null, new_array};
use crate::storage::{PendingWrite, Row, StorageConnection, StorageError};

struct LuaConnection {
    conn: StorageConnection,
    log: bool,
    script: String,
}

impl LuaConnection {
    fn trace(&self, op: &str, sql: &str) {
        if self.log {
            info!(
                target: SCRIPT_TARGET,
                script = %self.script,
                path = %self.conn.path().display(),
                sql,
                "storage {op}"
            );
        }
    }
}

impl UserData for LuaConnection {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("exec", |lua, this, (sql, params): (String, Option<Table>)| {
            let params = match sql_params(params) {
                Ok(params) => params,
                Err(e) => return err_pair(lua, e),
            };
            this.trace("exec", &sql);
            match this.conn.exec(&sql, params) {
                Ok(pending) => {
                    let handle = lua.create_userdata(LuaPendingWrite(RefCell::new(pending)))?;
                    Ok((LuaValue::UserData(handle), LuaValue::Nil))
                }
                Err(e) => err_pair(lua, e),
            }
        });

        methods.add_method("query", |lua, this, (sql, params): (String, Option<Table>)| {
            let params = match sql_params(params) {
                Ok(params) => params,
                Err(e) => return err_pair(lua, e),
            };
            this.trace("query", &sql);
            match this.conn.query(&sql, &params) {
                Ok(rows) => Ok((LuaValue::Table(rows_to_lua(lua, rows)?), LuaValue::Nil)),
                Err(e) => err_pair(lua, e),
            }
        });

        methods.add_method_mut("close", |_, this, ()| {
            this.conn.close();
            Ok(true)
        });
    }
}

struct LuaPendingWrite(RefCell<PendingWrite>);

impl UserData for LuaPendingWrite {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("done", |_, this| Ok(this.0.borrow_mut().is_done()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("wait", |lua, this, ()| {
            let outcome = this.0.borrow_mut().wait();
            outcome_pair(lua, outcome)
        });

        methods.add_method("check", |lua, this, ()| {
            let outcome = this.0.borrow_mut().check();
            match outcome {
                Some(outcome) => outcome_pair(lua, outcome),
                None => Ok((LuaValue::Nil, LuaValue::Nil)),
            }
        });
    }
}

pub(super) fn build(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let module = lua.create_table()?;
    let s = scope.clone();
    module.raw_set(
        "connect",
        lua.create_function(move |lua, (path, opts): (String, Option<Table>)| {
            let log = match &opts {
                Some(opts) => opts.raw_get::<Option<bool>>("log")?.unwrap_or(false),
                None => false,
            };
            match s.services.storage.connect(&path) {
                Ok(conn) => {
                    let handle = lua.create_userdata(LuaConnection {
                        conn,
                        log,
                        script: s.script_label.clone(),
                    })?;
                    Ok((LuaValue::UserData(handle), LuaValue::Nil))
                }
                Err(e) => err_pair(lua, e),
            }
        })?,
    )?;
    Ok(module)
}

fn outcome_pair(
    lua: &Lua,
    outcome: Result<usize, StorageError>,
) -> LuaResult<(LuaValue, LuaValue)> {
    match outcome {
        Ok(changed) => Ok((LuaValue::Integer(changed as i64), LuaValue::Nil)),
        Err(e) => err_pair(lua, e),
    }
}

/// Positional statement parameters from a list table.
fn sql_params(params: Option<Table>) -> Result<Vec<SqlValue>, String> {
    let Some(params) = params else {
        return Ok(Vec::new());
    };
    let len = params.raw_len();
    let mut values = Vec::with_capacity(len);
    for index in 1..=len {
        let value: LuaValue = params.raw_get(index).map_err(|e| e.to_string())?;
        values.push(sql_value(&value)?);
    }
    Ok(values)
}

fn sql_value(value: &LuaValue) -> Result<SqlValue, String> {
    match value {
        LuaValue::Nil => Ok(SqlValue::Null),
        v if is_null(v) => Ok(SqlValue::Null),
        LuaValue::Boolean(b) => Ok(SqlValue::Integer(i64::from(*b))),
        LuaValue::Integer(i) => Ok(SqlValue::Integer(*i)),
        LuaValue::Number(n) => Ok(SqlValue::Real(*n)),
        LuaValue::String(s) => Ok(match s.to_str() {
            Ok(text) => SqlValue::Text((*text).to_string()),
            Err(_) => SqlValue::Blob(s.as_bytes().to_vec()),
        }),
        other => Err(format!("unsupported parameter type: {}", other.type_name())),
    }
}

fn rows_to_lua(lua: &Lua, rows: Vec<Row>) -> LuaResult<Table> {
    let list = new_array(lua, rows.len())?;
    for (index, row) in rows.into_iter().enumerate() {
        let record = lua.create_table()?;
        for (column, value) in row {
            record.raw_set(column, sql_to_lua(lua, value)?)?;
        }
        list.raw_set(index + 1, record)?;
    }
    Ok(list)
}

fn sql_to_lua(lua: &Lua, value: SqlValue) -> LuaResult<LuaValue> {
    Ok(match value {
        SqlValue::Null => LuaValue::NULL,
        SqlValue::Integer(i) => LuaValue::Integer(i),
        SqlValue::Real(f) => LuaValue::Number(f),
        SqlValue::Text(text) => LuaValue::String(lua.create_string(text)?),
        SqlValue::Blob(bytes) => LuaValue::String(lua.create_string(bytes)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_params_from_list() {
        let lua = Lua::new();
        let params: Table = lua.load(r#"return {1, 2.5, "x", true}"#).eval().unwrap();
        assert_eq!(
            sql_params(Some(params)).unwrap(),
            vec![
                SqlValue::Integer(1),
                SqlValue::Real(2.5),
                SqlValue::Text("x".to_string()),
                SqlValue::Integer(1),
            ]
        );
        assert!(sql_params(None).unwrap().is_empty());
    }

    #[test]
    fn test_sql_params_rejects_tables() {
        let lua = Lua::new();
        let params: Table = lua.load("return {{}}").eval().unwrap();
        assert!(sql_params(Some(params)).is_err());
    }

    #[test]
    fn test_rows_keep_nulls_present() {
        let lua = Lua::new();
        let rows = vec![vec![
            ("id".to_string(), SqlValue::Integer(7)),
            ("note".to_string(), SqlValue::Null),
        ]];
        let table = rows_to_lua(&lua, rows).unwrap();
        let first: Table = table.raw_get(1).unwrap();
        assert_eq!(first.raw_get::<i64>("id").unwrap(), 7);
        assert!(is_null(&first.raw_get::<LuaValue>("note").unwrap()));
    }
}
