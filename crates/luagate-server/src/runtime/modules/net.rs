//! `internal.net`: outbound HTTP on behalf of a script.
//!
//! Requests run on the server's tokio runtime through `Handle::block_on`;
//! scripts execute on blocking threads, so the bridge never nests inside a
//! runtime worker. Caller identity headers are attached to every request.

use mlua::{Lua, Result as LuaResult, Table, Value as LuaValue};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode};
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{info, warn};

use super::{err_pair, ModuleScope, SCRIPT_TARGET};

/// Largest response body handed back to a script.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
enum NetError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),
}

struct Fetched {
    status: StatusCode,
    headers: BTreeMap<String, Vec<String>>,
    content_length: Option<u64>,
    body: Vec<u8>,
}

impl Fetched {
    fn into_table(self, lua: &Lua) -> LuaResult<Table> {
        let headers = lua.create_table()?;
        for (name, values) in self.headers {
            headers.raw_set(name, values.join(", "))?;
        }

        let length = self.content_length.unwrap_or(self.body.len() as u64);
        let table = lua.create_table()?;
        table.raw_set("status", self.status.as_u16())?;
        table.raw_set("status_text", self.status.canonical_reason().unwrap_or(""))?;
        table.raw_set("body", lua.create_string(&self.body)?)?;
        table.raw_set("content_length", length)?;
        table.raw_set("headers", headers)?;
        Ok(table)
    }
}

pub(super) fn build(lua: &Lua, scope: &Rc<ModuleScope>) -> LuaResult<Table> {
    let http = lua.create_table()?;

    let s = scope.clone();
    http.raw_set(
        "get_request",
        lua.create_function(move |lua, (log, url): (bool, String)| {
            fetch(lua, &s, Method::GET, &url, None, log)
        })?,
    )?;

    let s = scope.clone();
    http.raw_set(
        "post_request",
        lua.create_function(
            move |lua, (log, url, content_type, body): (bool, String, String, mlua::String)| {
                let payload = (content_type, body.as_bytes().to_vec());
                fetch(lua, &s, Method::POST, &url, Some(payload), log)
            },
        )?,
    )?;

    let module = lua.create_table()?;
    module.raw_set("http", http)?;
    Ok(module)
}

fn fetch(
    lua: &Lua,
    scope: &ModuleScope,
    method: Method,
    url: &str,
    payload: Option<(String, Vec<u8>)>,
    log: bool,
) -> LuaResult<(LuaValue, LuaValue)> {
    let services = &scope.services;
    let mut request = services
        .http
        .request(method.clone(), url)
        .timeout(services.http_timeout);
    for (name, value) in scope.call.initiator_headers() {
        request = request.header(name, value);
    }
    if let Some((content_type, body)) = payload {
        request = request.header(CONTENT_TYPE, content_type).body(body);
    }

    let script = scope.script_label.as_str();
    match services.runtime.block_on(send(request)) {
        Ok(fetched) => {
            if log {
                info!(
                    target: SCRIPT_TARGET,
                    script,
                    %method,
                    url,
                    status = fetched.status.as_u16(),
                    "outbound request"
                );
            }
            Ok((LuaValue::Table(fetched.into_table(lua)?), LuaValue::Nil))
        }
        Err(e) => {
            if log {
                warn!(target: SCRIPT_TARGET, script, %method, url, error = %e, "outbound request failed");
            }
            err_pair(lua, e)
        }
    }
}

async fn send(request: RequestBuilder) -> Result<Fetched, NetError> {
    let mut response = request.send().await?;
    let status = response.status();
    let content_length = response.content_length();

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(NetError::TooLarge(MAX_RESPONSE_BYTES));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(Fetched {
        status,
        headers,
        content_length,
        body,
    })
}
