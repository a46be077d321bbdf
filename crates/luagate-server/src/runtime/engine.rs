//! Per-call Lua execution.
//!
//! Every call gets a fresh interpreter. Nothing survives between calls
//! except what scripts write through the storage module.

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value as LuaValue};
use serde_json::Value;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::modules::{self, ModuleScope, SEED_KEY};
use super::response::{ResponseState, ScriptReply};
use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::storage::{LockRegistry, StoragePool};

/// Script run before every method script when present at the root.
pub const PREPARE_SCRIPT: &str = "_prepare.lua";

const REMOVED_GLOBALS: [&str; 3] = ["print", "dofile", "loadfile"];
const REMOVED_OS: [&str; 7] = [
    "exit",
    "execute",
    "remove",
    "rename",
    "tmpname",
    "getenv",
    "setlocale",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("sandbox setup failed: {0}")]
    Sandbox(String),
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
    #[error("prepare script failed: {0}")]
    Prepare(String),
    #[error("script failed: {0}")]
    Script(String),
}

impl From<mlua::Error> for EngineError {
    fn from(err: mlua::Error) -> Self {
        EngineError::Sandbox(err.to_string())
    }
}

/// Host services shared by every call.
pub struct EngineServices {
    pub storage: Arc<StoragePool>,
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    /// Runtime that outbound requests are driven on
    pub runtime: Handle,
    pub bcrypt_min_cost: u32,
    pub bcrypt_max_cost: u32,
}

impl EngineServices {
    pub fn from_config(config: &ServerConfig, runtime: Handle) -> Self {
        Self {
            storage: Arc::new(StoragePool::new(
                config.data_dir.clone(),
                Arc::new(LockRegistry::new()),
            )),
            http: reqwest::Client::new(),
            http_timeout: config.http_timeout,
            runtime,
            bcrypt_min_cost: config.bcrypt_min_cost,
            bcrypt_max_cost: config.bcrypt_max_cost,
        }
    }
}

/// How a chunk of guest code finished.
enum GuestExit {
    Completed,
    /// `send` or `send_error` ran, whether or not the halt was caught
    Halted,
    Raised(String),
}

pub struct ScriptEngine {
    root: PathBuf,
    services: Arc<EngineServices>,
}

impl ScriptEngine {
    pub fn new(root: impl Into<PathBuf>, services: Arc<EngineServices>) -> Self {
        Self {
            root: root.into(),
            services,
        }
    }

    pub fn from_config(config: &ServerConfig, runtime: Handle) -> Self {
        Self::new(
            config.com_dir.clone(),
            Arc::new(EngineServices::from_config(config, runtime)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Runs `script` for one call and returns what it answered.
    ///
    /// Blocks the calling thread for the whole run, so callers on a tokio
    /// runtime must move this onto a blocking thread.
    pub fn execute(
        &self,
        call: &CallContext,
        method: &str,
        params: &Value,
        script: &Path,
    ) -> Result<ScriptReply, EngineError> {
        let source = read_source(script)?;
        let label = self.label(script);
        debug!(script = %label, session = %call.session_id, "executing script");

        let lua = self.sandbox()?;
        let loaded: Table = lua.globals().raw_get::<Table>("package")?.raw_get("loaded")?;

        let scope = Rc::new(ModuleScope {
            seed: rand::random::<i64>(),
            script: script.to_path_buf(),
            script_label: label.clone(),
            method: method.to_string(),
            params: params.clone(),
            call: call.clone(),
            response: RefCell::new(ResponseState::new()),
            services: self.services.clone(),
        });
        modules::install(&lua, &scope)?;

        let prepare = self.root.join(PREPARE_SCRIPT);
        if prepare.is_file() {
            let prepare_source = read_source(&prepare)?;
            match run_chunk(&lua, &scope, &prepare_source, PREPARE_SCRIPT) {
                GuestExit::Completed => {}
                GuestExit::Halted => return Ok(finish(&loaded, &scope)),
                GuestExit::Raised(message) => return Err(EngineError::Prepare(message)),
            }
        }

        match run_chunk(&lua, &scope, &source, &label) {
            GuestExit::Completed | GuestExit::Halted => Ok(finish(&loaded, &scope)),
            GuestExit::Raised(message) => Err(EngineError::Script(message)),
        }
    }

    fn label(&self, script: &Path) -> String {
        script
            .strip_prefix(&self.root)
            .unwrap_or(script)
            .display()
            .to_string()
    }

    /// A fresh interpreter with host-reaching capabilities removed.
    fn sandbox(&self) -> Result<Lua, EngineError> {
        let libs = StdLib::COROUTINE
            | StdLib::TABLE
            | StdLib::STRING
            | StdLib::UTF8
            | StdLib::MATH
            | StdLib::OS
            | StdLib::PACKAGE;
        let lua = Lua::new_with(libs, LuaOptions::default())?;
        let globals = lua.globals();

        for name in REMOVED_GLOBALS {
            globals.raw_set(name, LuaValue::Nil)?;
        }
        let os: Table = globals.raw_get("os")?;
        for name in REMOVED_OS {
            os.raw_set(name, LuaValue::Nil)?;
        }

        let package: Table = globals.raw_get("package")?;
        package.raw_set("path", format!("{}/?.lua", self.root.display()))?;
        package.raw_set("cpath", "")?;
        package.raw_set("loadlib", LuaValue::Nil)?;

        let load: Function = globals.raw_get("load")?;
        let text_only = lua.create_function(move |lua, args: MultiValue| {
            let mut args: Vec<LuaValue> = args.into_iter().take(4).collect();
            args.resize(args.len().max(3), LuaValue::Nil);
            args[2] = LuaValue::String(lua.create_string("t")?);
            load.call::<MultiValue>(args.into_iter().collect::<MultiValue>())
        })?;
        globals.raw_set("load", text_only)?;

        let math: Table = globals.raw_get("math")?;
        let randomseed: Function = math.raw_get("randomseed")?;
        randomseed.call::<()>(rand::random::<i64>())?;

        Ok(lua)
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, EngineError> {
    std::fs::read(path).map_err(|e| EngineError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn run_chunk(lua: &Lua, scope: &ModuleScope, source: &[u8], name: &str) -> GuestExit {
    let outcome = lua
        .load(source)
        .set_name(format!("@{name}"))
        .set_mode(ChunkMode::Text)
        .exec();
    if scope.response.borrow().is_terminal() {
        return GuestExit::Halted;
    }
    match outcome {
        Ok(()) => GuestExit::Completed,
        Err(e) => GuestExit::Raised(e.to_string()),
    }
}

/// Harvests the response if the loaded session module is the one we built.
fn finish(loaded: &Table, scope: &ModuleScope) -> ScriptReply {
    let seed = loaded
        .raw_get::<Option<Table>>(modules::SESSION)
        .ok()
        .flatten()
        .and_then(|session| session.raw_get::<Option<i64>>(SEED_KEY).ok().flatten());

    match seed {
        Some(seed) if seed == scope.seed => scope.response.take().harvest(),
        Some(_) => {
            warn!(script = %scope.script_label, "session module replaced by script, discarding response");
            ScriptReply::Result(Value::Null)
        }
        None => ScriptReply::Result(Value::Null),
    }
}
