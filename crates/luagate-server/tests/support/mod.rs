//! In-process gateway harness for the HTTP integration tests.

use luagate_server::{Gateway, HttpServer, ServerConfig};
use reqwest::Client;
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const NODE_ID: &str = "node-under-test";

// ============================================================================
// Common Test Scripts
// ============================================================================

/// Command scripts installed under the command root, by relative path.
pub fn server_test_scripts() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "users/create.lua",
            r#"
            local session = require("internal.session")
            local name = session.request.params.get("name")
            if not name then
                session.response.send_error(-32001, "name is required", { field = "name" })
            end
            session.response.send({ id = 1, name = name })
            "#,
        ),
        (
            "echo.lua",
            r#"
            local session = require("internal.session")
            session.response.send(session.request.params.get())
            "#,
        ),
        (
            "whoami.lua",
            r#"
            local session = require("internal.session")
            session.response.send({
                session = session.id,
                agent = session.request.headers.get("user-agent", ""),
            })
            "#,
        ),
        (
            "slow.lua",
            r#"
            local session = require("internal.session")
            local deadline = os.clock() + 0.5
            while os.clock() < deadline do end
            session.response.send("done")
            "#,
        ),
        (
            "counter/increment.lua",
            r#"
            local session = require("internal.session")
            local sqlite = require("internal.database.sqlite")
            local db = assert(sqlite.connect("counter.db"))
            assert(db:exec("CREATE TABLE IF NOT EXISTS hits (n INTEGER NOT NULL)")):wait()
            local _, err = assert(db:exec("INSERT INTO hits (n) VALUES (1)")):wait()
            if err then session.response.send_error(-32002, err) end
            session.response.send(true)
            "#,
        ),
        (
            "counter/total.lua",
            r#"
            local session = require("internal.session")
            local sqlite = require("internal.database.sqlite")
            local db = assert(sqlite.connect("counter.db"))
            local rows = assert(db:query("SELECT COUNT(*) AS total FROM hits"))
            session.response.send(rows[1].total)
            "#,
        ),
        ("crash.lua", r#"error("unexpected failure")"#),
    ]
}

// ============================================================================
// Gateway Server
// ============================================================================

/// A gateway serving [`server_test_scripts`] on an ephemeral port.
pub struct GatewayServer {
    pub addr: SocketAddr,
    pub url: String,
    _com: TempDir,
    _data: TempDir,
    task: JoinHandle<()>,
}

impl GatewayServer {
    pub async fn start() -> Self {
        let com = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        for (path, source) in server_test_scripts() {
            write_script(com.path(), path, source);
        }

        let config = ServerConfig::new()
            .with_com_dir(com.path())
            .with_data_dir(data.path())
            .with_node_id(NODE_ID);
        let gateway = Arc::new(Gateway::from_config(
            &config,
            tokio::runtime::Handle::current(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::from_config(&config, gateway);
        let task = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            url: format!("http://{}{}", addr, config.route),
            _com: com,
            _data: data,
            task,
        }
    }

    /// POSTs `body` with an optional session header.
    pub async fn post(&self, body: &Value, session: Option<&str>) -> reqwest::Response {
        let mut request = Client::new().post(&self.url).json(body);
        if let Some(session) = session {
            request = request.header("X-Session-UUID", session);
        }
        request.send().await.unwrap()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn write_script(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, source).unwrap();
}
