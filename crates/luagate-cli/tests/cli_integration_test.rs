//! CLI Integration Tests
//!
//! Runs the built `luagate` binary against a gateway started in-process on
//! `127.0.0.1:0`.

use luagate_server::{Gateway, HttpServer, ServerConfig};
use serde_json::Value;
use std::fs;
use std::net::SocketAddr;
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn luagate(args: Vec<String>) -> Output {
    Command::new(env!("CARGO_BIN_EXE_luagate"))
        .args(args)
        .output()
        .expect("failed to run luagate binary")
}

async fn start_gateway(com: &TempDir, data: &TempDir) -> SocketAddr {
    let config = ServerConfig::new()
        .with_com_dir(com.path())
        .with_data_dir(data.path())
        .with_node_id("cli-test");
    let gateway = Arc::new(Gateway::from_config(&config, tokio::runtime::Handle::current()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(HttpServer::from_config(&config, gateway).serve(listener));
    addr
}

#[test]
fn test_call_requires_http_prefix() {
    let output = luagate(vec!["call".into(), "127.0.0.1:8080".into(), "ping".into()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("http://"), "stderr: {stderr}");
}

#[test]
fn test_serve_rejects_invalid_bind() {
    let output = luagate(vec!["serve".into(), "-b".into(), "nowhere".into()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid bind address"), "stderr: {stderr}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_prints_raw_response() {
    let (com, data) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    fs::write(
        com.path().join("greet.lua"),
        r#"
        local session = require("internal.session")
        session.response.send({ hello = session.request.params.get("name", "world") })
        "#,
    )
    .unwrap();
    let addr = start_gateway(&com, &data).await;

    let url = format!("http://{addr}/api/v1/rpc");
    let output = tokio::task::spawn_blocking(move || {
        luagate(vec![
            "call".into(),
            url,
            "greet".into(),
            "-p".into(),
            r#"{"name":"ada"}"#.into(),
        ])
    })
    .await
    .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let response: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["result"]["hello"], "ada");
    assert_eq!(response["data"]["responsible-node"], "cli-test");
}
