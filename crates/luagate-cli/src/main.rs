//! # luagate CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve scripts under ./com on port 8080
//! luagate serve -b 0.0.0.0:8080 -c ./com --data-dir ./data
//!
//! # Make an RPC call (outputs raw JSON)
//! luagate call http://127.0.0.1:8080/api/v1/rpc users.create -p '{"name": "a"}'
//! ```

use anyhow::Result;
use argh::FromArgs;
use luagate_server::{Gateway, HttpServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use luagate_cli::call::{call, CallOptions};

/// Environment variable consulted when `--node-id` is not given.
const NODE_ID_ENV: &str = "LUAGATE_NODE_ID";

#[derive(FromArgs)]
/// luagate - JSON-RPC gateway for sandboxed Lua command scripts
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

/// Arguments for running the gateway.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the gateway
struct ServeArgs {
    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// HTTP path that accepts JSON-RPC requests
    #[argh(option, default = "\"/api/v1/rpc\".into()")]
    route: String,

    /// root directory of the command scripts
    #[argh(option, short = 'c', long = "com-dir", default = "\"./com\".into()")]
    com_dir: String,

    /// directory that storage paths are resolved under
    #[argh(option, long = "data-dir", default = "\"./data\".into()")]
    data_dir: String,

    /// seconds before an unreleased session is evicted
    #[argh(option, long = "session-ttl-secs", default = "1800")]
    session_ttl_secs: u64,

    /// seconds between expired-session sweeps
    #[argh(option, long = "sweep-interval-secs", default = "5")]
    sweep_interval_secs: u64,

    /// identity stamped on every response
    ///
    /// Falls back to the LUAGATE_NODE_ID environment variable, then to a
    /// fresh UUID.
    #[argh(option, long = "node-id")]
    node_id: Option<String>,

    /// seconds allowed for a client to send request headers
    #[argh(option, long = "header-read-timeout-secs", default = "10")]
    header_read_timeout_secs: u64,

    /// timeout in seconds for outbound requests made by scripts
    #[argh(option, long = "http-timeout-secs", default = "30")]
    http_timeout_secs: u64,

    /// highest bcrypt cost scripts may request
    #[argh(option, long = "bcrypt-max-cost", default = "31")]
    bcrypt_max_cost: u32,
}

impl ServeArgs {
    fn into_config(self, env_node_id: Option<String>) -> Result<ServerConfig> {
        let bind: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", self.bind, e))?;

        let mut config = ServerConfig::new()
            .with_bind(bind)
            .with_route(self.route)
            .with_com_dir(PathBuf::from(self.com_dir))
            .with_data_dir(PathBuf::from(self.data_dir))
            .with_session_ttl(Duration::from_secs(self.session_ttl_secs))
            .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs))
            .with_header_read_timeout(Duration::from_secs(self.header_read_timeout_secs))
            .with_http_timeout(Duration::from_secs(self.http_timeout_secs));
        let min_cost = config.bcrypt_min_cost;
        config = config.with_bcrypt_cost_bounds(min_cost, self.bcrypt_max_cost);

        if let Some(node_id) = self.node_id.or(env_node_id).filter(|id| !id.is_empty()) {
            config = config.with_node_id(node_id);
        }

        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }
}

/// Arguments for making a single RPC call.
///
/// Prints the raw response JSON to stdout so the output can be piped into
/// tools such as `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a running gateway
struct CallArgs {
    /// full endpoint URL, e.g. http://127.0.0.1:8080/api/v1/rpc
    #[argh(positional)]
    url: String,

    /// dotted method name
    #[argh(positional)]
    method: String,

    /// JSON params (object or array)
    #[argh(option, short = 'p', long = "params")]
    params: Option<String>,

    /// context version selecting the back-end
    #[argh(option, long = "context-version", default = "\"v1\".into()")]
    context_version: String,

    /// session id to send in X-Session-UUID
    #[argh(option, short = 's', long = "session")]
    session: Option<String>,

    /// send as a notification (no id, no response)
    #[argh(switch, long = "notify")]
    notify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => {
            let config = args.into_config(std::env::var(NODE_ID_ENV).ok())?;
            tracing::info!(
                com_dir = %config.com_dir.display(),
                data_dir = %config.data_dir.display(),
                node = %config.node_id,
                "Starting luagate"
            );

            let gateway = Arc::new(Gateway::from_config(
                &config,
                tokio::runtime::Handle::current(),
            ));
            let server = HttpServer::from_config(&config, gateway);
            server.run(config.bind).await?;
            Ok(())
        }
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_call(args: CallArgs) -> Result<()> {
    let params = args
        .params
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid JSON in params: {}", e))?;

    let options = CallOptions {
        context_version: args.context_version,
        session: args.session,
        notify: args.notify,
    };
    let output = call(&args.url, &args.method, params, &options).await?;

    if let Some(body) = output.body {
        println!("{}", serde_json::to_string(&body)?);
    }
    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    fn serve(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["serve"];
        argv.extend_from_slice(args);
        match Cli::from_args(&["luagate"], &argv).unwrap().command {
            Commands::Serve(args) => args,
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args = serve(&[]);
        assert_eq!(args.bind, "0.0.0.0:8080");
        assert_eq!(args.route, "/api/v1/rpc");
        assert_eq!(args.com_dir, "./com");
        assert_eq!(args.data_dir, "./data");
        assert_eq!(args.session_ttl_secs, 1800);
        assert_eq!(args.sweep_interval_secs, 5);
        assert!(args.node_id.is_none());
        assert_eq!(args.bcrypt_max_cost, 31);
    }

    #[test]
    fn test_cli_parse_serve_flags() {
        let args = serve(&[
            "-b", "127.0.0.1:9000",
            "-c", "/srv/com",
            "--session-ttl-secs", "60",
            "--node-id", "node-a",
        ]);
        assert_eq!(args.bind, "127.0.0.1:9000");
        assert_eq!(args.com_dir, "/srv/com");
        assert_eq!(args.session_ttl_secs, 60);
        assert_eq!(args.node_id.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_serve_config_node_id_precedence() {
        let config = serve(&["--node-id", "flag"])
            .into_config(Some("env".into()))
            .unwrap();
        assert_eq!(config.node_id, "flag");

        let config = serve(&[]).into_config(Some("env".into())).unwrap();
        assert_eq!(config.node_id, "env");

        let config = serve(&[]).into_config(None).unwrap();
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn test_serve_config_rejects_bad_values() {
        assert!(serve(&["-b", "not-an-address"]).into_config(None).is_err());
        assert!(serve(&["--bcrypt-max-cost", "40"]).into_config(None).is_err());
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["luagate"],
            &["call", "http://127.0.0.1:8080/api/v1/rpc", "users.create", "-p", r#"{"name":"a"}"#, "--notify"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { url, method, params, context_version, session, notify }) => {
                assert_eq!(url, "http://127.0.0.1:8080/api/v1/rpc");
                assert_eq!(method, "users.create");
                assert_eq!(params.as_deref(), Some(r#"{"name":"a"}"#));
                assert_eq!(context_version, "v1");
                assert!(session.is_none());
                assert!(notify);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_call_requires_method() {
        assert!(Cli::from_args(&["luagate"], &["call", "http://127.0.0.1:8080"]).is_err());
    }
}
