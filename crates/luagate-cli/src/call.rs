//! One-shot JSON-RPC client used by `luagate call`.

use anyhow::{anyhow, Context, Result};
use luagate_common::transport::{HttpTransport, SESSION_HEADER};
use serde_json::Value;

/// What the server answered to a single call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    pub status: u16,
    /// Session id echoed by the server
    pub session: Option<String>,
    /// Response body, `None` when the server sent nothing (notifications)
    pub body: Option<Value>,
}

/// Options for a single call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub context_version: String,
    pub session: Option<String>,
    pub notify: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            context_version: "v1".to_string(),
            session: None,
            notify: false,
        }
    }
}

/// Validates that a URL string starts with http:// or https://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Posts one request to `url` and returns the decoded answer.
pub async fn call(
    url: &str,
    method: &str,
    params: Option<Value>,
    options: &CallOptions,
) -> Result<CallOutput> {
    validate_http_url(url, "endpoint URL")?;

    let id = (!options.notify).then(|| Value::from(1));
    let request = HttpTransport::build_request(method, params, id, &options.context_version);

    let mut builder = reqwest::Client::new().post(url).json(&request);
    if let Some(session) = &options.session {
        builder = builder.header(SESSION_HEADER, session);
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("request to {} failed", url))?;
    let status = response.status().as_u16();
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response.bytes().await.context("failed to read response body")?;
    let body = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).context("response is not JSON")?)
    };

    Ok(CallOutput {
        status,
        session,
        body,
    })
}
