//! JSON-RPC over HTTP for the chain nodes (bitcoind, litecoind, geth).

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::RpcError;
use crate::runtime::BoxFuture;

/// One JSON-RPC endpoint. Calls are bounded by `deadline`.
pub trait JsonRpc: Send + Sync {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Value, RpcError>>;
}

impl<T: JsonRpc + ?Sized> JsonRpc for std::sync::Arc<T> {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Value, RpcError>> {
        (**self).call(method, params, deadline)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct HttpJsonRpc {
    url: String,
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl HttpJsonRpc {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client,
            credentials: None,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl JsonRpc for HttpJsonRpc {
    fn call<'a>(
        &'a self,
        method: &'a str,
        params: Value,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<Value, RpcError>> {
        Box::pin(async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RpcError::Timeout);
            }

            let body = json!({
                "jsonrpc": "1.0",
                "id": 1,
                "method": method,
                "params": params,
            });

            let mut request = self.client.post(&self.url).json(&body).timeout(remaining);
            if let Some((username, password)) = &self.credentials {
                request = request.basic_auth(username, Some(password));
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Http(e)
                }
            })?;
            // Nodes answer RPC errors with a non-2xx status and a JSON body
            let status = response.status();
            let text = response.text().await?;
            decode(&text).map_err(|e| match e {
                RpcError::Malformed(_) if !status.is_success() => {
                    RpcError::Malformed(format!("HTTP {}: {}", status, text.trim()))
                }
                other => other,
            })
        })
    }
}

/// Extracts `result`, or the remote `error` object as [`RpcError::Remote`].
pub fn decode(text: &str) -> Result<Value, RpcError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| RpcError::Malformed(e.to_string()))?;
    match envelope.error {
        Some(error) => Err(RpcError::Remote {
            code: error.code,
            message: error.message,
        }),
        None => Ok(envelope.result),
    }
}
