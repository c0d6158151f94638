//! Coin daemon JSON-RPC client.
//!
//! One client per pool spans an ordered list of endpoints. Calls run
//! against the first endpoint that answers ("any healthy") or against
//! every endpoint at once; batch requests ship as a JSON-RPC array.
//! Endpoints may additionally expose a push socket (`notifyUrl`) that
//! streams work notifications as newline-delimited JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonEndpointConfig;
use crate::metrics;

#[derive(Debug, Error, Clone)]
pub enum DaemonError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    Http(u16),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl DaemonError {
    /// Errors worth retrying on another endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaemonError::Transport(_) | DaemonError::Timeout | DaemonError::Http(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
struct RpcEnvelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl RpcReply {
    fn into_result(self) -> Result<Value, DaemonError> {
        if let Some(err) = self.error {
            if !err.is_null() {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                return Err(DaemonError::Rpc { code, message });
            }
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

struct Endpoint {
    url: String,
    auth_header: Option<String>,
    notify_url: Option<String>,
    timeout: Duration,
}

impl Endpoint {
    fn from_config(cfg: &DaemonEndpointConfig) -> Self {
        let auth_header = cfg.user.as_ref().map(|user| {
            let pass = cfg.password.as_deref().unwrap_or("");
            format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
        });
        Self {
            url: cfg.url.clone(),
            auth_header,
            notify_url: cfg.notify_url.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

pub struct DaemonClient {
    endpoints: Vec<Endpoint>,
    client: Client<HttpConnector, Full<Bytes>>,
    request_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(configs: &[DaemonEndpointConfig]) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Self {
            endpoints: configs.iter().map(Endpoint::from_config).collect(),
            client,
            request_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn has_notify_endpoints(&self) -> bool {
        self.endpoints.iter().any(|e| e.notify_url.is_some())
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute on the first endpoint that answers; endpoints are tried in
    /// configuration order and only transient failures fall through.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DaemonError> {
        let mut last = DaemonError::Transport("no endpoints configured".to_string());
        for endpoint in &self.endpoints {
            match self.call_endpoint(endpoint, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    tracing::debug!(url = %endpoint.url, error = %err, "daemon endpoint failed, trying next");
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        metrics::inc_rpc_errors();
        Err(last)
    }

    /// Execute on every endpoint, collecting each result.
    pub async fn call_all(&self, method: &str, params: Value) -> Vec<Result<Value, DaemonError>> {
        let calls: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| self.call_endpoint(e, method, params.clone()))
            .collect();
        futures::future::join_all(calls).await
    }

    /// Ship several calls as one JSON-RPC batch to the first healthy
    /// endpoint. Results come back in request order.
    pub async fn batch(
        &self,
        calls: &[(&str, Value)],
    ) -> Result<Vec<Result<Value, DaemonError>>, DaemonError> {
        let mut envelopes = Vec::with_capacity(calls.len());
        let first_id = self.request_id.fetch_add(calls.len() as u64, Ordering::Relaxed);
        for (i, (method, params)) in calls.iter().enumerate() {
            envelopes.push(RpcEnvelope {
                jsonrpc: "2.0",
                id: first_id + i as u64,
                method,
                params: params.clone(),
            });
        }
        let body = serde_json::to_vec(&envelopes)
            .map_err(|e| DaemonError::Malformed(e.to_string()))?;

        let mut last = DaemonError::Transport("no endpoints configured".to_string());
        for endpoint in &self.endpoints {
            match self.post(endpoint, body.clone()).await {
                Ok(raw) => {
                    let replies: Vec<RpcReply> = serde_json::from_slice(&raw)
                        .map_err(|e| DaemonError::Malformed(e.to_string()))?;
                    // Batch replies may arrive out of order; match on id.
                    let mut ordered: Vec<Result<Value, DaemonError>> = (0..calls.len())
                        .map(|_| Err(DaemonError::Malformed("missing reply".to_string())))
                        .collect();
                    for reply in replies {
                        if let Some(id) = reply.id.as_u64() {
                            let idx = id.wrapping_sub(first_id) as usize;
                            if idx < ordered.len() {
                                ordered[idx] = reply.into_result();
                            }
                        }
                    }
                    return Ok(ordered);
                }
                Err(err) if err.is_transient() => last = err,
                Err(err) => return Err(err),
            }
        }
        metrics::inc_rpc_errors();
        Err(last)
    }

    async fn call_endpoint(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Value,
    ) -> Result<Value, DaemonError> {
        let envelope = RpcEnvelope {
            jsonrpc: "2.0",
            id: self.next_id(),
            method,
            params,
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| DaemonError::Malformed(e.to_string()))?;
        let raw = self.post(endpoint, body).await?;
        let reply: RpcReply = serde_json::from_slice(&raw)
            .map_err(|e| DaemonError::Malformed(e.to_string()))?;
        reply.into_result()
    }

    async fn post(&self, endpoint: &Endpoint, body: Vec<u8>) -> Result<Bytes, DaemonError> {
        metrics::inc_rpc_requests();

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&endpoint.url)
            .header("Content-Type", "application/json");
        if let Some(auth) = &endpoint.auth_header {
            builder = builder.header("Authorization", auth);
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(endpoint.timeout, self.client.request(request))
            .await
            .map_err(|_| DaemonError::Timeout)?
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DaemonError::Unauthorized);
        }
        if !status.is_success() {
            return Err(DaemonError::Http(status.as_u16()));
        }

        response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .map_err(|e| DaemonError::Transport(e.to_string()))
    }

    /// Maintain push subscriptions to every endpoint that has a
    /// `notifyUrl`. Each received JSON line is forwarded to `tx`;
    /// connections are re-established after errors until cancellation.
    pub fn spawn_notify_listeners(&self, cancel: CancellationToken, tx: mpsc::Sender<Value>) {
        for endpoint in &self.endpoints {
            let Some(notify_url) = endpoint.notify_url.clone() else {
                continue;
            };
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match TcpStream::connect(&notify_url).await {
                        Ok(stream) => {
                            tracing::info!(%notify_url, "work notification stream connected");
                            let mut lines = BufReader::new(stream).lines();
                            loop {
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    line = lines.next_line() => match line {
                                        Ok(Some(line)) => {
                                            match serde_json::from_str::<Value>(&line) {
                                                Ok(value) => {
                                                    if tx.send(value).await.is_err() {
                                                        return;
                                                    }
                                                }
                                                Err(e) => tracing::warn!(
                                                    %notify_url,
                                                    "discarding unparseable notification: {}", e
                                                ),
                                            }
                                        }
                                        Ok(None) => break,
                                        Err(e) => {
                                            tracing::debug!(%notify_url, "notify stream error: {}", e);
                                            break;
                                        }
                                    },
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(%notify_url, "notify connect failed: {}", e);
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            });
        }
    }
}
