//! Retrying RPC client for the provider's HTTP API.
//!
//! Every outbound call goes through [`RpcClient::call`], which owns the retry
//! policy: linear backoff with jitter for transient failures, verbatim (capped)
//! sleeps for provider rate-limit hints, and no retries for client errors.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use cbb_core::{config::Config, RpcError};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub retry_after_cap: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            base_delay: cfg.rpc_base_delay,
            retry_after_cap: cfg.retry_after_cap,
            request_timeout: cfg.request_timeout,
        }
    }

    /// `base × attempt` plus jitter in `[0, 0.3 × base)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter_span = base_ms * 3 / 10;
        let jitter = if jitter_span > 0 {
            rand::thread_rng().gen_range(0..jitter_span)
        } else {
            0
        };
        Duration::from_millis(base_ms * u64::from(attempt) + jitter)
    }
}

/// Provider reply envelope: `{ok, result, description, error_code, parameters}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct RpcRequest<'a> {
    pub method: &'a str,
    pub params: &'a Value,
    pub is_write: bool,
    pub timeout: Duration,
}

/// Failure below the provider protocol. All variants are transient.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed response (http {status}): {detail}")]
    Malformed { status: u16, detail: String },
}

/// One HTTP exchange with the provider. Seam for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &RpcRequest<'_>) -> Result<Envelope, TransportError>;
}

/// `reqwest` transport with a pooled client.
///
/// Writes are POSTed as JSON; reads are GETs with query parameters.
pub struct HttpTransport {
    http: reqwest::Client,
    base: String,
}

impl HttpTransport {
    pub fn new(api_base: &str, token: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Network(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            base: format!("{}/bot{token}", api_base.trim_end_matches('/')),
        })
    }

    fn map_err(e: reqwest::Error) -> TransportError {
        // The URL contains the bot token; never let it reach the logs.
        let e = e.without_url();
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, req: &RpcRequest<'_>) -> Result<Envelope, TransportError> {
        let url = format!("{}/{}", self.base, req.method);
        let builder = if req.is_write {
            self.http.post(url).json(req.params)
        } else {
            self.http.get(url).query(&query_pairs(req.params))
        };

        let resp = builder
            .timeout(req.timeout)
            .send()
            .await
            .map_err(Self::map_err)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(Self::map_err)?;

        // The envelope is returned for error statuses too; anything else is malformed.
        serde_json::from_slice::<Envelope>(&body).map_err(|e| TransportError::Malformed {
            status: status.as_u16(),
            detail: format!(
                "{e}: {}",
                String::from_utf8_lossy(&body).chars().take(200).collect::<String>()
            ),
        })
    }
}

/// Flatten a JSON object into query pairs; nested values are JSON-encoded.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let Some(obj) = params.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

enum Failure {
    Transient(RpcError),
    RateLimited(RpcError, Duration),
}

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Call `method` up to `max_retries` times (at least once).
    ///
    /// A long-poll `timeout` parameter (seconds) is added to the request
    /// timeout so the server-side wait is not mistaken for a stall.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        is_write: bool,
        max_retries: u32,
    ) -> Result<Value, RpcError> {
        let attempts = max_retries.max(1);
        let long_poll = params
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or_default();
        let req = RpcRequest {
            method,
            params: &params,
            is_write,
            timeout: self.policy.request_timeout + long_poll,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let failure = match self.transport.send(&req).await {
                Ok(env) if env.ok => return Ok(env.result.unwrap_or(Value::Null)),
                Ok(env) => {
                    let retry_after = env
                        .parameters
                        .and_then(|p| p.retry_after)
                        .map(Duration::from_secs);
                    let err = RpcError {
                        method: method.to_string(),
                        description: env
                            .description
                            .unwrap_or_else(|| "provider returned ok=false".to_string()),
                        error_code: env.error_code,
                        retry_after,
                    };
                    match retry_after {
                        Some(wait) => Failure::RateLimited(err, wait.min(self.policy.retry_after_cap)),
                        None if is_client_error(env.error_code) => return Err(err),
                        None => Failure::Transient(err),
                    }
                }
                Err(e) => Failure::Transient(RpcError::new(method, e.to_string())),
            };

            let (err, wait) = match failure {
                Failure::RateLimited(err, wait) => (err, wait),
                Failure::Transient(err) => (err, self.policy.backoff(attempt)),
            };
            if attempt >= attempts {
                return Err(err);
            }

            tracing::warn!(
                method,
                attempt,
                attempts,
                wait_ms = wait.as_millis() as u64,
                "rpc call failed, retrying: {}",
                err.description
            );
            sleep(wait).await;
        }
    }
}

/// 4xx answers other than 429 will not get better by retrying.
fn is_client_error(code: Option<i64>) -> bool {
    matches!(code, Some(c) if (400..500).contains(&c) && c != 429)
}
