//! Recover-Netutils
//!
//! This crate provides the `RpcConnector` struct,
//! used to communicate with a scan service over JSON-RPC

#![warn(missing_docs)]
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use http::Uri;
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use recover_sync::error::ServiceError;
use recover_sync::interface::{InputValidator, ScanService};
use recover_sync::primitives::{BatchSize, ScanCursor, ScanParameters};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors of the JSON-RPC transport
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The HTTP client failed to build, connect, send or read
    #[error("HTTP error. {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status
    #[error("Unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    /// The server returned a JSON-RPC error object
    #[error("Remote error {code}. {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },
    /// The body was not the expected JSON-RPC response
    #[error("Malformed response. {0}")]
    Decode(#[from] serde_json::Error),
    /// The request could not be built from the given parameters
    #[error("Invalid request. {0}")]
    InvalidRequest(String),
}

impl From<RpcError> for ServiceError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Http(e) if e.is_timeout() => ServiceError::Timeout(CONNECT_TIMEOUT),
            RpcError::Http(e) => ServiceError::Transport(e.to_string()),
            RpcError::Status(status) => ServiceError::Transport(format!("HTTP status {status}")),
            RpcError::Remote { code, message } => ServiceError::Remote { code, message },
            RpcError::Decode(e) => ServiceError::InvalidResponse(e.to_string()),
            RpcError::InvalidRequest(reason) => ServiceError::InvalidRequest(reason),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// The connector, containing the URI of the scan service.
///
/// Each method of [`ScanService`] and [`InputValidator`] maps onto one JSON-RPC method of the
/// service: `init`, `run_scan`, `do_sweep`, `is_valid_seed` and `is_valid_address`, with
/// snake_case named parameters. Clones share the underlying HTTP connection pool.
#[derive(Clone, Debug)]
pub struct RpcConnector {
    uri: Uri,
    client: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcConnector {
    /// Takes a URI, and wraps in a RpcConnector
    pub fn new(uri: Uri) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(RpcConnector {
            uri,
            client,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// The URI to connect to
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Calls `method` with named `params` and decodes the `result` member of the response.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        tracing::debug!("Calling {} on {}", method, self.uri);

        let response = self
            .client
            .post(self.uri.to_string())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Status(status));
        }
        let body = response.bytes().await?;

        decode_response(&body)
    }
}

fn decode_response<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcError> {
    let response: RpcResponse = serde_json::from_slice(body)?;
    if let Some(RpcErrorObject { code, message }) = response.error {
        return Err(RpcError::Remote { code, message });
    }

    Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
}

fn init_params(params: &ScanParameters) -> Value {
    json!({
        "seed": params.seed().expose_secret(),
        "ntaddrs": params.ntaddrs(),
        "nzaddrs": params.nzaddrs(),
        "birth_height": params.birth_height(),
        "lwd_url": params.lwd_url(),
    })
}

fn run_scan_params(params: &ScanParameters, batch_size: BatchSize) -> Value {
    json!({
        "max_blocks": batch_size.get(),
        "lwd_url": params.lwd_url(),
    })
}

fn do_sweep_params(params: &ScanParameters) -> Result<Value, RpcError> {
    let end_height = params.end_height().ok_or_else(|| {
        RpcError::InvalidRequest("sweep requires the end height of a completed scan".to_string())
    })?;

    Ok(json!({
        "destination": params.destination(),
        "end_height": end_height.height(),
        "lwd_url": params.lwd_url(),
    }))
}

impl InputValidator for RpcConnector {
    async fn validate_seed(&self, seed: &str) -> Result<bool, ServiceError> {
        Ok(self.call("is_valid_seed", json!({ "seed": seed })).await?)
    }

    async fn validate_address(&self, address: &str) -> Result<bool, ServiceError> {
        Ok(self
            .call("is_valid_address", json!({ "address": address }))
            .await?)
    }
}

impl ScanService for RpcConnector {
    async fn init(&self, params: &ScanParameters) -> Result<(), ServiceError> {
        Ok(self.call("init", init_params(params)).await?)
    }

    async fn scan_step(
        &self,
        params: &ScanParameters,
        batch_size: BatchSize,
    ) -> Result<ScanCursor, ServiceError> {
        let height: u32 = self
            .call("run_scan", run_scan_params(params, batch_size))
            .await?;

        Ok(ScanCursor::from_u32(height))
    }

    async fn sweep(&self, params: &ScanParameters) -> Result<(), ServiceError> {
        Ok(self.call("do_sweep", do_sweep_params(params)?).await?)
    }
}
