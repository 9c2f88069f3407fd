//! Typed upstream access.
//!
//! Each chain is reached through the [`ChainClient`] capability set. There is
//! no inheritance between clients: each implementation composes the shared
//! HTTP/JSON-RPC plumbing in this module with chain-specific wire handling.

use anyhow::Result;
use async_trait::async_trait;
use chainflow_core::{BlockRecord, FetchError, Position, RecordSource, TxRecord};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub mod bitcoin_core;
pub mod esplora;
pub mod router;
pub mod solana;

pub use bitcoin_core::BitcoinCoreClient;
pub use esplora::EsploraClient;
pub use router::SourceRouter;
pub use solana::SolanaClient;

/// Per-request timeout applied by every client.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-host connection cap, to avoid overwhelming a single upstream.
const MAX_IDLE_PER_HOST: usize = 8;

/// The capability set every chain must provide.
///
/// All methods surface the [`FetchError`] taxonomy; callers apply the
/// uniform retry/backoff policy. Implementations must preserve on-chain
/// transaction order and must return within the request timeout.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The chain's best-known position at this upstream.
    async fn tip_position(&self) -> Result<Position, FetchError>;

    /// Fetch the block at `position`.
    async fn block(&self, position: Position) -> Result<BlockRecord, FetchError>;

    /// Fetch the block's transactions in on-chain order. `limit` 0 means all.
    async fn block_transactions(
        &self,
        position: Position,
        limit: usize,
    ) -> Result<Vec<TxRecord>, FetchError>;

    /// Which upstream kind this client currently represents.
    fn source(&self) -> RecordSource;
}

/// The per-chain client set the supervisor hands to collectors.
///
/// Fields are `None` for disabled chains. Tests inject scripted
/// implementations here instead of real network clients.
#[derive(Clone)]
pub struct ChainClients {
    /// Bitcoin upstream (a [`SourceRouter`] when a local node is configured).
    pub bitcoin: Option<Arc<dyn ChainClient>>,
    /// Solana upstream.
    pub solana: Option<Arc<dyn ChainClient>>,
}

impl ChainClients {
    /// Build real clients from configuration.
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let bitcoin: Option<Arc<dyn ChainClient>> = if config.bitcoin.enabled {
            let public = EsploraClient::new(&config.bitcoin.public_api_url)?;
            if config.bitcoin.use_local_node {
                let local = BitcoinCoreClient::new(
                    &config.bitcoin.local_rpc_url,
                    &config.bitcoin.rpc_user,
                    &config.bitcoin.rpc_password,
                )?;
                Some(Arc::new(SourceRouter::new(
                    Arc::new(local),
                    Arc::new(public),
                )))
            } else {
                Some(Arc::new(public))
            }
        } else {
            None
        };

        let solana: Option<Arc<dyn ChainClient>> = if config.solana.enabled {
            Some(Arc::new(SolanaClient::new(&config.solana.rpc_url)?))
        } else {
            None
        };

        Ok(Self { bitcoin, solana })
    }

    /// Client for `chain`, if enabled.
    pub fn for_chain(&self, chain: chainflow_core::ChainId) -> Option<Arc<dyn ChainClient>> {
        match chain {
            chainflow_core::ChainId::Bitcoin => self.bitcoin.clone(),
            chainflow_core::ChainId::Solana => self.solana.clone(),
        }
    }
}

/// Shared reqwest client with the engine's timeout and pooling policy.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .build()
        .map_err(Into::into)
}

/// Map an HTTP status to the error taxonomy. `Ok` statuses return `None`.
pub(crate) fn classify_status(
    status: StatusCode,
    retry_after_secs: Option<u64>,
) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: retry_after_secs.map(Duration::from_secs),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::Fatal(format!("upstream rejected credentials: {}", status))
        }
        s if s.is_server_error() => FetchError::Transient(format!("upstream returned {}", s)),
        s => FetchError::Fatal(format!("unexpected upstream status: {}", s)),
    })
}

/// Map a reqwest transport error to the taxonomy.
pub(crate) fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(err.to_string())
    } else if err.is_decode() {
        FetchError::Fatal(format!("malformed upstream response: {}", err))
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// Parse a `Retry-After` header value (seconds form only).
pub(crate) fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

/// Failure modes of a JSON-RPC call: transport problems are already
/// classified; RPC-level errors carry the upstream code for the caller to
/// map chain-specifically.
pub(crate) enum RpcFailure {
    Transport(FetchError),
    Rpc(JsonRpcError),
}

impl From<FetchError> for RpcFailure {
    fn from(err: FetchError) -> Self {
        RpcFailure::Transport(err)
    }
}

/// Issue a JSON-RPC 2.0 call and return the raw `result` value.
pub(crate) async fn post_json_rpc(
    http: &reqwest::Client,
    url: &str,
    auth: Option<(&str, &str)>,
    method: &str,
    params: Value,
) -> Result<Value, RpcFailure> {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let mut request = http.post(url).json(&payload);
    if let Some((user, password)) = auth {
        request = request.basic_auth(user, Some(password));
    }

    let response = request.send().await.map_err(classify_transport)?;

    let status = response.status();
    let retry_after = retry_after_secs(&response);
    if !status.is_success() {
        // Bitcoin Core wraps RPC errors in non-2xx statuses with a JSON-RPC
        // body; the body's error code is the authoritative signal.
        if let Ok(body) = response.json::<JsonRpcResponse>().await {
            if let Some(error) = body.error {
                return Err(RpcFailure::Rpc(error));
            }
        }
        let err = match classify_status(status, retry_after) {
            // A bare 404 from a JSON-RPC endpoint is a routing problem, not
            // a missing position.
            Some(FetchError::NotFound) => {
                FetchError::Fatal(format!("no RPC endpoint at {}", url))
            }
            Some(other) => other,
            None => FetchError::Transient(format!("upstream returned {}", status)),
        };
        return Err(err.into());
    }

    let body: JsonRpcResponse = response
        .json()
        .await
        .map_err(|e| FetchError::Fatal(format!("malformed JSON-RPC response: {}", e)))?;

    if let Some(error) = body.error {
        return Err(RpcFailure::Rpc(error));
    }

    body.result
        .ok_or_else(|| FetchError::Fatal("JSON-RPC response missing result".to_string()).into())
}

/// Map JSON-RPC protocol errors every chain shares; chain-specific codes are
/// handled before falling back to this.
pub(crate) fn classify_common_rpc_error(err: &JsonRpcError) -> FetchError {
    match err.code {
        // Method not found / invalid request / invalid params / parse error.
        -32601 | -32600 | -32602 | -32700 => {
            FetchError::Fatal(format!("JSON-RPC {}: {}", err.code, err.message))
        }
        _ => FetchError::Transient(format!("JSON-RPC {}: {}", err.code, err.message)),
    }
}
