//! Bitcoin Core JSON-RPC client (local full node, HTTP basic auth).
//!
//! `getblock` at verbosity 2 returns full transaction objects, so a single
//! call serves both the block and its transactions. No rate limits apply to
//! a local node, but the shared error taxonomy still does.

use anyhow::Result;
use async_trait::async_trait;
use chainflow_core::{BlockRecord, ChainId, FetchError, Position, RecordSource, TxRecord, TxStatus};
use serde::Deserialize;
use serde_json::json;

use super::{classify_common_rpc_error, http_client, post_json_rpc, ChainClient, RpcFailure};

// Bitcoin Core RPC error codes.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5; // "Block not found"
const RPC_INVALID_PARAMETER: i64 = -8; // "Block height out of range"
const RPC_IN_WARMUP: i64 = -28;

/// Client for a local Bitcoin Core node.
pub struct BitcoinCoreClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CoreBlock {
    hash: String,
    height: u64,
    time: i64,
    #[serde(rename = "nTx")]
    n_tx: u32,
    size: u64,
    #[serde(default)]
    previousblockhash: Option<String>,
    #[serde(default)]
    merkleroot: Option<String>,
    #[serde(default)]
    difficulty: Option<f64>,
    #[serde(default)]
    nonce: Option<u32>,
    #[serde(default)]
    tx: Vec<CoreTx>,
}

#[derive(Debug, Deserialize)]
struct CoreTx {
    txid: String,
    size: u64,
    /// Fee in BTC; absent for the coinbase transaction.
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    vin: Vec<serde_json::Value>,
    #[serde(default)]
    vout: Vec<serde_json::Value>,
}

impl BitcoinCoreClient {
    /// Create a client for the node at `url` with basic-auth credentials.
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, FetchError> {
        post_json_rpc(
            &self.http,
            &self.url,
            Some((&self.user, &self.password)),
            method,
            params,
        )
        .await
        .map_err(|failure| match failure {
            RpcFailure::Transport(err) => err,
            RpcFailure::Rpc(err) => match err.code {
                RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER => FetchError::NotFound,
                RPC_IN_WARMUP => FetchError::Transient(format!("node warming up: {}", err.message)),
                _ => classify_common_rpc_error(&err),
            },
        })
    }

    /// Fetch the verbose block (verbosity 2: full transaction objects).
    async fn verbose_block(&self, position: Position) -> Result<CoreBlock, FetchError> {
        let hash = self.call("getblockhash", json!([position])).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| FetchError::Fatal("getblockhash returned non-string".to_string()))?
            .to_string();

        let raw = self.call("getblock", json!([hash, 2])).await?;
        serde_json::from_value(raw)
            .map_err(|e| FetchError::Fatal(format!("malformed getblock response: {}", e)))
    }

    fn map_block(raw: &CoreBlock, ingested_at: i64) -> BlockRecord {
        BlockRecord {
            chain: ChainId::Bitcoin,
            position: raw.height,
            hash: raw.hash.clone(),
            parent_hash: raw.previousblockhash.clone(),
            timestamp: raw.time,
            tx_count: raw.n_tx,
            size_bytes: raw.size,
            difficulty: raw.difficulty.map(|d| d as u64),
            nonce: raw.nonce,
            merkle_root: raw.merkleroot.clone(),
            parent_slot: None,
            block_height: None,
            source: RecordSource::LocalNode,
            ingested_at,
        }
    }

    fn map_tx(raw: &CoreTx, block: &CoreBlock) -> TxRecord {
        // getblock reports fees in BTC; records carry satoshis.
        let fee = raw
            .fee
            .map(|btc| (btc * 100_000_000.0).round() as u64)
            .unwrap_or(0);
        TxRecord {
            chain: ChainId::Bitcoin,
            tx_id: raw.txid.clone(),
            position: block.height,
            block_hash: block.hash.clone(),
            fee,
            size_bytes: raw.size,
            input_count: Some(raw.vin.len() as u32),
            output_count: Some(raw.vout.len() as u32),
            status: TxStatus::Success,
            timestamp: block.time,
            source: RecordSource::LocalNode,
        }
    }
}

#[async_trait]
impl ChainClient for BitcoinCoreClient {
    async fn tip_position(&self) -> Result<Position, FetchError> {
        let count = self.call("getblockcount", json!([])).await?;
        count
            .as_u64()
            .ok_or_else(|| FetchError::Fatal("getblockcount returned non-integer".to_string()))
    }

    async fn block(&self, position: Position) -> Result<BlockRecord, FetchError> {
        let raw = self.verbose_block(position).await?;
        Ok(Self::map_block(&raw, chrono::Utc::now().timestamp()))
    }

    async fn block_transactions(
        &self,
        position: Position,
        limit: usize,
    ) -> Result<Vec<TxRecord>, FetchError> {
        let raw = self.verbose_block(position).await?;
        let take = if limit == 0 { raw.tx.len() } else { limit.min(raw.tx.len()) };
        Ok(raw.tx[..take].iter().map(|tx| Self::map_tx(tx, &raw)).collect())
    }

    fn source(&self) -> RecordSource {
        RecordSource::LocalNode
    }
}
