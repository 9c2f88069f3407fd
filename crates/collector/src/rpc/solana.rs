//! Solana JSON-RPC client.
//!
//! `getBlock` is called with `maxSupportedTransactionVersion = 0` and full
//! transaction details; a skipped slot surfaces as RPC error −32009 (or its
//! long-term-storage sibling −32007) and maps to [`FetchError::Skipped`].

use anyhow::Result;
use async_trait::async_trait;
use chainflow_core::{BlockRecord, ChainId, FetchError, Position, RecordSource, TxRecord, TxStatus};
use serde::Deserialize;
use serde_json::json;

use super::{classify_common_rpc_error, http_client, post_json_rpc, ChainClient, RpcFailure};

// Solana RPC error codes.
const SLOT_SKIPPED_SNAPSHOT: i64 = -32007;
const SLOT_SKIPPED_LONG_TERM: i64 = -32009;
const BLOCK_NOT_AVAILABLE: i64 = -32004;
const BLOCK_CLEANED_UP: i64 = -32001;

/// Client for a Solana JSON-RPC endpoint.
pub struct SolanaClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolBlock {
    blockhash: String,
    previous_blockhash: String,
    parent_slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    transactions: Vec<SolTxEnvelope>,
}

#[derive(Debug, Deserialize)]
struct SolTxEnvelope {
    transaction: SolTx,
    #[serde(default)]
    meta: Option<SolTxMeta>,
}

#[derive(Debug, Deserialize)]
struct SolTx {
    signatures: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SolTxMeta {
    #[serde(default)]
    err: Option<serde_json::Value>,
    #[serde(default)]
    fee: u64,
}

impl SolanaClient {
    /// Create a client for the endpoint at `url`.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: url.to_string(),
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, FetchError> {
        post_json_rpc(&self.http, &self.url, None, method, params)
            .await
            .map_err(|failure| match failure {
                RpcFailure::Transport(err) => err,
                RpcFailure::Rpc(err) => match err.code {
                    SLOT_SKIPPED_SNAPSHOT | SLOT_SKIPPED_LONG_TERM => FetchError::Skipped,
                    BLOCK_NOT_AVAILABLE | BLOCK_CLEANED_UP => FetchError::NotFound,
                    429 => FetchError::RateLimited { retry_after: None },
                    _ => classify_common_rpc_error(&err),
                },
            })
    }

    async fn fetch_block(&self, slot: Position) -> Result<SolBlock, FetchError> {
        let raw = self
            .call(
                "getBlock",
                json!([slot, {
                    "encoding": "json",
                    "transactionDetails": "full",
                    "rewards": false,
                    "maxSupportedTransactionVersion": 0,
                }]),
            )
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| FetchError::Fatal(format!("malformed getBlock response: {}", e)))
    }

    fn map_block(raw: &SolBlock, slot: Position, ingested_at: i64) -> BlockRecord {
        BlockRecord {
            chain: ChainId::Solana,
            position: slot,
            hash: raw.blockhash.clone(),
            parent_hash: Some(raw.previous_blockhash.clone()),
            timestamp: raw.block_time.unwrap_or(0),
            tx_count: raw.transactions.len() as u32,
            size_bytes: 0,
            difficulty: None,
            nonce: None,
            merkle_root: None,
            parent_slot: Some(raw.parent_slot),
            block_height: raw.block_height,
            source: RecordSource::PublicApi,
            ingested_at,
        }
    }

    fn map_tx(envelope: &SolTxEnvelope, slot: Position, block: &SolBlock) -> Option<TxRecord> {
        let signature = envelope.transaction.signatures.first()?.clone();
        let (fee, failed) = match &envelope.meta {
            Some(meta) => (meta.fee, meta.err.is_some()),
            None => (0, false),
        };
        Some(TxRecord {
            chain: ChainId::Solana,
            tx_id: signature,
            position: slot,
            block_hash: block.blockhash.clone(),
            fee,
            size_bytes: 0,
            input_count: None,
            output_count: None,
            status: if failed { TxStatus::Failed } else { TxStatus::Success },
            timestamp: block.block_time.unwrap_or(0),
            source: RecordSource::PublicApi,
        })
    }
}

#[async_trait]
impl ChainClient for SolanaClient {
    async fn tip_position(&self) -> Result<Position, FetchError> {
        let slot = self
            .call("getSlot", json!([{"commitment": "finalized"}]))
            .await?;
        slot.as_u64()
            .ok_or_else(|| FetchError::Fatal("getSlot returned non-integer".to_string()))
    }

    async fn block(&self, position: Position) -> Result<BlockRecord, FetchError> {
        let raw = self.fetch_block(position).await?;
        Ok(Self::map_block(&raw, position, chrono::Utc::now().timestamp()))
    }

    async fn block_transactions(
        &self,
        position: Position,
        limit: usize,
    ) -> Result<Vec<TxRecord>, FetchError> {
        let raw = self.fetch_block(position).await?;
        let mut txs: Vec<TxRecord> = raw
            .transactions
            .iter()
            .filter_map(|envelope| Self::map_tx(envelope, position, &raw))
            .collect();
        if limit > 0 {
            txs.truncate(limit);
        }
        Ok(txs)
    }

    fn source(&self) -> RecordSource {
        RecordSource::PublicApi
    }
}
