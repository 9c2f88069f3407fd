//! Bitcoin public REST client (Esplora-compatible, e.g. blockstream.info).
//!
//! Blocks are addressed by hash upstream, so position lookups go through
//! `/block-height/{n}` first. Transaction listings are paginated 25 per page
//! via `/block/{hash}/txs/{start_index}`.

use anyhow::Result;
use async_trait::async_trait;
use chainflow_core::{BlockRecord, ChainId, FetchError, Position, RecordSource, TxRecord, TxStatus};
use serde::Deserialize;

use super::{classify_status, classify_transport, http_client, retry_after_secs, ChainClient};

const TXS_PER_PAGE: usize = 25;

/// Client for an Esplora-compatible Bitcoin REST API.
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    id: String,
    height: u64,
    timestamp: i64,
    tx_count: u32,
    size: u64,
    #[serde(default)]
    previousblockhash: Option<String>,
    #[serde(default)]
    merkle_root: Option<String>,
    #[serde(default)]
    difficulty: Option<f64>,
    #[serde(default)]
    nonce: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    size: u64,
    #[serde(default)]
    fee: Option<u64>,
    #[serde(default)]
    vin: Vec<serde_json::Value>,
    #[serde(default)]
    vout: Vec<serde_json::Value>,
}

impl EsploraClient {
    /// Create a client against the given base URL (no trailing slash needed).
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await.map_err(classify_transport)?;

        let retry_after = retry_after_secs(&response);
        if let Some(err) = classify_status(response.status(), retry_after) {
            return Err(err);
        }
        Ok(response)
    }

    async fn get_text(&self, path: &str) -> Result<String, FetchError> {
        self.get(path)
            .await?
            .text()
            .await
            .map_err(classify_transport)
    }

    /// Resolve a height to its block hash. 404 means the height is beyond tip.
    async fn block_hash_at(&self, position: Position) -> Result<String, FetchError> {
        let hash = self.get_text(&format!("/block-height/{}", position)).await?;
        let hash = hash.trim().to_string();
        if hash.len() != 64 {
            return Err(FetchError::Fatal(format!(
                "malformed block hash for height {}: {:?}",
                position, hash
            )));
        }
        Ok(hash)
    }

    fn map_block(&self, raw: EsploraBlock, ingested_at: i64) -> BlockRecord {
        BlockRecord {
            chain: ChainId::Bitcoin,
            position: raw.height,
            hash: raw.id,
            parent_hash: raw.previousblockhash,
            timestamp: raw.timestamp,
            tx_count: raw.tx_count,
            size_bytes: raw.size,
            difficulty: raw.difficulty.map(|d| d as u64),
            nonce: raw.nonce,
            merkle_root: raw.merkle_root,
            parent_slot: None,
            block_height: None,
            source: RecordSource::PublicApi,
            ingested_at,
        }
    }

    fn map_tx(raw: EsploraTx, position: Position, block_hash: &str, timestamp: i64) -> TxRecord {
        TxRecord {
            chain: ChainId::Bitcoin,
            tx_id: raw.txid,
            position,
            block_hash: block_hash.to_string(),
            fee: raw.fee.unwrap_or(0),
            size_bytes: raw.size,
            input_count: Some(raw.vin.len() as u32),
            output_count: Some(raw.vout.len() as u32),
            status: TxStatus::Success,
            timestamp,
            source: RecordSource::PublicApi,
        }
    }
}

#[async_trait]
impl ChainClient for EsploraClient {
    async fn tip_position(&self) -> Result<Position, FetchError> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.trim()
            .parse()
            .map_err(|_| FetchError::Fatal(format!("malformed tip height: {:?}", text)))
    }

    async fn block(&self, position: Position) -> Result<BlockRecord, FetchError> {
        let hash = self.block_hash_at(position).await?;
        let raw: EsploraBlock = self
            .get(&format!("/block/{}", hash))
            .await?
            .json()
            .await
            .map_err(classify_transport)?;
        Ok(self.map_block(raw, chrono::Utc::now().timestamp()))
    }

    async fn block_transactions(
        &self,
        position: Position,
        limit: usize,
    ) -> Result<Vec<TxRecord>, FetchError> {
        let hash = self.block_hash_at(position).await?;
        let raw_block: EsploraBlock = self
            .get(&format!("/block/{}", hash))
            .await?
            .json()
            .await
            .map_err(classify_transport)?;
        let timestamp = raw_block.timestamp;

        let mut txs = Vec::new();
        let mut start = 0usize;
        loop {
            let path = if start == 0 {
                format!("/block/{}/txs", hash)
            } else {
                format!("/block/{}/txs/{}", hash, start)
            };
            let page: Vec<EsploraTx> = self
                .get(&path)
                .await?
                .json()
                .await
                .map_err(classify_transport)?;
            let page_len = page.len();

            for raw in page {
                txs.push(Self::map_tx(raw, position, &hash, timestamp));
                if limit > 0 && txs.len() >= limit {
                    return Ok(txs);
                }
            }

            if page_len < TXS_PER_PAGE {
                return Ok(txs);
            }
            start += TXS_PER_PAGE;
        }
    }

    fn source(&self) -> RecordSource {
        RecordSource::PublicApi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block_json() -> &'static str {
        r#"{
            "id": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
            "height": 800000,
            "version": 874340352,
            "timestamp": 1690168629,
            "tx_count": 3721,
            "size": 1634536,
            "weight": 3997770,
            "merkle_root": "91f01a00530c8c83617190048ea8b0814d506cf24dfdbcf8893f8f0cab7f0855",
            "previousblockhash": "00000000000000000000e26b211875ec4cd9097523e418eb4c6008c5b0e8a279",
            "mediantime": 1690165851,
            "nonce": 106861918,
            "bits": 386228059,
            "difficulty": 53911173001054.59
        }"#
    }

    #[test]
    fn test_map_block() {
        let client = EsploraClient::new("https://blockstream.info/api").unwrap();
        let raw: EsploraBlock = serde_json::from_str(sample_block_json()).unwrap();
        let block = client.map_block(raw, 1_700_000_000);

        assert_eq!(block.chain, ChainId::Bitcoin);
        assert_eq!(block.position, 800000);
        assert_eq!(
            block.hash,
            "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054"
        );
        assert_eq!(block.timestamp, 1690168629);
        assert_eq!(block.tx_count, 3721);
        assert_eq!(block.size_bytes, 1634536);
        assert_eq!(block.difficulty, Some(53911173001054));
        assert_eq!(block.nonce, Some(106861918));
        assert!(block.parent_hash.is_some());
        assert_eq!(block.parent_slot, None);
        assert_eq!(block.source, RecordSource::PublicApi);
    }

    #[test]
    fn test_map_block_genesis_has_no_parent() {
        let client = EsploraClient::new("https://blockstream.info/api").unwrap();
        let raw: EsploraBlock = serde_json::from_str(
            r#"{
                "id": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                "height": 0,
                "timestamp": 1231006505,
                "tx_count": 1,
                "size": 285,
                "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "nonce": 2083236893,
                "difficulty": 1.0
            }"#,
        )
        .unwrap();
        let block = client.map_block(raw, 1_700_000_000);
        assert_eq!(block.position, 0);
        assert!(block.parent_hash.is_none());
    }

    #[test]
    fn test_map_tx() {
        let raw: EsploraTx = serde_json::from_str(
            r#"{
                "txid": "b75ca3106ed100521aa50e3ec267a06431c6319538898b25e1b757a5736f5fb4",
                "version": 1,
                "locktime": 0,
                "vin": [{}],
                "vout": [{}, {}],
                "size": 222,
                "weight": 561,
                "fee": 5200,
                "status": {"confirmed": true, "block_height": 800000}
            }"#,
        )
        .unwrap();
        let tx = EsploraClient::map_tx(raw, 800000, "abcd", 1690168629);
        assert_eq!(tx.chain, ChainId::Bitcoin);
        assert_eq!(tx.fee, 5200);
        assert_eq!(tx.size_bytes, 222);
        assert_eq!(tx.input_count, Some(1));
        assert_eq!(tx.output_count, Some(2));
        assert_eq!(tx.status, TxStatus::Success);
        assert_eq!(tx.position, 800000);
    }

    #[test]
    fn test_map_tx_coinbase_has_zero_fee() {
        let raw: EsploraTx = serde_json::from_str(
            r#"{"txid": "aa", "size": 100, "vin": [{}], "vout": [{}]}"#,
        )
        .unwrap();
        let tx = EsploraClient::map_tx(raw, 1, "hash", 0);
        assert_eq!(tx.fee, 0);
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = EsploraClient::new("https://blockstream.info/api/").unwrap();
        assert_eq!(client.base_url, "https://blockstream.info/api");
    }
}
