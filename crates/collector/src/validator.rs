//! Pure per-record quality checks.
//!
//! Verdicts are informational: a failing record is still persisted, with the
//! verdict written to the quality audit stream. The parent-hash check
//! downgrades a block to `suspect` but never blocks the chain; reconciling
//! reorgs is a downstream concern.

use chainflow_core::{
    BlockRecord, ChainId, CollectionMode, QualityIssue, QualityVerdict, TxRecord,
};

/// Maximum tolerated distance between a tip-mode block timestamp and wall
/// clock, in seconds.
const MAX_TIP_DRIFT_SECS: i64 = 2 * 60 * 60;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Inputs the checks need beyond the record itself.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Collection mode; timestamp drift only applies when following the tip.
    pub mode: CollectionMode,
    /// Wall-clock now, unix seconds.
    pub now: i64,
    /// Hash of the previously committed block, when known.
    pub prev_hash: Option<String>,
}

fn is_bitcoin_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

fn is_solana_hash(s: &str) -> bool {
    (32..=44).contains(&s.len()) && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn hash_matches_chain(chain: ChainId, s: &str) -> bool {
    match chain {
        ChainId::Bitcoin => is_bitcoin_hash(s),
        ChainId::Solana => is_solana_hash(s),
    }
}

/// Validate a block record.
pub fn validate_block(block: &BlockRecord, ctx: &ValidationContext) -> QualityVerdict {
    let mut issues = Vec::new();

    // Completeness and format.
    if block.hash.is_empty() {
        issues.push(QualityIssue::EmptyHash);
    } else if !hash_matches_chain(block.chain, &block.hash) {
        issues.push(QualityIssue::MalformedHash);
    }

    if block.timestamp <= 0 {
        issues.push(QualityIssue::ZeroTimestamp);
    } else if ctx.mode == CollectionMode::Tip && (ctx.now - block.timestamp).abs() > MAX_TIP_DRIFT_SECS
    {
        issues.push(QualityIssue::TimestampDrift);
    }

    // Accuracy: Bitcoin always reports a serialized size; Solana does not.
    if block.chain == ChainId::Bitcoin && block.size_bytes == 0 {
        issues.push(QualityIssue::NonPositiveSize);
    }

    // Consistency.
    match &block.parent_hash {
        Some(parent) => {
            if let Some(prev) = &ctx.prev_hash {
                if parent != prev {
                    issues.push(QualityIssue::ParentHashMismatch);
                }
            }
        }
        None => {
            if block.position > 0 {
                issues.push(QualityIssue::MissingParentHash);
            }
        }
    }

    if let Some(height) = block.block_height {
        if height > block.position {
            issues.push(QualityIssue::HeightAboveSlot);
        }
    }

    QualityVerdict::from_issues(issues)
}

/// Validate a transaction record.
pub fn validate_transaction(tx: &TxRecord) -> QualityVerdict {
    let mut issues = Vec::new();

    match tx.chain {
        ChainId::Bitcoin => {
            if tx.tx_id.is_empty() || !is_bitcoin_hash(&tx.tx_id) {
                issues.push(QualityIssue::MalformedTxId);
            }
            if tx.size_bytes == 0 {
                issues.push(QualityIssue::NonPositiveSize);
            }
        }
        ChainId::Solana => {
            // Signatures are base58 of a 64-byte value: longer than hashes.
            if tx.tx_id.is_empty()
                || !(64..=90).contains(&tx.tx_id.len())
                || !tx.tx_id.chars().all(|c| BASE58_ALPHABET.contains(c))
            {
                issues.push(QualityIssue::MalformedTxId);
            }
        }
    }

    if tx.timestamp <= 0 {
        issues.push(QualityIssue::ZeroTimestamp);
    }

    QualityVerdict::from_issues(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_core::{QualityLevel, RecordSource, TxStatus};

    fn btc_block(position: u64) -> BlockRecord {
        BlockRecord {
            chain: ChainId::Bitcoin,
            position,
            hash: "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054"
                .to_string(),
            parent_hash: Some(
                "00000000000000000000e26b211875ec4cd9097523e418eb4c6008c5b0e8a279".to_string(),
            ),
            timestamp: 1_690_168_629,
            tx_count: 10,
            size_bytes: 1000,
            difficulty: Some(1),
            nonce: Some(1),
            merkle_root: None,
            parent_slot: None,
            block_height: None,
            source: RecordSource::PublicApi,
            ingested_at: 1_690_168_700,
        }
    }

    fn ctx(mode: CollectionMode) -> ValidationContext {
        ValidationContext {
            mode,
            now: 1_690_168_700,
            prev_hash: None,
        }
    }

    #[test]
    fn test_clean_bitcoin_block() {
        let verdict = validate_block(&btc_block(800000), &ctx(CollectionMode::Tip));
        assert!(verdict.is_ok(), "unexpected issues: {:?}", verdict.issues);
    }

    #[test]
    fn test_malformed_hash_is_suspect() {
        let mut block = btc_block(800000);
        block.hash = "not-a-hash".to_string();
        let verdict = validate_block(&block, &ctx(CollectionMode::Tip));
        assert_eq!(verdict.level, QualityLevel::Suspect);
        assert!(verdict.issues.contains(&QualityIssue::MalformedHash));
    }

    #[test]
    fn test_timestamp_drift_only_in_tip_mode() {
        let mut block = btc_block(800000);
        block.timestamp = 1_690_168_700 - 3 * 60 * 60;

        let tip = validate_block(&block, &ctx(CollectionMode::Tip));
        assert!(tip.issues.contains(&QualityIssue::TimestampDrift));
        assert_eq!(tip.level, QualityLevel::Warn);

        let backfill = validate_block(&block, &ctx(CollectionMode::Backfill));
        assert!(backfill.is_ok());
    }

    #[test]
    fn test_parent_hash_mismatch_is_suspect() {
        let block = btc_block(800000);
        let context = ValidationContext {
            mode: CollectionMode::Tip,
            now: 1_690_168_700,
            prev_hash: Some(
                "1111111111111111111111111111111111111111111111111111111111111111".to_string(),
            ),
        };
        let verdict = validate_block(&block, &context);
        assert_eq!(verdict.level, QualityLevel::Suspect);
        assert!(verdict.issues.contains(&QualityIssue::ParentHashMismatch));
    }

    #[test]
    fn test_parent_hash_match_is_clean() {
        let block = btc_block(800000);
        let context = ValidationContext {
            mode: CollectionMode::Backfill,
            now: 1_690_168_700,
            prev_hash: block.parent_hash.clone(),
        };
        assert!(validate_block(&block, &context).is_ok());
    }

    #[test]
    fn test_genesis_may_lack_parent() {
        let mut block = btc_block(0);
        block.parent_hash = None;
        let verdict = validate_block(&block, &ctx(CollectionMode::Backfill));
        assert!(verdict.is_ok());

        let mut block = btc_block(5);
        block.parent_hash = None;
        let verdict = validate_block(&block, &ctx(CollectionMode::Backfill));
        assert!(verdict.issues.contains(&QualityIssue::MissingParentHash));
        assert_eq!(verdict.level, QualityLevel::Warn);
    }

    #[test]
    fn test_solana_height_above_slot() {
        let block = BlockRecord {
            chain: ChainId::Solana,
            position: 1000,
            hash: "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N".to_string(),
            parent_hash: Some("mfcyqEXB3DnHXki6KjjmZck6YjmZLvpAByy2fj4nh6B".to_string()),
            timestamp: 1_690_168_629,
            tx_count: 1,
            size_bytes: 0,
            difficulty: None,
            nonce: None,
            merkle_root: None,
            parent_slot: Some(999),
            block_height: Some(1001),
            source: RecordSource::PublicApi,
            ingested_at: 1_690_168_700,
        };
        let verdict = validate_block(&block, &ctx(CollectionMode::Tip));
        assert!(verdict.issues.contains(&QualityIssue::HeightAboveSlot));
    }

    #[test]
    fn test_solana_zero_size_is_not_an_issue() {
        let block = BlockRecord {
            chain: ChainId::Solana,
            position: 1000,
            hash: "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N".to_string(),
            parent_hash: Some("mfcyqEXB3DnHXki6KjjmZck6YjmZLvpAByy2fj4nh6B".to_string()),
            timestamp: 1_690_168_629,
            tx_count: 0,
            size_bytes: 0,
            difficulty: None,
            nonce: None,
            merkle_root: None,
            parent_slot: Some(999),
            block_height: Some(998),
            source: RecordSource::PublicApi,
            ingested_at: 1_690_168_700,
        };
        assert!(validate_block(&block, &ctx(CollectionMode::Tip)).is_ok());
    }

    #[test]
    fn test_bitcoin_transaction() {
        let tx = TxRecord {
            chain: ChainId::Bitcoin,
            tx_id: "b75ca3106ed100521aa50e3ec267a06431c6319538898b25e1b757a5736f5fb4"
                .to_string(),
            position: 800000,
            block_hash: "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054"
                .to_string(),
            fee: 5200,
            size_bytes: 222,
            input_count: Some(1),
            output_count: Some(2),
            status: TxStatus::Success,
            timestamp: 1_690_168_629,
            source: RecordSource::PublicApi,
        };
        assert!(validate_transaction(&tx).is_ok());

        let bad = TxRecord {
            tx_id: "zz".to_string(),
            size_bytes: 0,
            ..tx
        };
        let verdict = validate_transaction(&bad);
        assert_eq!(verdict.level, QualityLevel::Suspect);
        assert!(verdict.issues.contains(&QualityIssue::MalformedTxId));
        assert!(verdict.issues.contains(&QualityIssue::NonPositiveSize));
    }

    #[test]
    fn test_solana_signature_format() {
        let tx = TxRecord {
            chain: ChainId::Solana,
            tx_id: "5j7s6NiJS3JAkvgkoc18WVAsiSaci2pxB2A6ueCJP4tprA2TFg9wSyTLeYouxPBJEMzJinENTkpA52YStRW5Dia7".to_string(),
            position: 1000,
            block_hash: "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N".to_string(),
            fee: 5000,
            size_bytes: 0,
            input_count: None,
            output_count: None,
            status: TxStatus::Success,
            timestamp: 1_690_168_629,
            source: RecordSource::PublicApi,
        };
        assert!(validate_transaction(&tx).is_ok());

        let bad = TxRecord {
            tx_id: "0OIl".to_string(),
            ..tx
        };
        assert_eq!(validate_transaction(&bad).level, QualityLevel::Suspect);
    }
}
