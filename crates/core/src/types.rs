//! Domain types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Monotonic 64-bit chain index: block height for Bitcoin, slot for Solana.
pub type Position = u64;

/// Identifies one of the supported chains and therefore one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    /// Bitcoin mainnet (height-indexed, UTXO transactions).
    Bitcoin,
    /// Solana mainnet (slot-indexed; a slot may be empty).
    Solana,
}

impl ChainId {
    /// Stable lowercase identifier used in storage and telemetry.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChainId::Bitcoin => "bitcoin",
            ChainId::Solana => "solana",
        }
    }

    /// All supported chains, in a fixed order.
    pub const fn all() -> [ChainId; 2] {
        [ChainId::Bitcoin, ChainId::Solana]
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(ChainId::Bitcoin),
            "solana" => Ok(ChainId::Solana),
            other => Err(CoreError::UnknownChain(other.to_string())),
        }
    }
}

/// Which upstream supplied a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// A locally operated full node (Bitcoin Core JSON-RPC).
    LocalNode,
    /// A public HTTP API (Esplora REST, public Solana JSON-RPC).
    PublicApi,
}

impl RecordSource {
    /// Stable identifier used in storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordSource::LocalNode => "local_node",
            RecordSource::PublicApi => "public_api",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block (Bitcoin) or a non-empty slot (Solana) as the engine persists it.
///
/// Chain-specific fields are optional: `difficulty`/`nonce`/`merkle_root`
/// are Bitcoin-only, `parent_slot`/`block_height` are Solana-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Chain this block belongs to.
    pub chain: ChainId,
    /// Height (Bitcoin) or slot (Solana).
    pub position: Position,
    /// Canonical block hash (hex for Bitcoin, base58 for Solana).
    pub hash: String,
    /// Parent block hash; `None` only for genesis.
    pub parent_hash: Option<String>,
    /// Producer timestamp, unix seconds.
    pub timestamp: i64,
    /// Number of transactions in the block.
    pub tx_count: u32,
    /// Serialized block size in bytes (0 when the upstream does not report it).
    pub size_bytes: u64,
    /// Bitcoin proof-of-work difficulty, truncated to an integer.
    pub difficulty: Option<u64>,
    /// Bitcoin block header nonce.
    pub nonce: Option<u32>,
    /// Bitcoin merkle root.
    pub merkle_root: Option<String>,
    /// Solana parent slot (may differ from `position - 1` across skipped slots).
    pub parent_slot: Option<u64>,
    /// Solana block height (≤ slot).
    pub block_height: Option<u64>,
    /// Upstream that supplied the block.
    pub source: RecordSource,
    /// Ingestion timestamp, unix seconds.
    pub ingested_at: i64,
}

/// Execution status of a transaction. Bitcoin transactions are implicitly
/// successful once mined; Solana records the on-chain outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Executed successfully.
    Success,
    /// Included but failed during execution (Solana only).
    Failed,
}

impl TxStatus {
    /// Stable identifier used in storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
        }
    }
}

/// A transaction as the engine persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Chain this transaction belongs to.
    pub chain: ChainId,
    /// Natural key: txid (Bitcoin) or first signature (Solana).
    pub tx_id: String,
    /// Position of the containing block.
    pub position: Position,
    /// Hash of the containing block.
    pub block_hash: String,
    /// Fee in native base units (satoshis / lamports).
    pub fee: u64,
    /// Serialized size in bytes (0 when the upstream does not report it).
    pub size_bytes: u64,
    /// Bitcoin input count.
    pub input_count: Option<u32>,
    /// Bitcoin output count.
    pub output_count: Option<u32>,
    /// Execution status.
    pub status: TxStatus,
    /// Producer timestamp of the containing block, unix seconds.
    pub timestamp: i64,
    /// Upstream that supplied the transaction.
    pub source: RecordSource,
}

/// Starting behavior for a chain with no persisted cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    /// Start at the current tip and follow as the chain grows.
    Tip,
    /// Start at a configured position below the tip.
    Backfill,
}

impl CollectionMode {
    /// Stable identifier used in storage and configuration.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CollectionMode::Tip => "tip",
            CollectionMode::Backfill => "backfill",
        }
    }
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tip" => Ok(CollectionMode::Tip),
            "backfill" => Ok(CollectionMode::Backfill),
            other => Err(CoreError::UnknownMode(other.to_string())),
        }
    }
}

/// Per-chain resume pointer, persisted atomically with each committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Chain the cursor belongs to.
    pub chain: ChainId,
    /// Last committed position. Every position in `[start, position]` is present.
    pub position: Position,
    /// Mode the collection was started in.
    pub mode: CollectionMode,
    /// When this cursor was first created, unix seconds.
    pub started_at: i64,
    /// Last advance, unix seconds.
    pub updated_at: i64,
}

/// Why a collection run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator-requested stop.
    Manual,
    /// Wall-clock safety budget tripped.
    TimeBudget,
    /// Storage safety budget tripped.
    SizeBudget,
    /// Unrecoverable failure.
    Fatal,
}

impl StopReason {
    /// Stable identifier used in storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::TimeBudget => "time_budget",
            StopReason::SizeBudget => "size_budget",
            StopReason::Fatal => "fatal",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(StopReason::Manual),
            "time_budget" => Ok(StopReason::TimeBudget),
            "size_budget" => Ok(StopReason::SizeBudget),
            "fatal" => Ok(StopReason::Fatal),
            other => Err(CoreError::UnknownStopReason(other.to_string())),
        }
    }
}

/// Supervisor-level bookkeeping for one start/stop span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRun {
    /// Row id.
    pub id: i64,
    /// Run start, unix seconds.
    pub started_at: i64,
    /// Run end, unix seconds; `None` while running.
    pub stopped_at: Option<i64>,
    /// Why the run ended; `None` while running.
    pub stop_reason: Option<StopReason>,
}

/// Severity of a quality verdict. Ordered: `Ok < Warn < Suspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// All checks passed.
    Ok,
    /// Minor irregularity; record is persisted as-is.
    Warn,
    /// Serious irregularity (malformed hash, broken parent linkage); record
    /// is still persisted, audit row flags it.
    Suspect,
}

impl QualityLevel {
    /// Stable identifier used in storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Ok => "ok",
            QualityLevel::Warn => "warn",
            QualityLevel::Suspect => "suspect",
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    /// Required hash field is empty.
    EmptyHash,
    /// Hash does not match the chain's length/alphabet.
    MalformedHash,
    /// Producer timestamp missing or non-positive.
    ZeroTimestamp,
    /// Tip-mode producer timestamp more than two hours from wall clock.
    TimestampDrift,
    /// Non-genesis block without a parent hash.
    MissingParentHash,
    /// Parent hash does not match the previously committed block's hash.
    ParentHashMismatch,
    /// Reported size is zero where the chain always reports one.
    NonPositiveSize,
    /// Solana block height exceeds its slot.
    HeightAboveSlot,
    /// Transaction id is empty or malformed.
    MalformedTxId,
}

impl QualityIssue {
    /// Stable tag used in the quality audit stream.
    pub const fn as_str(&self) -> &'static str {
        match self {
            QualityIssue::EmptyHash => "empty_hash",
            QualityIssue::MalformedHash => "malformed_hash",
            QualityIssue::ZeroTimestamp => "zero_timestamp",
            QualityIssue::TimestampDrift => "timestamp_drift",
            QualityIssue::MissingParentHash => "missing_parent_hash",
            QualityIssue::ParentHashMismatch => "parent_hash_mismatch",
            QualityIssue::NonPositiveSize => "non_positive_size",
            QualityIssue::HeightAboveSlot => "height_above_slot",
            QualityIssue::MalformedTxId => "malformed_tx_id",
        }
    }

    /// Severity this issue downgrades a record to.
    pub const fn severity(&self) -> QualityLevel {
        match self {
            QualityIssue::MalformedHash
            | QualityIssue::ParentHashMismatch
            | QualityIssue::MalformedTxId => QualityLevel::Suspect,
            _ => QualityLevel::Warn,
        }
    }
}

/// Outcome of validating one record. Informational; never blocks insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Overall severity (worst issue wins).
    pub level: QualityLevel,
    /// Ordered findings.
    pub issues: Vec<QualityIssue>,
}

impl QualityVerdict {
    /// A clean verdict.
    pub const fn ok() -> Self {
        QualityVerdict {
            level: QualityLevel::Ok,
            issues: Vec::new(),
        }
    }

    /// Build a verdict from findings; the level is the worst severity found.
    pub fn from_issues(issues: Vec<QualityIssue>) -> Self {
        let level = issues
            .iter()
            .map(QualityIssue::severity)
            .max()
            .unwrap_or(QualityLevel::Ok);
        QualityVerdict { level, issues }
    }

    /// True when no issues were found.
    pub fn is_ok(&self) -> bool {
        self.level == QualityLevel::Ok
    }

    /// Comma-joined issue tags for the audit stream.
    pub fn issue_tags(&self) -> String {
        self.issues
            .iter()
            .map(QualityIssue::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Kind of record a quality row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A block row.
    Block,
    /// A transaction row.
    Transaction,
}

impl RecordKind {
    /// Stable identifier used in storage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Block => "block",
            RecordKind::Transaction => "transaction",
        }
    }
}

/// Telemetry for one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Chain the cycle ran for.
    pub chain: ChainId,
    /// Cycle start, unix seconds.
    pub cycle_started_at: i64,
    /// Cycle wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Positions fetched this cycle (including empty slots).
    pub records_in: u64,
    /// Rows committed this cycle (blocks + transactions).
    pub records_out: u64,
    /// Errors observed this cycle.
    pub error_count: u32,
    /// Tag of the last error observed, if any.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_roundtrip() {
        for chain in ChainId::all() {
            assert_eq!(chain.as_str().parse::<ChainId>().unwrap(), chain);
        }
        assert!("ethereum".parse::<ChainId>().is_err());
    }

    #[test]
    fn chain_id_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChainId::Bitcoin).unwrap(),
            "\"bitcoin\""
        );
        let parsed: ChainId = serde_json::from_str("\"solana\"").unwrap();
        assert_eq!(parsed, ChainId::Solana);
    }

    #[test]
    fn stop_reason_roundtrip() {
        for reason in [
            StopReason::Manual,
            StopReason::TimeBudget,
            StopReason::SizeBudget,
            StopReason::Fatal,
        ] {
            assert_eq!(reason.as_str().parse::<StopReason>().unwrap(), reason);
        }
    }

    #[test]
    fn mode_roundtrip() {
        assert_eq!("tip".parse::<CollectionMode>().unwrap(), CollectionMode::Tip);
        assert_eq!(
            "backfill".parse::<CollectionMode>().unwrap(),
            CollectionMode::Backfill
        );
        assert!("historical".parse::<CollectionMode>().is_err());
    }

    #[test]
    fn verdict_level_is_worst_issue() {
        let verdict = QualityVerdict::from_issues(vec![
            QualityIssue::TimestampDrift,
            QualityIssue::ParentHashMismatch,
        ]);
        assert_eq!(verdict.level, QualityLevel::Suspect);
        assert_eq!(verdict.issue_tags(), "timestamp_drift,parent_hash_mismatch");

        let verdict = QualityVerdict::from_issues(vec![QualityIssue::NonPositiveSize]);
        assert_eq!(verdict.level, QualityLevel::Warn);

        assert!(QualityVerdict::from_issues(Vec::new()).is_ok());
    }

    #[test]
    fn quality_levels_are_ordered() {
        assert!(QualityLevel::Ok < QualityLevel::Warn);
        assert!(QualityLevel::Warn < QualityLevel::Suspect);
    }
}
