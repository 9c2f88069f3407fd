//! Batched, idempotent persistence with atomic cursor advancement.
//!
//! The happy path writes a whole batch (blocks, transactions, quality rows,
//! the cycle metric, and the cursor) in one transaction. Transient database
//! errors retry the batch; a persistently failing batch falls back to
//! per-record inserts to isolate a poison record. A poison transaction is
//! logged and skipped; a poison block ends the committed prefix, and the
//! cursor never advances past it.

use anyhow::{Context, Result};
use chainflow_core::{
    BlockRecord, ChainId, CollectionMode, MetricSample, Position, QualityVerdict, RecordKind,
    TxRecord,
};
use sqlx::Sqlite;
use std::time::Duration;
use tracing::{error, warn};

use super::Storage;

const BATCH_RETRIES: u32 = 3;
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One row of the quality audit stream.
#[derive(Debug, Clone)]
pub struct QualityRow {
    /// Whether the verdict refers to a block or a transaction.
    pub record_kind: RecordKind,
    /// Position (blocks) or tx id (transactions).
    pub record_id: String,
    /// The verdict.
    pub verdict: QualityVerdict,
    /// When validation ran, unix seconds.
    pub observed_at: i64,
}

/// A batch to commit atomically for one chain.
#[derive(Debug)]
pub struct BatchCommit<'a> {
    /// Chain the batch belongs to.
    pub chain: ChainId,
    /// Mode recorded on a freshly created cursor.
    pub mode: CollectionMode,
    /// Blocks in ascending position order.
    pub blocks: &'a [BlockRecord],
    /// Transactions of those blocks, in on-chain order.
    pub txs: &'a [TxRecord],
    /// Quality verdicts for the batch.
    pub quality: &'a [QualityRow],
    /// Cycle telemetry, written alongside the batch.
    pub metric: Option<&'a MetricSample>,
    /// Cursor position after this batch (may exceed the last block for
    /// trailing skipped slots).
    pub new_position: Position,
}

/// What actually got committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Position the cursor was advanced to, if any commit happened.
    pub committed_position: Option<Position>,
    /// Block rows written.
    pub blocks_written: u64,
    /// Transaction rows written.
    pub txs_written: u64,
    /// Description of an isolated poison record, if the fallback path ran.
    pub poison: Option<String>,
}

impl Storage {
    /// Commit a batch atomically: records and cursor either both land or
    /// neither does. Idempotent under retry (natural-key upserts).
    pub async fn commit_batch(&self, batch: &BatchCommit<'_>) -> Result<CommitOutcome> {
        let mut attempt = 0;
        let last_err = loop {
            attempt += 1;
            match self.try_commit_all(batch).await {
                Ok(()) => {
                    return Ok(CommitOutcome {
                        committed_position: Some(batch.new_position),
                        blocks_written: batch.blocks.len() as u64,
                        txs_written: batch.txs.len() as u64,
                        poison: None,
                    });
                }
                Err(err) if attempt < BATCH_RETRIES && is_transient_db_error(&err) => {
                    warn!(
                        chain = batch.chain.as_str(),
                        attempt, "transient batch write failure, retrying: {err}"
                    );
                    tokio::time::sleep(BATCH_RETRY_DELAY * attempt).await;
                }
                Err(err) => break err,
            }
        };

        if is_transient_db_error(&last_err) {
            // The store is unavailable, not poisoned; surface to the caller
            // so the collector retries next cycle without cursor movement.
            return Err(last_err).context("sink unavailable");
        }

        warn!(
            chain = batch.chain.as_str(),
            "batch write failed, isolating poison record: {last_err}"
        );
        self.commit_per_record(batch).await
    }

    /// Happy path: everything in one transaction.
    async fn try_commit_all(&self, batch: &BatchCommit<'_>) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for block in batch.blocks {
            insert_block(&mut *tx, block).await?;
        }
        for record in batch.txs {
            insert_tx(&mut *tx, record).await?;
        }
        for row in batch.quality {
            insert_quality(&mut *tx, batch.chain, row).await?;
        }
        if let Some(metric) = batch.metric {
            insert_metric(&mut *tx, metric).await?;
        }
        upsert_cursor(&mut *tx, batch.chain, batch.mode, batch.new_position).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fallback: commit block by block to find the poison record.
    async fn commit_per_record(&self, batch: &BatchCommit<'_>) -> Result<CommitOutcome> {
        let mut committed: Option<Position> = None;
        let mut blocks_written = 0u64;
        let mut txs_written = 0u64;
        let mut poison: Option<String> = None;

        'blocks: for block in batch.blocks {
            let mut tx = self.pool().begin().await?;

            if let Err(err) = insert_block(&mut *tx, block).await {
                poison = Some(format!(
                    "{} block {}: {err}",
                    batch.chain.as_str(),
                    block.position
                ));
                error!(
                    chain = batch.chain.as_str(),
                    position = block.position,
                    "poison block isolated; prefix ends before it: {err}"
                );
                break 'blocks;
            }

            for record in batch.txs.iter().filter(|t| t.position == block.position) {
                match insert_tx(&mut *tx, record).await {
                    Ok(()) => txs_written += 1,
                    Err(err) => {
                        // A poison transaction is dropped; the rest of the
                        // block still commits.
                        poison = Some(format!(
                            "{} tx {}: {err}",
                            batch.chain.as_str(),
                            record.tx_id
                        ));
                        error!(
                            chain = batch.chain.as_str(),
                            tx_id = %record.tx_id,
                            "poison transaction isolated and skipped: {err}"
                        );
                    }
                }
            }

            tx.commit().await?;
            committed = Some(block.position);
            blocks_written += 1;
        }

        // Seal the prefix: quality rows for committed records, the metric,
        // and the cursor, written last as the commit marker.
        if let Some(position) = committed {
            let mut tx = self.pool().begin().await?;
            for row in batch.quality {
                if quality_row_in_prefix(row, position) {
                    insert_quality(&mut *tx, batch.chain, row).await?;
                }
            }
            if let Some(metric) = batch.metric {
                insert_metric(&mut *tx, metric).await?;
            }
            upsert_cursor(&mut *tx, batch.chain, batch.mode, position).await?;
            tx.commit().await?;
        } else if let Some(metric) = batch.metric {
            insert_metric(self.pool(), metric).await?;
        }

        Ok(CommitOutcome {
            committed_position: committed,
            blocks_written,
            txs_written,
            poison,
        })
    }
}

fn quality_row_in_prefix(row: &QualityRow, prefix_end: Position) -> bool {
    match row.record_kind {
        RecordKind::Block => row
            .record_id
            .parse::<Position>()
            .map(|p| p <= prefix_end)
            .unwrap_or(false),
        // Transactions are keyed by id, not position; audit rows are kept
        // even when their record was isolated.
        RecordKind::Transaction => true,
    }
}

fn is_transient_db_error(err: &anyhow::Error) -> bool {
    let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() else {
        return false;
    };
    match sqlx_err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

async fn insert_block<'e, E>(executor: E, block: &BlockRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    match block.chain {
        ChainId::Bitcoin => {
            sqlx::query(
                r#"
                INSERT INTO blocks_btc (
                    position, hash, parent_hash, timestamp, tx_count,
                    size_bytes, difficulty, nonce, merkle_root, source, ingested_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(position) DO UPDATE SET
                    hash = excluded.hash,
                    parent_hash = excluded.parent_hash,
                    timestamp = excluded.timestamp,
                    tx_count = excluded.tx_count,
                    size_bytes = excluded.size_bytes,
                    difficulty = excluded.difficulty,
                    nonce = excluded.nonce,
                    merkle_root = excluded.merkle_root,
                    source = excluded.source,
                    ingested_at = excluded.ingested_at
                "#,
            )
            .bind(block.position as i64)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(block.timestamp)
            .bind(block.tx_count as i64)
            .bind(block.size_bytes as i64)
            .bind(block.difficulty.map(|d| d as i64))
            .bind(block.nonce.map(|n| n as i64))
            .bind(&block.merkle_root)
            .bind(block.source.as_str())
            .bind(block.ingested_at)
            .execute(executor)
            .await
            .context("Failed to insert Bitcoin block")?;
        }
        ChainId::Solana => {
            sqlx::query(
                r#"
                INSERT INTO blocks_sol (
                    position, hash, parent_hash, timestamp, tx_count,
                    size_bytes, parent_slot, block_height, source, ingested_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(position) DO UPDATE SET
                    hash = excluded.hash,
                    parent_hash = excluded.parent_hash,
                    timestamp = excluded.timestamp,
                    tx_count = excluded.tx_count,
                    size_bytes = excluded.size_bytes,
                    parent_slot = excluded.parent_slot,
                    block_height = excluded.block_height,
                    source = excluded.source,
                    ingested_at = excluded.ingested_at
                "#,
            )
            .bind(block.position as i64)
            .bind(&block.hash)
            .bind(&block.parent_hash)
            .bind(block.timestamp)
            .bind(block.tx_count as i64)
            .bind(block.size_bytes as i64)
            .bind(block.parent_slot.map(|s| s as i64))
            .bind(block.block_height.map(|h| h as i64))
            .bind(block.source.as_str())
            .bind(block.ingested_at)
            .execute(executor)
            .await
            .context("Failed to insert Solana block")?;
        }
    }
    Ok(())
}

async fn insert_tx<'e, E>(executor: E, record: &TxRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    match record.chain {
        ChainId::Bitcoin => {
            sqlx::query(
                r#"
                INSERT INTO txs_btc (
                    tx_id, position, block_hash, fee, size_bytes,
                    input_count, output_count, status, timestamp, source
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_id) DO UPDATE SET
                    position = excluded.position,
                    block_hash = excluded.block_hash,
                    fee = excluded.fee,
                    size_bytes = excluded.size_bytes,
                    input_count = excluded.input_count,
                    output_count = excluded.output_count,
                    status = excluded.status,
                    timestamp = excluded.timestamp,
                    source = excluded.source
                "#,
            )
            .bind(&record.tx_id)
            .bind(record.position as i64)
            .bind(&record.block_hash)
            .bind(record.fee as i64)
            .bind(record.size_bytes as i64)
            .bind(record.input_count.map(|n| n as i64))
            .bind(record.output_count.map(|n| n as i64))
            .bind(record.status.as_str())
            .bind(record.timestamp)
            .bind(record.source.as_str())
            .execute(executor)
            .await
            .context("Failed to insert Bitcoin transaction")?;
        }
        ChainId::Solana => {
            sqlx::query(
                r#"
                INSERT INTO txs_sol (
                    tx_id, position, block_hash, fee, size_bytes,
                    status, timestamp, source
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(tx_id) DO UPDATE SET
                    position = excluded.position,
                    block_hash = excluded.block_hash,
                    fee = excluded.fee,
                    size_bytes = excluded.size_bytes,
                    status = excluded.status,
                    timestamp = excluded.timestamp,
                    source = excluded.source
                "#,
            )
            .bind(&record.tx_id)
            .bind(record.position as i64)
            .bind(&record.block_hash)
            .bind(record.fee as i64)
            .bind(record.size_bytes as i64)
            .bind(record.status.as_str())
            .bind(record.timestamp)
            .bind(record.source.as_str())
            .execute(executor)
            .await
            .context("Failed to insert Solana transaction")?;
        }
    }
    Ok(())
}

async fn insert_quality<'e, E>(executor: E, chain: ChainId, row: &QualityRow) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO quality (chain, record_kind, record_id, level, issues, observed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(chain.as_str())
    .bind(row.record_kind.as_str())
    .bind(&row.record_id)
    .bind(row.verdict.level.as_str())
    .bind(row.verdict.issue_tags())
    .bind(row.observed_at)
    .execute(executor)
    .await
    .context("Failed to insert quality row")?;
    Ok(())
}

pub(crate) async fn insert_metric<'e, E>(executor: E, metric: &MetricSample) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO metrics (
            chain, cycle_started_at, duration_ms, records_in,
            records_out, error_count, last_error
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(metric.chain.as_str())
    .bind(metric.cycle_started_at)
    .bind(metric.duration_ms as i64)
    .bind(metric.records_in as i64)
    .bind(metric.records_out as i64)
    .bind(metric.error_count as i64)
    .bind(&metric.last_error)
    .execute(executor)
    .await
    .context("Failed to insert metric sample")?;
    Ok(())
}

/// Advance the cursor; `started_at` and `mode` are fixed at creation, and
/// the position never moves backwards.
async fn upsert_cursor<'e, E>(
    executor: E,
    chain: ChainId,
    mode: CollectionMode,
    position: Position,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO cursors (chain, position, mode, started_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chain) DO UPDATE SET
            position = excluded.position,
            updated_at = excluded.updated_at
        WHERE excluded.position >= cursors.position
        "#,
    )
    .bind(chain.as_str())
    .bind(position as i64)
    .bind(mode.as_str())
    .bind(now)
    .bind(now)
    .execute(executor)
    .await
    .context("Failed to upsert cursor")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::storage;
    use chainflow_core::{QualityIssue, RecordSource, TxStatus};

    fn block(position: Position) -> BlockRecord {
        BlockRecord {
            chain: ChainId::Bitcoin,
            position,
            hash: format!("{:064x}", position),
            parent_hash: (position > 0).then(|| format!("{:064x}", position - 1)),
            timestamp: 1_690_000_000 + position as i64,
            tx_count: 1,
            size_bytes: 1000,
            difficulty: Some(1),
            nonce: Some(42),
            merkle_root: None,
            parent_slot: None,
            block_height: None,
            source: RecordSource::PublicApi,
            ingested_at: 1_700_000_000,
        }
    }

    fn tx_for(position: Position) -> TxRecord {
        TxRecord {
            chain: ChainId::Bitcoin,
            tx_id: format!("{:064x}", 0xff00 + position),
            position,
            block_hash: format!("{:064x}", position),
            fee: 5200,
            size_bytes: 222,
            input_count: Some(1),
            output_count: Some(2),
            status: TxStatus::Success,
            timestamp: 1_690_000_000,
            source: RecordSource::PublicApi,
        }
    }

    fn metric() -> MetricSample {
        MetricSample {
            chain: ChainId::Bitcoin,
            cycle_started_at: 1_700_000_000,
            duration_ms: 120,
            records_in: 2,
            records_out: 4,
            error_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_commit_batch_is_atomic_and_advances_cursor() {
        let (storage, _temp) = storage().await;

        let blocks = vec![block(100), block(101)];
        let txs = vec![tx_for(100), tx_for(101)];
        let quality = vec![QualityRow {
            record_kind: RecordKind::Block,
            record_id: "100".to_string(),
            verdict: QualityVerdict::from_issues(vec![QualityIssue::TimestampDrift]),
            observed_at: 1_700_000_000,
        }];
        let m = metric();

        let outcome = storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Backfill,
                blocks: &blocks,
                txs: &txs,
                quality: &quality,
                metric: Some(&m),
                new_position: 101,
            })
            .await
            .unwrap();

        assert_eq!(outcome.committed_position, Some(101));
        assert_eq!(outcome.blocks_written, 2);
        assert_eq!(outcome.txs_written, 2);
        assert!(outcome.poison.is_none());

        let cursor = storage.load_cursor(ChainId::Bitcoin).await.unwrap().unwrap();
        assert_eq!(cursor.position, 101);
        assert_eq!(cursor.mode, CollectionMode::Backfill);

        let stats = storage.chain_stats(ChainId::Bitcoin).await.unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.txs, 2);

        let quality_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quality")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(quality_count, 1);

        let metric_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(metric_count, 1);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_reinsert_is_idempotent() {
        let (storage, _temp) = storage().await;

        let blocks = vec![block(7)];
        let txs = vec![tx_for(7)];
        let batch = BatchCommit {
            chain: ChainId::Bitcoin,
            mode: CollectionMode::Tip,
            blocks: &blocks,
            txs: &txs,
            quality: &[],
            metric: None,
            new_position: 7,
        };

        storage.commit_batch(&batch).await.unwrap();
        storage.commit_batch(&batch).await.unwrap();

        let stats = storage.chain_stats(ChainId::Bitcoin).await.unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.txs, 1);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let (storage, _temp) = storage().await;

        let blocks = vec![block(50)];
        storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Tip,
                blocks: &blocks,
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 50,
            })
            .await
            .unwrap();

        // A stale re-commit of an older batch must not move the cursor back.
        let old = vec![block(40)];
        storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Tip,
                blocks: &old,
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 40,
            })
            .await
            .unwrap();

        let cursor = storage.load_cursor(ChainId::Bitcoin).await.unwrap().unwrap();
        assert_eq!(cursor.position, 50);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_empty_batch_advances_cursor_for_skipped_slots() {
        let (storage, _temp) = storage().await;

        let outcome = storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Solana,
                mode: CollectionMode::Tip,
                blocks: &[],
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 1005,
            })
            .await
            .unwrap();

        assert_eq!(outcome.committed_position, Some(1005));
        let cursor = storage.load_cursor(ChainId::Solana).await.unwrap().unwrap();
        assert_eq!(cursor.position, 1005);
        let stats = storage.chain_stats(ChainId::Solana).await.unwrap();
        assert_eq!(stats.blocks, 0);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_cursor_keeps_creation_metadata() {
        let (storage, _temp) = storage().await;

        let blocks = vec![block(1)];
        storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Backfill,
                blocks: &blocks,
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 1,
            })
            .await
            .unwrap();
        let first = storage.load_cursor(ChainId::Bitcoin).await.unwrap().unwrap();

        let blocks = vec![block(2)];
        storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Backfill,
                blocks: &blocks,
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 2,
            })
            .await
            .unwrap();
        let second = storage.load_cursor(ChainId::Bitcoin).await.unwrap().unwrap();

        assert_eq!(second.position, 2);
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.mode, CollectionMode::Backfill);

        storage.close().await;
    }

    #[tokio::test]
    async fn test_block_hash_at() {
        let (storage, _temp) = storage().await;

        let blocks = vec![block(9)];
        storage
            .commit_batch(&BatchCommit {
                chain: ChainId::Bitcoin,
                mode: CollectionMode::Tip,
                blocks: &blocks,
                txs: &[],
                quality: &[],
                metric: None,
                new_position: 9,
            })
            .await
            .unwrap();

        let hash = storage.block_hash_at(ChainId::Bitcoin, 9).await.unwrap();
        assert_eq!(hash, Some(format!("{:064x}", 9)));
        assert!(storage.block_hash_at(ChainId::Bitcoin, 10).await.unwrap().is_none());

        storage.close().await;
    }
}
