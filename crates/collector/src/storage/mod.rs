//! Storage layer for the ingestion engine.
//!
//! One SQLite pool serves as both the analytics sink and the cursor store.
//! Records are keyed by natural key and upserted, so retried batches and
//! crash-recovery re-inserts are idempotent; each committed batch advances
//! the chain cursor in the same transaction (see [`sink`]).

use anyhow::{Context, Result};
use chainflow_core::{ChainId, CollectionRun, Cursor, MetricSample, Position, StopReason};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod sink;

pub use sink::{BatchCommit, CommitOutcome, QualityRow};

/// Database storage for the engine.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

/// Per-chain record counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainStats {
    /// Committed block rows.
    pub blocks: u64,
    /// Committed transaction rows.
    pub txs: u64,
}

impl Storage {
    /// Connect to the database at `database_url`, creating it if missing.
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let max_conn = max_connections.unwrap_or(5);
        let min_conn = min_connections.unwrap_or(1);

        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_conn)
            .min_connections(min_conn)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Connect to a database file at `path`.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations. Call once during initialization.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check that the database is responsive.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }

    /// Load the cursor for `chain`, if one has ever been committed.
    pub async fn load_cursor(&self, chain: ChainId) -> Result<Option<Cursor>> {
        let row = sqlx::query(
            r#"
            SELECT position, mode, started_at, updated_at
            FROM cursors
            WHERE chain = ?
            "#,
        )
        .bind(chain.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load cursor")?;

        row.map(|row| cursor_from_row(chain, &row)).transpose()
    }

    /// Hash of the committed block at `position`, used to seed the
    /// parent-hash consistency check across cycles.
    pub async fn block_hash_at(
        &self,
        chain: ChainId,
        position: Position,
    ) -> Result<Option<String>> {
        let query = match chain {
            ChainId::Bitcoin => "SELECT hash FROM blocks_btc WHERE position = ?",
            ChainId::Solana => "SELECT hash FROM blocks_sol WHERE position = ?",
        };
        let hash: Option<String> = sqlx::query_scalar(query)
            .bind(position as i64)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read block hash")?;
        Ok(hash)
    }

    /// Record counts for `chain`.
    pub async fn chain_stats(&self, chain: ChainId) -> Result<ChainStats> {
        let (blocks_q, txs_q) = match chain {
            ChainId::Bitcoin => ("SELECT COUNT(*) FROM blocks_btc", "SELECT COUNT(*) FROM txs_btc"),
            ChainId::Solana => ("SELECT COUNT(*) FROM blocks_sol", "SELECT COUNT(*) FROM txs_sol"),
        };
        let blocks: i64 = sqlx::query_scalar(blocks_q).fetch_one(&self.pool).await?;
        let txs: i64 = sqlx::query_scalar(txs_q).fetch_one(&self.pool).await?;
        Ok(ChainStats {
            blocks: blocks as u64,
            txs: txs as u64,
        })
    }

    /// Total database size in bytes, for the storage safety budget.
    pub async fn size_bytes(&self) -> Result<u64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;
        Ok((page_count as u64).saturating_mul(page_size as u64))
    }

    /// Write a cycle metric outside a batch commit (failed or empty cycles).
    pub async fn record_metric(&self, metric: &MetricSample) -> Result<()> {
        sink::insert_metric(&self.pool, metric).await
    }

    /// Open a collection run, returning its row id.
    pub async fn open_run(&self, started_at: i64) -> Result<i64> {
        let result = sqlx::query("INSERT INTO collection_runs (started_at) VALUES (?)")
            .bind(started_at)
            .execute(&self.pool)
            .await
            .context("Failed to open collection run")?;
        Ok(result.last_insert_rowid())
    }

    /// Close a collection run with its stop reason.
    pub async fn close_run(&self, id: i64, stopped_at: i64, reason: StopReason) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collection_runs
            SET stopped_at = ?, stop_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(stopped_at)
        .bind(reason.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to close collection run")?;
        Ok(())
    }

    /// Most recently opened collection run.
    pub async fn latest_run(&self) -> Result<Option<CollectionRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, stopped_at, stop_reason
            FROM collection_runs
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let stop_reason: Option<String> = row.get("stop_reason");
            let stop_reason = stop_reason
                .as_deref()
                .map(StopReason::from_str)
                .transpose()
                .context("Corrupt stop_reason in collection_runs")?;
            Ok(CollectionRun {
                id: row.get("id"),
                started_at: row.get("started_at"),
                stopped_at: row.get("stopped_at"),
                stop_reason,
            })
        })
        .transpose()
    }
}

fn cursor_from_row(chain: ChainId, row: &SqliteRow) -> Result<Cursor> {
    let mode: String = row.get("mode");
    Ok(Cursor {
        chain,
        position: row.get::<i64, _>("position") as Position,
        mode: mode.parse().context("Corrupt mode in cursors table")?,
        started_at: row.get("started_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::NamedTempFile;

    pub async fn storage() -> (Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        (storage, temp_db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::storage;
    use super::*;

    #[tokio::test]
    async fn test_migrations_and_health() {
        let (storage, _temp) = storage().await;
        storage.health_check().await.unwrap();

        // Fresh store has no cursors and no records.
        assert!(storage.load_cursor(ChainId::Bitcoin).await.unwrap().is_none());
        let stats = storage.chain_stats(ChainId::Bitcoin).await.unwrap();
        assert_eq!(stats, ChainStats::default());

        storage.close().await;
    }

    #[tokio::test]
    async fn test_size_bytes_is_positive() {
        let (storage, _temp) = storage().await;
        assert!(storage.size_bytes().await.unwrap() > 0);
        storage.close().await;
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (storage, _temp) = storage().await;

        assert!(storage.latest_run().await.unwrap().is_none());

        let id = storage.open_run(1000).await.unwrap();
        let run = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.started_at, 1000);
        assert!(run.stopped_at.is_none());
        assert!(run.stop_reason.is_none());

        storage.close_run(id, 2000, StopReason::SizeBudget).await.unwrap();
        let run = storage.latest_run().await.unwrap().unwrap();
        assert_eq!(run.stopped_at, Some(2000));
        assert_eq!(run.stop_reason, Some(StopReason::SizeBudget));

        // A new run opens independently of the closed one.
        let id2 = storage.open_run(3000).await.unwrap();
        assert!(id2 > id);

        storage.close().await;
    }
}
