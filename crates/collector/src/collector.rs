//! Per-chain collector state machine.
//!
//! Each cycle runs discover → plan → fetch → validate → commit → throttle.
//! Fetches within a cycle are concurrent up to the configured parallelism,
//! but only the longest contiguous prefix of results (starting at
//! `cursor + 1`) is committed; anything past the first gap is discarded and
//! refetched next cycle. A rate-limit response collapses the window for the
//! rest of the cycle and arms exponential backoff, reset by the next
//! successful cycle.

use chainflow_core::{
    ChainId, CollectionMode, FetchError, MetricSample, Position, RecordKind,
};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{effective_parallelism, BitcoinConfig, CollectionConfig, SolanaConfig};
use crate::rpc::ChainClient;
use crate::storage::{BatchCommit, QualityRow, Storage};
use crate::validator::{validate_block, validate_transaction, ValidationContext};

const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(120);
/// Wall-clock soft cap per cycle; exceeding it abandons the cycle as a
/// transient failure.
const CYCLE_SOFT_CAP: Duration = Duration::from_secs(60);
/// Empty slots the collector will advance through in one cycle before
/// returning to idle.
const MAX_CONSECUTIVE_SKIPPED: usize = 10;
/// Sliding window for the health error rate, in seconds.
const ERROR_WINDOW_SECS: i64 = 300;

/// Where a collector currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorPhase {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Asking the upstream for its tip.
    Discovering,
    /// Building the fetch window.
    Planning,
    /// Concurrent block/transaction fetches in flight.
    Fetching,
    /// Writing the contiguous prefix and advancing the cursor.
    Committing,
    /// Sleeping out the cycle interval plus any backoff.
    Throttling,
    /// Terminal: stop was requested and honored.
    Stopped,
    /// Terminal: an unrecoverable upstream or sink failure.
    Fatal,
}

impl CollectorPhase {
    /// Stable identifier for status reporting.
    pub const fn as_str(&self) -> &'static str {
        match self {
            CollectorPhase::Idle => "idle",
            CollectorPhase::Discovering => "discovering",
            CollectorPhase::Planning => "planning",
            CollectorPhase::Fetching => "fetching",
            CollectorPhase::Committing => "committing",
            CollectorPhase::Throttling => "throttling",
            CollectorPhase::Stopped => "stopped",
            CollectorPhase::Fatal => "fatal",
        }
    }
}

/// Shared per-chain runtime slot. The owning collector writes it; the
/// supervisor reads it for status, health, and backfill progress.
#[derive(Debug, Default)]
pub struct ChainRuntime {
    /// Current phase.
    pub phase: CollectorPhase,
    /// Last committed position.
    pub cursor: Option<Position>,
    /// Last discovered tip.
    pub target: Option<Position>,
    /// First position this collection started from (for progress).
    pub start_position: Option<Position>,
    /// Block rows committed since process start.
    pub blocks_total: u64,
    /// Transaction rows committed since process start.
    pub txs_total: u64,
    /// Last successful commit, unix seconds.
    pub last_commit_at: Option<i64>,
    /// Last error tag observed.
    pub last_error: Option<String>,
    /// Records-per-second over the last committing cycle.
    pub rate_per_sec: f64,
    error_times: VecDeque<i64>,
}

impl ChainRuntime {
    fn record_error(&mut self, now: i64, tag: String) {
        self.last_error = Some(tag);
        self.error_times.push_back(now);
        while let Some(&front) = self.error_times.front() {
            if now - front > ERROR_WINDOW_SECS {
                self.error_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Errors observed in the last `window_secs` seconds.
    pub fn errors_in_window(&self, now: i64, window_secs: i64) -> usize {
        self.error_times
            .iter()
            .filter(|&&t| now - t <= window_secs)
            .count()
    }
}

/// Static settings for one collector.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Chain to collect.
    pub chain: ChainId,
    /// Starting behavior when no cursor exists.
    pub mode: CollectionMode,
    /// First position to fetch in backfill mode.
    pub start_position: Option<Position>,
    /// Max concurrent fetches per cycle.
    pub parallelism: usize,
    /// Cap on transactions fetched per block. 0 = unlimited.
    pub tx_limit: usize,
    /// Base sleep between cycles.
    pub cycle_interval: Duration,
}

impl CollectorSettings {
    /// Settings for the Bitcoin collector.
    pub fn bitcoin(cfg: &BitcoinConfig, collection: &CollectionConfig) -> Self {
        Self {
            chain: ChainId::Bitcoin,
            mode: cfg.mode,
            start_position: (cfg.start_position >= 0).then_some(cfg.start_position as Position),
            parallelism: effective_parallelism(cfg.parallelism, cfg.mode),
            tx_limit: cfg.tx_limit,
            cycle_interval: Duration::from_secs(collection.cycle_interval_seconds),
        }
    }

    /// Settings for the Solana collector.
    pub fn solana(cfg: &SolanaConfig, collection: &CollectionConfig) -> Self {
        Self {
            chain: ChainId::Solana,
            mode: cfg.mode,
            start_position: None,
            parallelism: effective_parallelism(cfg.parallelism, cfg.mode),
            tx_limit: cfg.tx_limit,
            cycle_interval: Duration::from_secs(collection.cycle_interval_seconds),
        }
    }
}

/// Outcome of a single cycle, mostly for tests and the run loop.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Position committed this cycle, if any.
    pub committed: Option<Position>,
    /// Block rows committed this cycle.
    pub blocks_committed: u64,
    /// Transaction rows committed this cycle.
    pub txs_committed: u64,
    /// True when the window was fully consumed and the chain is still behind:
    /// the next cycle should start immediately.
    pub more_work: bool,
    /// Set when an unrecoverable failure was observed.
    pub fatal: Option<String>,
}

enum FetchOutcome {
    Block(chainflow_core::BlockRecord, Vec<chainflow_core::TxRecord>),
    /// Solana: leader produced no block for this slot.
    Empty,
    /// Position beyond the upstream tip; nothing to do.
    BeyondTip,
    /// Retryable failure; ends the contiguous prefix.
    Failed(String),
    /// Upstream rate limit; collapses the window and arms backoff.
    RateLimited,
    /// Skipped because an earlier fetch in this cycle was rate limited.
    Deferred,
    Fatal(String),
    Cancelled,
}

/// Drives one chain's ingestion loop.
pub struct Collector {
    settings: CollectorSettings,
    client: Arc<dyn ChainClient>,
    storage: Storage,
    runtime: Arc<RwLock<ChainRuntime>>,
    cancel: CancellationToken,
    backoff: Duration,
}

impl Collector {
    /// Create a collector. `runtime` is the shared slot the supervisor reads.
    pub fn new(
        settings: CollectorSettings,
        client: Arc<dyn ChainClient>,
        storage: Storage,
        runtime: Arc<RwLock<ChainRuntime>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            client,
            storage,
            runtime,
            cancel,
            backoff: Duration::ZERO,
        }
    }

    /// Run the collection loop until cancelled or fatally failed.
    pub async fn run(mut self) {
        let chain = self.settings.chain;
        info!(chain = chain.as_str(), mode = %self.settings.mode, "collector starting");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let report = match tokio::time::timeout(CYCLE_SOFT_CAP, self.run_once()).await {
                Ok(report) => report,
                Err(_) => {
                    warn!(chain = chain.as_str(), "cycle exceeded soft cap, abandoning");
                    let now = chrono::Utc::now().timestamp();
                    self.runtime
                        .write()
                        .await
                        .record_error(now, "cycle_timeout".to_string());
                    CycleReport::default()
                }
            };

            if let Some(msg) = report.fatal {
                error!(chain = chain.as_str(), "collector entering fatal state: {msg}");
                self.set_phase(CollectorPhase::Fatal).await;
                // Park until the supervisor tears the run down; the sibling
                // chain keeps collecting.
                self.cancel.cancelled().await;
                return;
            }

            if self.cancel.is_cancelled() {
                break;
            }

            if report.more_work && self.backoff.is_zero() {
                continue;
            }

            self.set_phase(CollectorPhase::Throttling).await;
            let sleep_for = self.settings.cycle_interval + self.backoff;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        self.set_phase(CollectorPhase::Stopped).await;
        info!(chain = chain.as_str(), "collector stopped");
    }

    /// Run exactly one cycle. Public so operators and tests can single-step.
    pub async fn run_once(&mut self) -> CycleReport {
        let chain = self.settings.chain;
        let cycle_started = Instant::now();
        let cycle_started_at = chrono::Utc::now().timestamp();
        let mut error_count: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut report = CycleReport::default();

        // Discovering
        self.set_phase(CollectorPhase::Discovering).await;
        let tip = match self.client.tip_position().await {
            Ok(tip) => tip,
            Err(err) => {
                error_count += 1;
                last_error = Some(err.tag().to_string());
                let now = chrono::Utc::now().timestamp();
                self.runtime
                    .write()
                    .await
                    .record_error(now, err.tag().to_string());
                match &err {
                    FetchError::Fatal(msg) => {
                        error!(chain = chain.as_str(), "fatal upstream failure: {msg}");
                        report.fatal = Some(msg.clone());
                    }
                    other => {
                        warn!(chain = chain.as_str(), "tip discovery failed: {other}");
                        if other.triggers_backoff() {
                            self.arm_backoff();
                        }
                    }
                }
                self.finish_cycle(cycle_started_at, cycle_started, 0, 0, error_count, last_error)
                    .await;
                return report;
            }
        };

        let cursor = match self.storage.load_cursor(chain).await {
            Ok(cursor) => cursor.map(|c| c.position),
            Err(err) => {
                warn!(chain = chain.as_str(), "cursor load failed: {err:#}");
                error_count += 1;
                last_error = Some("cursor_load".to_string());
                self.finish_cycle(cycle_started_at, cycle_started, 0, 0, error_count, last_error)
                    .await;
                return report;
            }
        };

        let next_start = match cursor {
            Some(position) => position + 1,
            None => match (self.settings.mode, self.settings.start_position) {
                (CollectionMode::Backfill, Some(start)) => start,
                // Tip-follow: the first position collected is the current tip.
                _ => tip,
            },
        };

        {
            let mut runtime = self.runtime.write().await;
            runtime.cursor = cursor;
            runtime.target = Some(tip);
            if runtime.start_position.is_none() {
                runtime.start_position = Some(cursor.map_or(next_start, |c| c.min(next_start)));
            }
        }

        if next_start > tip {
            debug!(chain = chain.as_str(), tip, "caught up, nothing to do");
            self.finish_cycle(cycle_started_at, cycle_started, 0, 0, error_count, last_error)
                .await;
            if error_count == 0 {
                self.backoff = Duration::ZERO;
            }
            return report;
        }

        // Planning
        self.set_phase(CollectorPhase::Planning).await;
        let parallelism = self.settings.parallelism.max(1);
        let window_end = plan_window_end(next_start, tip, parallelism);
        let positions: Vec<Position> = (next_start..=window_end).collect();
        let planned = positions.len() as u64;

        // Fetching
        self.set_phase(CollectorPhase::Fetching).await;
        let rate_limited = Arc::new(AtomicBool::new(false));
        let mut outcomes: Vec<(Position, FetchOutcome)> = stream::iter(positions)
            .map(|position| {
                let client = Arc::clone(&self.client);
                let cancel = self.cancel.clone();
                let rate_limited = Arc::clone(&rate_limited);
                let tx_limit = self.settings.tx_limit;
                async move {
                    let outcome =
                        fetch_position(client, position, tx_limit, tip, rate_limited, cancel).await;
                    (position, outcome)
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;
        outcomes.sort_by_key(|(position, _)| *position);

        // Reassemble into the longest contiguous prefix.
        let prev_hash = match cursor {
            Some(position) => self
                .storage
                .block_hash_at(chain, position)
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let now = chrono::Utc::now().timestamp();
        let mut blocks = Vec::new();
        let mut txs = Vec::new();
        let mut quality: Vec<QualityRow> = Vec::new();
        let mut last_position: Option<Position> = None;
        let mut consecutive_skipped = 0usize;
        let mut prev = prev_hash;
        let mut fatal: Option<String> = None;

        for (position, outcome) in outcomes {
            match outcome {
                FetchOutcome::Block(block, block_txs) => {
                    consecutive_skipped = 0;
                    let ctx = ValidationContext {
                        mode: self.settings.mode,
                        now,
                        prev_hash: prev.clone(),
                    };
                    let verdict = validate_block(&block, &ctx);
                    if !verdict.is_ok() {
                        warn!(
                            chain = chain.as_str(),
                            position,
                            level = verdict.level.as_str(),
                            issues = %verdict.issue_tags(),
                            "block failed quality checks"
                        );
                        quality.push(QualityRow {
                            record_kind: RecordKind::Block,
                            record_id: position.to_string(),
                            verdict,
                            observed_at: now,
                        });
                    }
                    for record in &block_txs {
                        let verdict = validate_transaction(record);
                        if !verdict.is_ok() {
                            quality.push(QualityRow {
                                record_kind: RecordKind::Transaction,
                                record_id: record.tx_id.clone(),
                                verdict,
                                observed_at: now,
                            });
                        }
                    }
                    prev = Some(block.hash.clone());
                    last_position = Some(position);
                    blocks.push(block);
                    txs.extend(block_txs);
                }
                FetchOutcome::Empty => {
                    // An empty slot advances the cursor without a block row.
                    consecutive_skipped += 1;
                    last_position = Some(position);
                    if consecutive_skipped >= MAX_CONSECUTIVE_SKIPPED {
                        debug!(
                            chain = chain.as_str(),
                            position, "skipped-slot budget reached, ending window"
                        );
                        break;
                    }
                }
                FetchOutcome::BeyondTip | FetchOutcome::Deferred | FetchOutcome::Cancelled => break,
                FetchOutcome::RateLimited => {
                    error_count += 1;
                    last_error = Some("rate_limited".to_string());
                    self.runtime
                        .write()
                        .await
                        .record_error(now, "rate_limited".to_string());
                    self.arm_backoff();
                    break;
                }
                FetchOutcome::Failed(msg) => {
                    error_count += 1;
                    last_error = Some(msg.clone());
                    self.runtime.write().await.record_error(now, msg);
                    break;
                }
                FetchOutcome::Fatal(msg) => {
                    fatal = Some(msg);
                    break;
                }
            }
        }

        // Committing
        if let Some(new_position) = last_position {
            self.set_phase(CollectorPhase::Committing).await;
            let records_out = blocks.len() as u64 + txs.len() as u64;
            let metric = MetricSample {
                chain,
                cycle_started_at,
                duration_ms: cycle_started.elapsed().as_millis() as u64,
                records_in: planned,
                records_out,
                error_count,
                last_error: last_error.clone(),
            };
            let batch = BatchCommit {
                chain,
                mode: self.settings.mode,
                blocks: &blocks,
                txs: &txs,
                quality: &quality,
                metric: Some(&metric),
                new_position,
            };

            match self.storage.commit_batch(&batch).await {
                Ok(outcome) => {
                    if let Some(poison) = &outcome.poison {
                        error_count += 1;
                        self.runtime.write().await.record_error(now, poison.clone());
                    }
                    if let Some(committed) = outcome.committed_position {
                        let duration = cycle_started.elapsed().as_secs_f64().max(0.001);
                        let mut runtime = self.runtime.write().await;
                        runtime.cursor = Some(committed);
                        runtime.blocks_total += outcome.blocks_written;
                        runtime.txs_total += outcome.txs_written;
                        runtime.last_commit_at = Some(chrono::Utc::now().timestamp());
                        runtime.rate_per_sec =
                            (outcome.blocks_written + outcome.txs_written) as f64 / duration;
                        drop(runtime);

                        report.committed = Some(committed);
                        report.blocks_committed = outcome.blocks_written;
                        report.txs_committed = outcome.txs_written;
                        // A successful commit resets rate-limit backoff.
                        self.backoff = Duration::ZERO;
                        report.more_work = committed >= window_end && window_end < tip;

                        info!(
                            chain = chain.as_str(),
                            cursor = committed,
                            blocks = outcome.blocks_written,
                            txs = outcome.txs_written,
                            tip,
                            "committed batch"
                        );
                    }
                }
                Err(err) => {
                    // Sink unavailable: no cursor movement, retry next cycle.
                    warn!(chain = chain.as_str(), "batch commit failed: {err:#}");
                    error_count += 1;
                    self.runtime
                        .write()
                        .await
                        .record_error(now, "sink_unavailable".to_string());
                    let _ = self.storage.record_metric(&metric).await;
                }
            }
        } else {
            self.finish_cycle(
                cycle_started_at,
                cycle_started,
                planned,
                0,
                error_count,
                last_error,
            )
            .await;
            if error_count == 0 && fatal.is_none() {
                self.backoff = Duration::ZERO;
            }
        }

        report.fatal = fatal;
        self.set_phase(CollectorPhase::Idle).await;
        report
    }

    /// Current backoff, exposed for tests.
    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }

    fn arm_backoff(&mut self) {
        self.backoff = next_backoff(self.backoff);
        warn!(
            chain = self.settings.chain.as_str(),
            backoff_secs = self.backoff.as_secs(),
            "rate limited; backing off"
        );
    }

    async fn set_phase(&self, phase: CollectorPhase) {
        self.runtime.write().await.phase = phase;
    }

    /// Record the cycle metric for cycles that committed nothing.
    async fn finish_cycle(
        &self,
        cycle_started_at: i64,
        cycle_started: Instant,
        records_in: u64,
        records_out: u64,
        error_count: u32,
        last_error: Option<String>,
    ) {
        let metric = MetricSample {
            chain: self.settings.chain,
            cycle_started_at,
            duration_ms: cycle_started.elapsed().as_millis() as u64,
            records_in,
            records_out,
            error_count,
            last_error,
        };
        if let Err(err) = self.storage.record_metric(&metric).await {
            debug!(
                chain = self.settings.chain.as_str(),
                "metric write failed: {err:#}"
            );
        }
        self.set_phase(CollectorPhase::Idle).await;
    }
}

/// Inclusive end of the fetch window.
fn plan_window_end(next_start: Position, tip: Position, parallelism: usize) -> Position {
    tip.min(next_start.saturating_add(parallelism as u64 - 1))
}

/// Exponential backoff: 2 s doubling to a 120 s cap.
fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        BACKOFF_START
    } else {
        (current * 2).min(BACKOFF_CAP)
    }
}

async fn fetch_position(
    client: Arc<dyn ChainClient>,
    position: Position,
    tx_limit: usize,
    tip: Position,
    rate_limited: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> FetchOutcome {
    if cancel.is_cancelled() {
        return FetchOutcome::Cancelled;
    }
    // Collapse to sequential behavior once any fetch saw a rate limit.
    if rate_limited.load(Ordering::Relaxed) {
        return FetchOutcome::Deferred;
    }

    let block = tokio::select! {
        _ = cancel.cancelled() => return FetchOutcome::Cancelled,
        result = client.block(position) => result,
    };

    let block = match block {
        Ok(block) => block,
        Err(err) => return classify_fetch(err, position, tip, &rate_limited),
    };

    let txs = tokio::select! {
        _ = cancel.cancelled() => return FetchOutcome::Cancelled,
        result = client.block_transactions(position, tx_limit) => result,
    };

    match txs {
        Ok(txs) => FetchOutcome::Block(block, txs),
        Err(err) => classify_fetch(err, position, tip, &rate_limited),
    }
}

fn classify_fetch(
    err: FetchError,
    position: Position,
    tip: Position,
    rate_limited: &AtomicBool,
) -> FetchOutcome {
    match err {
        FetchError::Skipped => FetchOutcome::Empty,
        FetchError::NotFound => {
            if position <= tip {
                // The upstream advertised this position and then lost it:
                // treat as transient, the chain view moved under us.
                FetchOutcome::Failed("not_found_below_tip".to_string())
            } else {
                FetchOutcome::BeyondTip
            }
        }
        FetchError::RateLimited { .. } => {
            rate_limited.store(true, Ordering::Relaxed);
            FetchOutcome::RateLimited
        }
        FetchError::Transient(msg) => FetchOutcome::Failed(msg),
        FetchError::Fatal(msg) => FetchOutcome::Fatal(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_window_end() {
        // Behind by plenty: full window.
        assert_eq!(plan_window_end(101, 1000, 5), 105);
        // Clamped at tip.
        assert_eq!(plan_window_end(998, 1000, 5), 1000);
        // At tip with parallelism 1.
        assert_eq!(plan_window_end(1000, 1000, 1), 1000);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Duration::ZERO;
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(2));
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(4));
        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, Duration::from_secs(120));
    }

    #[test]
    fn test_classify_not_found_depends_on_tip() {
        let flag = AtomicBool::new(false);
        assert!(matches!(
            classify_fetch(FetchError::NotFound, 50, 100, &flag),
            FetchOutcome::Failed(_)
        ));
        assert!(matches!(
            classify_fetch(FetchError::NotFound, 150, 100, &flag),
            FetchOutcome::BeyondTip
        ));
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_classify_rate_limit_sets_collapse_flag() {
        let flag = AtomicBool::new(false);
        assert!(matches!(
            classify_fetch(
                FetchError::RateLimited { retry_after: None },
                1,
                100,
                &flag
            ),
            FetchOutcome::RateLimited
        ));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_error_window_pruning() {
        let mut runtime = ChainRuntime::default();
        runtime.record_error(1000, "a".to_string());
        runtime.record_error(1100, "b".to_string());
        runtime.record_error(1400, "c".to_string());
        assert_eq!(runtime.errors_in_window(1400, 300), 3);
        assert_eq!(runtime.errors_in_window(1400, 60), 1);
        // Old entries fall out of the deque as time moves on.
        runtime.record_error(2000, "d".to_string());
        assert_eq!(runtime.errors_in_window(2000, 300), 1);
    }
}
