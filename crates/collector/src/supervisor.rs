//! Collection supervisor: owns collector lifecycles, enforces the run-level
//! safety budgets, and answers the control plane.
//!
//! The supervisor is the single process-wide owner of run state. Collectors
//! publish into per-chain runtime slots; the supervisor only reads them, so
//! status and health never block collection.

use anyhow::Result;
use chainflow_core::{ChainId, Position, StopReason};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collector::{ChainRuntime, Collector, CollectorPhase, CollectorSettings};
use crate::config::Config;
use crate::rpc::ChainClients;
use crate::storage::Storage;

/// How long `stop` waits for collectors to drain a final commit.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Collection started.
    Started {
        /// Run start, unix seconds.
        started_at: i64,
    },
    /// A run is already active; not an error, but signaled.
    AlreadyRunning,
    /// The analytics store did not answer; nothing was started.
    StoreUnreachable(String),
    /// Configuration prevents starting (e.g. no chains enabled).
    Rejected(String),
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// The run was stopped.
    Stopped {
        /// Stop time, unix seconds.
        stopped_at: i64,
        /// Why the run ended.
        reason: StopReason,
    },
    /// No run was active.
    NotRunning,
}

/// Per-chain slice of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    /// Chain.
    pub chain: ChainId,
    /// Collector phase.
    pub phase: CollectorPhase,
    /// Last committed position.
    pub position: Option<Position>,
    /// Block rows committed this run.
    pub blocks: u64,
    /// Transaction rows committed this run.
    pub txs: u64,
    /// Records per second over the last committing cycle.
    pub rate_per_sec: f64,
    /// Last error tag observed.
    pub last_error: Option<String>,
}

/// Snapshot answered to `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Whether a run is active.
    pub is_running: bool,
    /// Active run start, unix seconds.
    pub started_at: Option<i64>,
    /// Per-chain counters for enabled chains.
    pub chains: Vec<ChainStatus>,
}

/// Health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Committing recently with a low error rate.
    Healthy,
    /// Still committing, but slowly or with elevated errors.
    Degraded,
    /// Not committing, or fatally failed.
    Unhealthy,
}

impl HealthLevel {
    /// Stable identifier for the health endpoint.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
        }
    }
}

/// Per-chain slice of the health report.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    /// Chain.
    pub chain: ChainId,
    /// Classification.
    pub level: HealthLevel,
    /// Seconds since the last successful commit.
    pub seconds_since_last_commit: Option<i64>,
    /// Errors observed in the last five minutes.
    pub error_count_5m: usize,
}

/// Snapshot answered to `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst per-chain classification.
    pub overall: HealthLevel,
    /// Per-chain details for enabled chains.
    pub chains: Vec<ChainHealth>,
}

/// Per-chain backfill progress.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillProgress {
    /// Chain.
    pub chain: ChainId,
    /// First position of this collection.
    pub start: Option<Position>,
    /// Last committed position.
    pub current: Option<Position>,
    /// Last discovered tip.
    pub target: Option<Position>,
    /// Progress from start to target, 0–100.
    pub percent: f64,
}

struct ActiveRun {
    run_id: i64,
    started_at: i64,
    cancel: CancellationToken,
    collectors: Vec<(ChainId, JoinHandle<()>)>,
    watchdog: Option<JoinHandle<()>>,
}

/// Owns per-chain collectors and the control-plane contract.
///
/// Cheap to clone; all clones share the same run state, so background tasks
/// (the budget watchdog) hold a clone rather than a back-reference.
#[derive(Clone)]
pub struct Supervisor {
    config: Config,
    storage: Storage,
    clients: ChainClients,
    runtimes: HashMap<ChainId, Arc<RwLock<ChainRuntime>>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl Supervisor {
    /// Create a supervisor. Collectors are not spawned until `start`.
    pub fn new(config: Config, storage: Storage, clients: ChainClients) -> Self {
        let runtimes = ChainId::all()
            .into_iter()
            .map(|chain| (chain, Arc::new(RwLock::new(ChainRuntime::default()))))
            .collect();
        Self {
            config,
            storage,
            clients,
            runtimes,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared storage handle.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Start a collection run: spawn one collector per enabled chain and the
    /// budget watchdog. Idempotent; a second start reports `AlreadyRunning`.
    pub async fn start(&self) -> StartOutcome {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        // Fail fast when the store is unreachable.
        if let Err(err) = self.storage.health_check().await {
            return StartOutcome::StoreUnreachable(format!("{err:#}"));
        }

        let chains = self.config.enabled_chains();
        if chains.is_empty() {
            return StartOutcome::Rejected("no chains enabled".to_string());
        }

        let started_at = chrono::Utc::now().timestamp();
        let run_id = match self.storage.open_run(started_at).await {
            Ok(id) => id,
            Err(err) => return StartOutcome::StoreUnreachable(format!("{err:#}")),
        };

        let cancel = CancellationToken::new();
        let mut collectors = Vec::new();

        for chain in chains {
            let Some(client) = self.clients.for_chain(chain) else {
                warn!(chain = chain.as_str(), "chain enabled but no client configured");
                continue;
            };
            let settings = match chain {
                ChainId::Bitcoin => {
                    CollectorSettings::bitcoin(&self.config.bitcoin, &self.config.collection)
                }
                ChainId::Solana => {
                    CollectorSettings::solana(&self.config.solana, &self.config.collection)
                }
            };
            let runtime = Arc::clone(&self.runtimes[&chain]);
            *runtime.write().await = ChainRuntime::default();

            let collector = Collector::new(
                settings,
                client,
                self.storage.clone(),
                runtime,
                cancel.child_token(),
            );
            collectors.push((chain, tokio::spawn(collector.run())));
        }

        let watchdog = tokio::spawn(Self::watchdog_loop(
            self.clone(),
            cancel.clone(),
            started_at,
        ));

        info!(run_id, started_at, "collection run started");
        *active = Some(ActiveRun {
            run_id,
            started_at,
            cancel,
            collectors,
            watchdog: Some(watchdog),
        });

        StartOutcome::Started { started_at }
    }

    /// Stop the active run as a manual operation.
    pub async fn stop(&self) -> StopOutcome {
        self.stop_with(StopReason::Manual).await
    }

    /// Stop the active run with an explicit reason (budget trips use this).
    pub async fn stop_with(&self, reason: StopReason) -> StopOutcome {
        let run = { self.active.lock().await.take() };
        let Some(run) = run else {
            return StopOutcome::NotRunning;
        };

        info!(run_id = run.run_id, reason = reason.as_str(), "stopping collection run");
        run.cancel.cancel();

        // Give collectors the grace period to drain a final commit.
        let deadline = Instant::now() + STOP_GRACE_PERIOD;
        for (chain, mut handle) in run.collectors {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(100));
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(
                    chain = chain.as_str(),
                    "collector did not drain within the grace period; aborting"
                );
                handle.abort();
            }
        }

        if let Some(watchdog) = run.watchdog {
            watchdog.abort();
        }

        let stopped_at = chrono::Utc::now().timestamp();
        if let Err(err) = self.storage.close_run(run.run_id, stopped_at, reason).await {
            warn!("failed to close collection run row: {err:#}");
        }

        info!(run_id = run.run_id, reason = reason.as_str(), "collection run stopped");
        StopOutcome::Stopped { stopped_at, reason }
    }

    /// Whether a run is currently active.
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Snapshot for `GET /status`. Always answers.
    pub async fn status(&self) -> StatusReport {
        let (is_running, started_at) = {
            let active = self.active.lock().await;
            match &*active {
                Some(run) => (true, Some(run.started_at)),
                None => (false, None),
            }
        };

        let mut chains = Vec::new();
        for chain in self.config.enabled_chains() {
            let runtime = self.runtimes[&chain].read().await;
            chains.push(ChainStatus {
                chain,
                phase: runtime.phase,
                position: runtime.cursor,
                blocks: runtime.blocks_total,
                txs: runtime.txs_total,
                rate_per_sec: runtime.rate_per_sec,
                last_error: runtime.last_error.clone(),
            });
        }

        StatusReport {
            is_running,
            started_at,
            chains,
        }
    }

    /// Snapshot for `GET /health`.
    ///
    /// Per chain: healthy means a commit within 60 s and fewer than 5 errors
    /// in the last minute; degraded means a commit within 300 s or an
    /// elevated error rate; anything beyond that, or a fatal collector, is
    /// unhealthy.
    pub async fn health(&self) -> HealthReport {
        let now = chrono::Utc::now().timestamp();
        let mut chains = Vec::new();

        for chain in self.config.enabled_chains() {
            let runtime = self.runtimes[&chain].read().await;
            let seconds_since = runtime.last_commit_at.map(|t| now - t);
            let errors_1m = runtime.errors_in_window(now, 60);
            let errors_5m = runtime.errors_in_window(now, 300);

            let level = if runtime.phase == CollectorPhase::Fatal {
                HealthLevel::Unhealthy
            } else {
                match seconds_since {
                    Some(s) if s <= 60 && errors_1m < 5 => HealthLevel::Healthy,
                    Some(s) if s <= 300 => HealthLevel::Degraded,
                    _ => HealthLevel::Unhealthy,
                }
            };

            chains.push(ChainHealth {
                chain,
                level,
                seconds_since_last_commit: seconds_since,
                error_count_5m: errors_5m,
            });
        }

        let overall = chains
            .iter()
            .map(|c| c.level)
            .max()
            .unwrap_or(HealthLevel::Unhealthy);

        HealthReport { overall, chains }
    }

    /// Snapshot for `GET /backfill-progress`.
    pub async fn backfill_progress(&self) -> Vec<BackfillProgress> {
        let mut progress = Vec::new();
        for chain in self.config.enabled_chains() {
            let runtime = self.runtimes[&chain].read().await;
            let (start, current, target) =
                (runtime.start_position, runtime.cursor, runtime.target);

            let percent = match (start, current, target) {
                (Some(s), Some(c), Some(t)) if t > s => {
                    ((c.saturating_sub(s) as f64 / (t - s) as f64) * 100.0).clamp(0.0, 100.0)
                }
                // Tip-follow starts at the tip itself: done once it commits.
                (Some(_), Some(c), Some(t)) if c >= t => 100.0,
                _ => 0.0,
            };

            progress.push(BackfillProgress {
                chain,
                start,
                current,
                target,
                percent,
            });
        }
        progress
    }

    /// Budget watchdog: checks the wall-clock and storage budgets once per
    /// cycle interval and stops the whole run when one trips.
    async fn watchdog_loop(supervisor: Supervisor, cancel: CancellationToken, started_at: i64) {
        let interval =
            Duration::from_secs(supervisor.config.collection.cycle_interval_seconds.max(1));
        let max_duration_secs = supervisor.config.collection.max_duration_minutes * 60;
        let max_size_bytes =
            (supervisor.config.collection.max_size_gb * BYTES_PER_GB) as u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let now = chrono::Utc::now().timestamp();
            if max_duration_secs > 0 && (now - started_at) as u64 >= max_duration_secs {
                info!("time budget reached, stopping run");
                Self::trip_budget(&supervisor, StopReason::TimeBudget);
                return;
            }

            match supervisor.storage.size_bytes().await {
                Ok(size) if size >= max_size_bytes => {
                    info!(size, max_size_bytes, "size budget reached, stopping run");
                    Self::trip_budget(&supervisor, StopReason::SizeBudget);
                    return;
                }
                Ok(_) => {}
                Err(err) => warn!("size budget check failed: {err:#}"),
            }
        }
    }

    /// Budget trips tear the run down from a separate task so the watchdog
    /// is never joining itself.
    fn trip_budget(supervisor: &Supervisor, reason: StopReason) {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let _ = supervisor.stop_with(reason).await;
        });
    }
}

impl Supervisor {
    /// Seed runtime cursors from persisted state so status answers sensibly
    /// before the first start. Best-effort.
    pub async fn preload_cursors(&self) -> Result<()> {
        for chain in ChainId::all() {
            if let Some(cursor) = self.storage.load_cursor(chain).await? {
                self.runtimes[&chain].write().await.cursor = Some(cursor.position);
            }
        }
        Ok(())
    }
}
