//! Dual-source routing for Bitcoin: prefer the local node, fall back to the
//! public API on failure, with a sticky preference and a periodic probe.
//!
//! Preference policy:
//! - While `local` is preferred, every call tries the local node first; a
//!   Transient or Fatal failure flips preference to `public` with a cooldown
//!   and retries the request on the public API.
//! - While `public` is preferred, a cheap `tip_position` probe against the
//!   local node runs at most once per probe interval (and never inside the
//!   cooldown window); success restores the local preference.
//! - Rate-limit responses never flip preference in either direction: they
//!   are a property of the caller, not of the source.

use async_trait::async_trait;
use chainflow_core::{BlockRecord, FetchError, Position, RecordSource, TxRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::ChainClient;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preferred {
    Local,
    Public,
}

struct PreferenceState {
    preferred: Preferred,
    cooldown_until: Option<Instant>,
    last_probe: Option<Instant>,
}

/// Routes Bitcoin requests between a local node and a public API.
///
/// Only the owning Bitcoin collector task issues calls through the router,
/// so preference mutations are single-owner; the mutex exists for the
/// occasional status reader.
pub struct SourceRouter {
    local: Arc<dyn ChainClient>,
    public: Arc<dyn ChainClient>,
    cooldown: Duration,
    probe_interval: Duration,
    state: Mutex<PreferenceState>,
    prefers_local: AtomicBool,
}

impl SourceRouter {
    /// Create a router with the default cooldown (60 s) and probe interval
    /// (5 minutes).
    pub fn new(local: Arc<dyn ChainClient>, public: Arc<dyn ChainClient>) -> Self {
        Self::with_policy(local, public, DEFAULT_COOLDOWN, DEFAULT_PROBE_INTERVAL)
    }

    /// Create a router with explicit timings.
    pub fn with_policy(
        local: Arc<dyn ChainClient>,
        public: Arc<dyn ChainClient>,
        cooldown: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            local,
            public,
            cooldown,
            probe_interval,
            state: Mutex::new(PreferenceState {
                preferred: Preferred::Local,
                cooldown_until: None,
                last_probe: None,
            }),
            prefers_local: AtomicBool::new(true),
        }
    }

    /// True when a local Transient/Fatal should flip preference to public.
    fn should_flip(err: &FetchError) -> bool {
        matches!(err, FetchError::Transient(_) | FetchError::Fatal(_))
    }

    async fn flip_to_public(&self) {
        let mut state = self.state.lock().await;
        if state.preferred == Preferred::Local {
            warn!("local Bitcoin node failed; falling back to public API");
        }
        state.preferred = Preferred::Public;
        state.cooldown_until = Some(Instant::now() + self.cooldown);
        self.prefers_local.store(false, Ordering::Relaxed);
    }

    /// Decide which source to use for the next call, probing the local node
    /// if it is due.
    async fn choose(&self) -> Preferred {
        let now = Instant::now();
        {
            let mut state = self.state.lock().await;
            match state.preferred {
                Preferred::Local => return Preferred::Local,
                Preferred::Public => {
                    let in_cooldown = state.cooldown_until.is_some_and(|until| now < until);
                    let probe_due = state
                        .last_probe
                        .map_or(true, |last| now.duration_since(last) >= self.probe_interval);
                    if in_cooldown || !probe_due {
                        return Preferred::Public;
                    }
                    state.last_probe = Some(now);
                }
            }
        }

        // Probe outside the lock; any failure keeps the public preference.
        match self.local.tip_position().await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.preferred = Preferred::Local;
                state.cooldown_until = None;
                self.prefers_local.store(true, Ordering::Relaxed);
                info!("local Bitcoin node is reachable again; restoring preference");
                Preferred::Local
            }
            Err(_) => Preferred::Public,
        }
    }
}

#[async_trait]
impl ChainClient for SourceRouter {
    async fn tip_position(&self) -> Result<Position, FetchError> {
        match self.choose().await {
            Preferred::Local => match self.local.tip_position().await {
                Err(err) if Self::should_flip(&err) => {
                    self.flip_to_public().await;
                    self.public.tip_position().await
                }
                other => other,
            },
            Preferred::Public => self.public.tip_position().await,
        }
    }

    async fn block(&self, position: Position) -> Result<BlockRecord, FetchError> {
        match self.choose().await {
            Preferred::Local => match self.local.block(position).await {
                Err(err) if Self::should_flip(&err) => {
                    self.flip_to_public().await;
                    self.public.block(position).await
                }
                other => other,
            },
            Preferred::Public => self.public.block(position).await,
        }
    }

    async fn block_transactions(
        &self,
        position: Position,
        limit: usize,
    ) -> Result<Vec<TxRecord>, FetchError> {
        match self.choose().await {
            Preferred::Local => match self.local.block_transactions(position, limit).await {
                Err(err) if Self::should_flip(&err) => {
                    self.flip_to_public().await;
                    self.public.block_transactions(position, limit).await
                }
                other => other,
            },
            Preferred::Public => self.public.block_transactions(position, limit).await,
        }
    }

    fn source(&self) -> RecordSource {
        if self.prefers_local.load(Ordering::Relaxed) {
            RecordSource::LocalNode
        } else {
            RecordSource::PublicApi
        }
    }
}
