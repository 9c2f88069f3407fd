//! Error taxonomy for the ingestion engine.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing or parsing core types.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unrecognized chain identifier.
    #[error("Unknown chain: {0} (expected 'bitcoin' or 'solana')")]
    UnknownChain(String),

    /// Unrecognized collection mode.
    #[error("Unknown collection mode: {0} (expected 'tip' or 'backfill')")]
    UnknownMode(String),

    /// Unrecognized stop reason.
    #[error("Unknown stop reason: {0}")]
    UnknownStopReason(String),
}

/// Result alias for core parsing operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Classified outcome of an upstream RPC call.
///
/// Every client method surfaces exactly this taxonomy so the collector can
/// apply a uniform retry/backoff policy:
///
/// | Variant       | Retryable | Triggers backoff        |
/// |---------------|-----------|-------------------------|
/// | `NotFound`    | no        | no                      |
/// | `Skipped`     | no        | no                      |
/// | `RateLimited` | yes       | yes, exponential        |
/// | `Transient`   | yes       | linear (next cycle)     |
/// | `Fatal`       | no        | no, parks the collector |
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The requested position is beyond the upstream's tip.
    #[error("position not found upstream")]
    NotFound,

    /// Solana-only: no leader produced a block for this slot.
    #[error("slot was skipped")]
    Skipped,

    /// HTTP 429 or the JSON-RPC equivalent.
    #[error("rate limited by upstream")]
    RateLimited {
        /// Server-suggested wait, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// Timeout, 5xx, connection failure: safe to retry next cycle.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Auth failure, malformed response, unknown method: retrying is useless.
    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Whether a retry can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::Transient(_)
        )
    }

    /// Whether this error arms the collector's exponential backoff.
    pub fn triggers_backoff(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }

    /// Short stable tag for metrics and structured logs.
    pub fn tag(&self) -> &'static str {
        match self {
            FetchError::NotFound => "not_found",
            FetchError::Skipped => "skipped",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Transient(_) => "transient",
            FetchError::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(FetchError::RateLimited { retry_after: None }.is_retryable());
        assert!(FetchError::Transient("timeout".into()).is_retryable());
        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::Skipped.is_retryable());
        assert!(!FetchError::Fatal("bad auth".into()).is_retryable());
    }

    #[test]
    fn only_rate_limits_arm_backoff() {
        assert!(FetchError::RateLimited { retry_after: None }.triggers_backoff());
        assert!(!FetchError::Transient("503".into()).triggers_backoff());
        assert!(!FetchError::Fatal("auth".into()).triggers_backoff());
    }

    #[test]
    fn tags_are_stable() {
        assert_eq!(FetchError::NotFound.tag(), "not_found");
        assert_eq!(
            FetchError::RateLimited { retry_after: None }.tag(),
            "rate_limited"
        );
    }
}
