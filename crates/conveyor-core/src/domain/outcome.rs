//! Outcome model: the three-way result of processing one item.
//!
//! This module is store-agnostic: it only defines the shape of results the
//! poller can act on. Errors and panics inside a processor are converted into
//! one of these values at the item boundary; they never escape the loop.

use std::time::Duration;

/// Result of a single `process` invocation.
///
/// - `Success`: the item is done and may be acknowledged (removed).
/// - `Retry`: recoverable failure; the item goes back to the scheduled set
///   with a future `ready_at`. Does not touch `claim_count`, which tracks
///   lease expiries, not reported failures.
/// - `Fatal`: the item must not be retried; it is routed to the dead-letter
///   hook and then removed. Never silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Success,
    Retry {
        /// Explicit delay before the next attempt. `None` defers to the
        /// configured backoff policy.
        after: Option<Duration>,
        reason: String,
    },
    Fatal {
        reason: String,
    },
}

impl ProcessOutcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            after: None,
            reason: reason.into(),
        }
    }

    pub fn retry_after(reason: impl Into<String>, after: Duration) -> Self {
        Self::Retry {
            after: Some(after),
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
