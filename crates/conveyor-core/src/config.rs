//! Runtime configuration for pollers and the recovery sweeper.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::ConveyorError;

/// Knobs recognized by the poll loop and the recovery sweeper.
///
/// One struct for both: the sweep interval is only meaningful relative to the
/// lease duration, so validating them together is the point.
#[derive(Debug, Clone)]
pub struct Config {
    /// Idle sleep between poll cycles when nothing was ready.
    pub poll_interval: Duration,

    /// Maximum items moved to in-flight per claim call.
    pub batch_size: usize,

    /// How long a claim is valid before the sweeper may reclaim it.
    pub lease_duration: Duration,

    /// Claims whose `claim_count` has reached this value are routed to the
    /// dead-letter hook instead of being dispatched again.
    pub max_claim_count: u32,

    /// Delay policy for retryable failures and store outages.
    pub backoff: BackoffPolicy,

    /// How far into the future an item is pushed when `ready_to_process`
    /// returns `false`.
    pub not_ready_delay: Duration,

    /// Whether a "not yet ready" deferral increments `claim_count`.
    /// Off by default: a planning race is not a failure.
    pub not_ready_counts_as_claim: bool,

    /// Upper bound on concurrently dispatched items per poller instance.
    pub dispatch_concurrency: usize,

    /// Consecutive claim failures tolerated before the poll loop gives up.
    /// `None` retries forever.
    pub store_retry_limit: Option<u32>,

    /// Interval between recovery sweeps. Must not exceed `lease_duration`,
    /// or expired claims can starve.
    pub sweep_interval: Duration,

    /// Maximum expired claims fetched per `list_expired` call.
    pub sweep_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 16,
            lease_duration: Duration::from_secs(30),
            max_claim_count: 5,
            backoff: BackoffPolicy::default(),
            not_ready_delay: Duration::from_secs(1),
            not_ready_counts_as_claim: false,
            dispatch_concurrency: 4,
            store_retry_limit: None,
            sweep_interval: Duration::from_secs(10),
            sweep_page_size: 128,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.batch_size == 0 {
            return Err(ConveyorError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.dispatch_concurrency == 0 {
            return Err(ConveyorError::InvalidConfig(
                "dispatch_concurrency must be at least 1".into(),
            ));
        }
        if self.sweep_page_size == 0 {
            return Err(ConveyorError::InvalidConfig(
                "sweep_page_size must be at least 1".into(),
            ));
        }
        if self.sweep_interval > self.lease_duration {
            return Err(ConveyorError::InvalidConfig(format!(
                "sweep_interval ({:?}) must not exceed lease_duration ({:?})",
                self.sweep_interval, self.lease_duration
            )));
        }
        Ok(())
    }
}
