//! Processor port: the hook contract collaborators implement.

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{InFlightClaim, Payload, ProcessOutcome};

/// The processing hooks the poller dispatches into.
///
/// Design intent:
/// - The poller owns claiming and settling; the processor owns payload
///   semantics and nothing else.
/// - Delivery is at-least-once: a lease that expires mid-processing makes the
///   item visible again, so `process` must tolerate seeing a payload twice.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Whether the item's readiness window has truly opened.
    ///
    /// Called synchronously on the dispatch path: keep it side-effect-free
    /// and fast. Returning `false` is a planning race, not a failure; the
    /// item is deferred without being counted against it.
    fn ready_to_process(&self, payload: &Payload) -> bool {
        let _ = payload;
        true
    }

    /// Do the work. Panics are caught at the item boundary and treated as a
    /// retryable failure.
    async fn process(&self, payload: &Payload) -> ProcessOutcome;

    /// Dead-letter hook: called for items that returned `Fatal` or whose
    /// `claim_count` exceeded the configured maximum. The claim is removed
    /// from the store after this returns, so implementations that need the
    /// item preserved must persist it here.
    async fn on_poison(&self, claim: &InFlightClaim) {
        warn!(
            payload = ?claim.payload,
            claim_count = claim.claim_count,
            "no dead-letter hook installed; poison item dropped after this log line"
        );
    }
}
