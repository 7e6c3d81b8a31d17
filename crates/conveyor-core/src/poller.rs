//! The poll loop: claim, dispatch, settle.
//!
//! Per cycle: claim a batch of ready items, fan them out to the processor
//! under a concurrency bound, and settle each one independently (acknowledge,
//! requeue, or dead-letter). A cycle runs to completion before the next claim;
//! the idle sleep only happens when a claim came back empty.
//!
//! Failure isolation is the point of this module: a processor panic, a fatal
//! item, or a store hiccup while settling never kills the loop and never
//! loses the item. Anything this loop fails to settle stays in the in-flight
//! set and is returned to the schedule by lease recovery.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::domain::{InFlightClaim, ProcessOutcome, WorkerId};
use crate::error::ConveyorError;
use crate::ports::clock::Clock;
use crate::ports::processor::Processor;
use crate::ports::store::{LeaseTracker, OrderedStore, StoreAck};

/// Attempts per settling operation before surrendering the claim to lease
/// recovery.
const SETTLE_ATTEMPTS: u32 = 3;

/// One polling instance. Multiple instances (in this process or others) may
/// run against the same store; claim atomicity keeps them from sharing items.
pub struct Poller<S, P> {
    store: Arc<S>,
    processor: Arc<P>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    worker_id: WorkerId,
    wake: Arc<Notify>,
    dispatch_slots: Arc<Semaphore>,
}

impl<S, P> Poller<S, P>
where
    S: OrderedStore + LeaseTracker + 'static,
    P: Processor,
{
    pub fn new(
        store: Arc<S>,
        processor: Arc<P>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        let dispatch_slots = Arc::new(Semaphore::new(config.dispatch_concurrency));
        Self {
            store,
            processor,
            clock,
            config,
            worker_id: WorkerId::generate(),
            wake: Arc::new(Notify::new()),
            dispatch_slots,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Handle producers can use to cut the idle sleep short after enqueueing.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Run until the shutdown channel flips to `true`.
    ///
    /// A shutdown request lets the in-flight batch finish settling before the
    /// loop exits; a hard kill is also safe, it just leaves more work for
    /// lease recovery. Returns an error only when the store stays unavailable
    /// past `store_retry_limit`.
    pub async fn run(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ConveyorError> {
        info!(worker = %self.worker_id, "poller starting");
        let mut outage_attempts: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(0) => {
                    outage_attempts = 0;
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Ok(_) => {
                    // Items were claimed; go straight back for more.
                    outage_attempts = 0;
                }
                Err(ConveyorError::StoreUnavailable(reason)) => {
                    outage_attempts += 1;
                    if let Some(limit) = self.config.store_retry_limit {
                        if outage_attempts > limit {
                            error!(
                                worker = %self.worker_id,
                                %reason,
                                attempts = outage_attempts,
                                "store retries exhausted, poller giving up"
                            );
                            return Err(ConveyorError::StoreUnavailable(reason));
                        }
                    }
                    let delay = self.config.backoff.delay(outage_attempts);
                    warn!(
                        worker = %self.worker_id,
                        %reason,
                        attempt = outage_attempts,
                        ?delay,
                        "store unavailable, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(other) => return Err(other),
            }
        }

        info!(worker = %self.worker_id, "poller stopped");
        Ok(())
    }

    /// Claim and settle one batch. Returns how many items were claimed.
    ///
    /// Public so callers and tests can drive cycles without the timing loop.
    pub async fn run_once(&self) -> Result<usize, ConveyorError> {
        let now = self.clock.now();
        let claims = self
            .store
            .claim_ready(
                now,
                self.config.batch_size,
                self.config.lease_duration,
                &self.worker_id,
            )
            .await?;

        if claims.is_empty() {
            return Ok(0);
        }
        let claimed = claims.len();
        debug!(worker = %self.worker_id, claimed, "claimed batch");

        let mut tasks = Vec::with_capacity(claimed);
        for claim in claims {
            let permit = Arc::clone(&self.dispatch_slots)
                .acquire_owned()
                .await
                .expect("dispatch semaphore closed");
            let store = Arc::clone(&self.store);
            let processor = Arc::clone(&self.processor);
            let clock = Arc::clone(&self.clock);
            let config = Arc::clone(&self.config);
            let payload = claim.payload.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(store, processor, clock, config, claim).await;
            });
            tasks.push((payload, handle));
        }

        for (payload, handle) in tasks {
            if let Err(join_error) = handle.await {
                // The dispatch task itself died. The claim is still leased,
                // so lease recovery will bring the item back.
                error!(
                    worker = %self.worker_id,
                    ?payload,
                    %join_error,
                    "dispatch task aborted, leaving claim to lease recovery"
                );
            }
        }

        Ok(claimed)
    }
}

/// Settle a single claimed item. Infallible by design: every path ends in a
/// store call or in surrendering the claim to lease recovery.
async fn dispatch_one<S, P>(
    store: Arc<S>,
    processor: Arc<P>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    claim: InFlightClaim,
) where
    S: OrderedStore + LeaseTracker + 'static,
    P: Processor,
{
    let payload = claim.payload.clone();

    if claim.claim_count >= config.max_claim_count {
        warn!(
            ?payload,
            claim_count = claim.claim_count,
            "claim budget exhausted, routing to dead-letter hook"
        );
        processor.on_poison(&claim).await;
        settle(&config.backoff, "acknowledge", || store.acknowledge(&payload)).await;
        return;
    }

    if !processor.ready_to_process(&payload) {
        let at = clock.now() + config.not_ready_delay;
        debug!(?payload, ready_at = %at, "readiness window not open, deferring");
        if config.not_ready_counts_as_claim {
            settle(&config.backoff, "reclaim", || store.reclaim(&payload, at)).await;
        } else {
            settle(&config.backoff, "requeue", || store.requeue(&payload, at)).await;
        }
        return;
    }

    let outcome = {
        let processor = Arc::clone(&processor);
        let payload = payload.clone();
        // Own task so a panic in `process` is contained to this item.
        match tokio::spawn(async move { processor.process(&payload).await }).await {
            Ok(outcome) => outcome,
            Err(join_error) if join_error.is_panic() => {
                ProcessOutcome::retry(format!("process panicked: {join_error}"))
            }
            // Cancelled (runtime going down); the lease keeps the item
            // recoverable.
            Err(_) => return,
        }
    };

    match outcome {
        ProcessOutcome::Success => {
            debug!(?payload, "processed");
            settle(&config.backoff, "acknowledge", || store.acknowledge(&payload)).await;
        }
        ProcessOutcome::Retry { after, reason } => {
            let delay = after.unwrap_or_else(|| config.backoff.delay(claim.claim_count + 1));
            let at = clock.now() + delay;
            warn!(?payload, %reason, retry_at = %at, "retryable failure, requeueing");
            settle(&config.backoff, "requeue", || store.requeue(&payload, at)).await;
        }
        ProcessOutcome::Fatal { reason } => {
            error!(?payload, %reason, "fatal failure, routing to dead-letter hook");
            processor.on_poison(&claim).await;
            settle(&config.backoff, "acknowledge", || store.acknowledge(&payload)).await;
        }
    }
}

/// Apply one settling operation, riding out brief store outages.
///
/// `NotFound` means another worker (usually the sweeper) settled the claim
/// first; the race is resolved by the store, so it is logged and absorbed.
async fn settle<F, Fut>(backoff: &BackoffPolicy, what: &str, mut op: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<StoreAck, ConveyorError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(StoreAck::Applied) => return,
            Ok(StoreAck::NotFound) => {
                debug!(what, "claim already settled elsewhere");
                return;
            }
            Err(error) => {
                attempt += 1;
                if attempt >= SETTLE_ATTEMPTS {
                    warn!(
                        what,
                        %error,
                        "giving up after repeated store errors, leaving claim to lease recovery"
                    );
                    return;
                }
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }
    }
}
