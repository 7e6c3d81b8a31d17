//! Recovery sweep: returns expired leases to the schedule.
//!
//! Runs on its own timer, deliberately decoupled from the poll loop: a
//! stalled or dead poller must not prevent its claims from being reclaimed.
//! The interval is validated to be at most the lease duration, otherwise an
//! expired claim could wait arbitrarily long for reclaim.
//!
//! The sweep is idempotent. If the original worker acknowledges between
//! `list_expired` and `reclaim`, the store answers `NotFound` and the sweep
//! moves on; the item was settled, nobody lost. The reverse race (sweep wins,
//! the worker's late acknowledge finds nothing) is the source of duplicate
//! execution that at-least-once delivery permits.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ConveyorError;
use crate::ports::clock::Clock;
use crate::ports::store::{LeaseTracker, StoreAck};

pub struct RecoverySweeper<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl<S: LeaseTracker> RecoverySweeper<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Sweep on the configured interval until shutdown.
    ///
    /// One pass at a time: overlapping sweeps are harmless (reclaim is
    /// atomic, losers see `NotFound`) but waste round trips, so this loop
    /// never starts a pass while another is running.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.config.sweep_interval, "recovery sweeper starting");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            match self.sweep_once().await {
                Ok(0) => {}
                Ok(reclaimed) => {
                    info!(reclaimed, "returned expired claims to the schedule");
                }
                Err(error) => {
                    // Nothing was half-applied; the next tick retries.
                    warn!(%error, "sweep pass failed, retrying next interval");
                }
            }
        }

        info!("recovery sweeper stopped");
    }

    /// One full pass over the expired portion of the in-flight set.
    /// Returns how many claims were reclaimed.
    pub async fn sweep_once(&self) -> Result<usize, ConveyorError> {
        let mut reclaimed = 0;

        loop {
            let now = self.clock.now();
            let expired = self
                .store
                .list_expired(now, self.config.sweep_page_size)
                .await?;
            if expired.is_empty() {
                break;
            }
            let page_len = expired.len();

            for claim in expired {
                // Immediate eligibility: the item waited long enough already.
                match self.store.reclaim(&claim.payload, now).await? {
                    StoreAck::Applied => {
                        reclaimed += 1;
                        warn!(
                            payload = ?claim.payload,
                            owner = %claim.owner,
                            expired_at = %claim.lease_expires_at,
                            claim_count = claim.claim_count + 1,
                            "lease expired, item returned to schedule"
                        );
                    }
                    StoreAck::NotFound => {
                        debug!(payload = ?claim.payload, "claim settled before reclaim, skipping");
                    }
                }
            }

            if page_len < self.config.sweep_page_size {
                break;
            }
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use crate::domain::{Payload, WorkerId};
    use crate::ports::clock::FixedClock;
    use crate::ports::store::OrderedStore;
    use crate::store::MemoryStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn sweeper(
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        config: Config,
    ) -> RecoverySweeper<MemoryStore> {
        RecoverySweeper::new(store, clock, Arc::new(config))
    }

    #[tokio::test]
    async fn expired_claims_go_back_to_the_schedule() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let s = sweeper(Arc::clone(&store), Arc::clone(&clock), Config::default());
        let worker = WorkerId::generate();

        store.enqueue(Payload::from("p"), t0()).await.unwrap();
        store
            .claim_ready(t0(), 1, Duration::from_secs(30), &worker)
            .await
            .unwrap();

        // Lease still valid: nothing to do.
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(s.sweep_once().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(s.sweep_once().await.unwrap(), 1);

        // Immediately claimable again, with the expiry counted.
        let claims = store
            .claim_ready(clock.now(), 1, Duration::from_secs(30), &worker)
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_count, 1);
    }

    #[tokio::test]
    async fn sweep_pages_through_large_expired_sets() {
        let mut config = Config::default();
        config.sweep_page_size = 2;

        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let s = sweeper(Arc::clone(&store), Arc::clone(&clock), config);
        let worker = WorkerId::generate();

        for i in 0..5 {
            store
                .enqueue(Payload::from(format!("item-{i}").as_str()), t0())
                .await
                .unwrap();
        }
        store
            .claim_ready(t0(), 5, Duration::from_secs(30), &worker)
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(s.sweep_once().await.unwrap(), 5);
        assert_eq!(store.counts().await.unwrap().scheduled, 5);
        assert_eq!(store.counts().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn late_acknowledge_after_sweep_is_a_benign_no_op() {
        // The at-least-once race: the sweeper reclaims an expired item, then
        // the original worker comes back and acknowledges. The late ack finds
        // nothing and nothing is lost.
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let s = sweeper(Arc::clone(&store), Arc::clone(&clock), Config::default());
        let worker = WorkerId::generate();
        let p = Payload::from("p");

        store.enqueue(p.clone(), t0()).await.unwrap();
        store
            .claim_ready(t0(), 1, Duration::from_secs(30), &worker)
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(31));
        s.sweep_once().await.unwrap();

        assert_eq!(
            store.acknowledge(&p).await.unwrap(),
            crate::ports::store::StoreAck::NotFound
        );
        // The reclaimed item is still scheduled.
        assert_eq!(store.counts().await.unwrap().scheduled, 1);
    }
}
