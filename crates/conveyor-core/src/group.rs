//! Poller group: N pollers plus the recovery sweeper under one shutdown.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::error;

use crate::config::Config;
use crate::error::ConveyorError;
use crate::poller::Poller;
use crate::ports::clock::Clock;
use crate::ports::processor::Processor;
use crate::ports::store::{LeaseTracker, OrderedStore};
use crate::sweeper::RecoverySweeper;

/// Handle over a set of pollers and their recovery sweeper.
/// - `request_shutdown()` stops taking new claims; in-flight batches finish.
/// - `shutdown_and_join()` additionally waits for every task to exit.
pub struct PollerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    wakers: Vec<Arc<Notify>>,
}

impl PollerGroup {
    /// Validate the config, then spawn `pollers` poll loops (each with its
    /// own worker id) and exactly one recovery sweeper against the store.
    pub fn spawn<S, P>(
        pollers: usize,
        store: Arc<S>,
        processor: Arc<P>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Result<Self, ConveyorError>
    where
        S: OrderedStore + LeaseTracker + 'static,
        P: Processor,
    {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(pollers + 1);
        let mut wakers = Vec::with_capacity(pollers);

        for _ in 0..pollers {
            let poller = Poller::new(
                Arc::clone(&store),
                Arc::clone(&processor),
                Arc::clone(&clock),
                Arc::clone(&config),
            );
            wakers.push(poller.waker());
            let rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                if let Err(err) = poller.run(rx).await {
                    error!(error = %err, "poller exited with error");
                }
            }));
        }

        let sweeper = RecoverySweeper::new(store, clock, config);
        let rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move {
            sweeper.run(rx).await;
        }));

        Ok(Self {
            shutdown_tx,
            joins,
            wakers,
        })
    }

    /// Cut every poller's idle sleep short, typically after enqueueing.
    pub fn wake(&self) {
        for waker in &self.wakers {
            waker.notify_one();
        }
    }

    /// Request shutdown for all tasks. Does not cancel in-flight processing;
    /// each poller finishes settling its current batch first.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for pollers and sweeper to exit.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::backoff::BackoffPolicy;
    use crate::domain::{Payload, ProcessOutcome};
    use crate::ports::clock::SystemClock;
    use crate::store::MemoryStore;

    struct CountingProcessor {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Processor for CountingProcessor {
        async fn process(&self, _payload: &Payload) -> ProcessOutcome {
            self.seen.fetch_add(1, Ordering::SeqCst);
            ProcessOutcome::Success
        }
    }

    fn fast_config() -> Config {
        Config {
            poll_interval: Duration::from_millis(5),
            lease_duration: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(50),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(5),
                multiplier: 1.0,
                ..BackoffPolicy::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn group_drains_enqueued_items_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
        });

        let group = PollerGroup::spawn(
            2,
            Arc::clone(&store),
            Arc::clone(&processor),
            Arc::new(SystemClock),
            Arc::new(fast_config()),
        )
        .unwrap();

        for i in 0..8 {
            store
                .enqueue(Payload::from(format!("item-{i}").as_str()), Utc::now())
                .await
                .unwrap();
        }
        group.wake();

        // Wait for the drain, bounded.
        for _ in 0..100 {
            if store.counts().await.unwrap().is_drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        group.shutdown_and_join().await;

        assert_eq!(processor.seen.load(Ordering::SeqCst), 8);
        assert!(store.counts().await.unwrap().is_drained());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_spawn() {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(CountingProcessor {
            seen: AtomicUsize::new(0),
        });
        let config = Config {
            sweep_interval: Duration::from_secs(120),
            lease_duration: Duration::from_secs(30),
            ..Config::default()
        };

        let result = PollerGroup::spawn(
            1,
            store,
            processor,
            Arc::new(SystemClock) as Arc<dyn Clock>,
            Arc::new(config),
        );
        assert!(matches!(result, Err(ConveyorError::InvalidConfig(_))));
    }
}
