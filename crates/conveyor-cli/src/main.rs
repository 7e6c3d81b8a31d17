//! End-to-end demo against the in-memory store: enqueue a few greetings,
//! let two pollers and the recovery sweeper drain them, then shut down.
//!
//! `RUST_LOG=debug cargo run -p conveyor-cli` shows the full claim/settle
//! traffic, including the intentional retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use conveyor_core::backoff::BackoffPolicy;
use conveyor_core::config::Config;
use conveyor_core::domain::{InFlightClaim, Payload, ProcessOutcome};
use conveyor_core::group::PollerGroup;
use conveyor_core::ports::store::OrderedStore;
use conveyor_core::ports::{Clock, Processor, SystemClock};
use conveyor_core::store::MemoryStore;

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

struct GreetingProcessor {
    remaining_failures: AtomicU32,
}

impl GreetingProcessor {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Processor for GreetingProcessor {
    async fn process(&self, payload: &Payload) -> ProcessOutcome {
        let greeting: Greeting = match serde_json::from_slice(payload.as_bytes()) {
            Ok(g) => g,
            Err(e) => return ProcessOutcome::fatal(format!("json decode: {e}")),
        };

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return ProcessOutcome::retry_after(
                format!("intentional failure (left={left})"),
                Duration::from_millis(150),
            );
        }

        info!(name = %greeting.name, "hello");
        ProcessOutcome::Success
    }

    async fn on_poison(&self, claim: &InFlightClaim) {
        error!(payload = ?claim.payload, claim_count = claim.claim_count, "dead-lettered");
    }
}

fn greeting(name: &str) -> Payload {
    Payload::new(serde_json::to_vec(&serde_json::json!({ "name": name })).expect("serializable"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // (A) store, processor, and a config tuned for a quick demo
    let store = Arc::new(MemoryStore::new());
    let processor = Arc::new(GreetingProcessor::new(2));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = Arc::new(Config {
        poll_interval: Duration::from_millis(100),
        lease_duration: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(500),
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            ..BackoffPolicy::default()
        },
        ..Config::default()
    });

    // (B) two pollers plus the recovery sweeper
    let group = PollerGroup::spawn(
        2,
        Arc::clone(&store),
        processor,
        Arc::clone(&clock),
        config,
    )
    .expect("valid config");

    // (C) enqueue work: one ready now, one half a second out; the handler
    //     fails twice on purpose so the retry path shows up in the logs
    let now = clock.now();
    store.enqueue(greeting("world"), now).await.unwrap();
    store.enqueue(greeting("again"), now).await.unwrap();
    store
        .enqueue(greeting("later"), now + Duration::from_millis(500))
        .await
        .unwrap();
    group.wake();

    // (D) wait for the drain
    loop {
        let counts = store.counts().await.unwrap();
        if counts.is_drained() {
            break;
        }
        info!(scheduled = counts.scheduled, in_flight = counts.in_flight, "draining");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // (E) orderly stop: in-flight work settles before the tasks exit
    group.shutdown_and_join().await;
    info!("demo complete");
}
