//! Redis integration tests.
//!
//! These talk to a live server and are skipped unless `REDIS_URL` is set,
//! e.g. `REDIS_URL=redis://127.0.0.1:6379 cargo test --test it_redis`.
//! Each test works under its own base key and clears it on entry, so runs
//! are independent and repeatable.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use ulid::Ulid;

use conveyor_core::domain::{Payload, WorkerId};
use conveyor_core::ports::store::{LeaseTracker, OrderedStore, StoreAck};
use conveyor_core::store::RedisStore;

const LEASE: Duration = Duration::from_secs(30);

async fn test_store(label: &str) -> Option<RedisStore> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("skipping {label}: REDIS_URL not set");
        return None;
    };
    let store = RedisStore::connect(&url, &format!("conveyor-test:{}", Ulid::new())).unwrap();
    store.clear().await.unwrap();
    Some(store)
}

#[tokio::test]
async fn claim_is_invisible_until_ready_and_exclusive_after() {
    let Some(store) = test_store("claim_is_invisible_until_ready_and_exclusive_after").await
    else {
        return;
    };
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let worker = WorkerId::generate();
    let p = Payload::from("p");

    store.enqueue(p.clone(), t0).await.unwrap();

    let early = store
        .claim_ready(t0 - chrono::Duration::seconds(1), 10, LEASE, &worker)
        .await
        .unwrap();
    assert!(early.is_empty());

    let claims = store.claim_ready(t0, 10, LEASE, &worker).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].payload, p);
    assert_eq!(claims[0].claim_count, 0);

    // Claimed means gone from the scheduled side.
    let again = store.claim_ready(t0, 10, LEASE, &worker).await.unwrap();
    assert!(again.is_empty());

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.in_flight, 1);

    store.clear().await.unwrap();
}

#[tokio::test]
async fn acknowledge_and_requeue_are_idempotent() {
    let Some(store) = test_store("acknowledge_and_requeue_are_idempotent").await else {
        return;
    };
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let worker = WorkerId::generate();
    let p = Payload::from("p");

    store.enqueue(p.clone(), t0).await.unwrap();
    store.claim_ready(t0, 1, LEASE, &worker).await.unwrap();

    assert_eq!(store.acknowledge(&p).await.unwrap(), StoreAck::Applied);
    assert_eq!(store.acknowledge(&p).await.unwrap(), StoreAck::NotFound);
    assert_eq!(store.requeue(&p, t0).await.unwrap(), StoreAck::NotFound);

    assert!(store.counts().await.unwrap().is_drained());
    store.clear().await.unwrap();
}

#[tokio::test]
async fn expiry_reclaim_increments_claim_count() {
    let Some(store) = test_store("expiry_reclaim_increments_claim_count").await else {
        return;
    };
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let worker = WorkerId::generate();
    let p = Payload::from("p");

    store.enqueue(p.clone(), t0).await.unwrap();
    store.claim_ready(t0, 1, LEASE, &worker).await.unwrap();

    // The lease runs to t0+30s; strictly after that it is expired.
    let at_expiry = t0 + chrono::Duration::seconds(30);
    assert!(store.list_expired(at_expiry, 10).await.unwrap().is_empty());

    let past_expiry = t0 + chrono::Duration::seconds(31);
    let expired = store.list_expired(past_expiry, 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].payload, p);
    assert_eq!(expired[0].owner, worker);
    assert_eq!(expired[0].claim_count, 0);

    assert_eq!(
        store.reclaim(&p, past_expiry).await.unwrap(),
        StoreAck::Applied
    );

    let claims = store
        .claim_ready(past_expiry, 1, LEASE, &worker)
        .await
        .unwrap();
    assert_eq!(claims[0].claim_count, 1);

    store.clear().await.unwrap();
}

#[tokio::test]
async fn extend_pushes_the_lease_out() {
    let Some(store) = test_store("extend_pushes_the_lease_out").await else {
        return;
    };
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let worker = WorkerId::generate();
    let p = Payload::from("p");

    store.enqueue(p.clone(), t0).await.unwrap();
    store.claim_ready(t0, 1, LEASE, &worker).await.unwrap();

    assert_eq!(
        store.extend(&p, Duration::from_secs(30)).await.unwrap(),
        StoreAck::Applied
    );

    let after_original_lease = t0 + chrono::Duration::seconds(31);
    assert!(store
        .list_expired(after_original_lease, 10)
        .await
        .unwrap()
        .is_empty());

    let after_extension = t0 + chrono::Duration::seconds(61);
    assert_eq!(store.list_expired(after_extension, 10).await.unwrap().len(), 1);

    assert_eq!(
        store
            .extend(&Payload::from("ghost"), Duration::from_secs(1))
            .await
            .unwrap(),
        StoreAck::NotFound
    );

    store.clear().await.unwrap();
}

#[tokio::test]
async fn enqueue_while_in_flight_is_rejected() {
    let Some(store) = test_store("enqueue_while_in_flight_is_rejected").await else {
        return;
    };
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let worker = WorkerId::generate();
    let p = Payload::from("p");

    store.enqueue(p.clone(), t0).await.unwrap();
    store.claim_ready(t0, 1, LEASE, &worker).await.unwrap();

    let err = store.enqueue(p.clone(), t0).await.unwrap_err();
    assert!(matches!(
        err,
        conveyor_core::error::ConveyorError::AlreadyInFlight
    ));

    store.clear().await.unwrap();
}
