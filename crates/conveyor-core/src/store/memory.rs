//! In-memory store implementation.
//!
//! Backs tests and the demo binary. Same contract as the Redis adapter, with
//! one refinement: scheduled entries carry a monotone sequence number, so
//! items with equal scores are claimed in insertion order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{InFlightClaim, Payload, WorkerId};
use crate::error::ConveyorError;
use crate::observability::StoreCounts;
use crate::ports::store::{LeaseTracker, OrderedStore, StoreAck};

/// Scheduled-side metadata for one payload.
#[derive(Debug, Clone)]
struct ScheduledEntry {
    ready_at: DateTime<Utc>,
    seq: u64,
    claim_count: u32,
}

/// Claim-order key. Derived `Ord` gives score order first, then insertion
/// order, then payload bytes (unreachable: seq is unique).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    ready_at: DateTime<Utc>,
    seq: u64,
    payload: Payload,
}

#[derive(Default)]
struct MemoryState {
    /// Scheduled metadata, keyed by payload (single source of truth).
    scheduled: HashMap<Payload, ScheduledEntry>,

    /// Claim order over the scheduled set.
    order: BTreeSet<OrderKey>,

    /// In-flight claims, keyed by payload.
    in_flight: HashMap<Payload, InFlightClaim>,

    /// Next insertion sequence number.
    next_seq: u64,
}

impl MemoryState {
    fn remove_scheduled(&mut self, payload: &Payload) -> Option<ScheduledEntry> {
        let entry = self.scheduled.remove(payload)?;
        self.order.remove(&OrderKey {
            ready_at: entry.ready_at,
            seq: entry.seq,
            payload: payload.clone(),
        });
        Some(entry)
    }

    fn insert_scheduled(&mut self, payload: Payload, ready_at: DateTime<Utc>, claim_count: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(OrderKey {
            ready_at,
            seq,
            payload: payload.clone(),
        });
        self.scheduled.insert(
            payload,
            ScheduledEntry {
                ready_at,
                seq,
                claim_count,
            },
        );
    }

    /// Move one in-flight claim back to the scheduled set.
    fn restore(
        &mut self,
        payload: &Payload,
        ready_at: DateTime<Utc>,
        bump_count: bool,
    ) -> StoreAck {
        let Some(claim) = self.in_flight.remove(payload) else {
            return StoreAck::NotFound;
        };
        let count = if bump_count {
            claim.claim_count + 1
        } else {
            claim.claim_count
        };
        self.insert_scheduled(payload.clone(), ready_at, count);
        StoreAck::Applied
    }
}

/// In-memory implementation of both store ports.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn enqueue(
        &self,
        payload: Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<(), ConveyorError> {
        let mut state = self.state.lock().await;

        if state.in_flight.contains_key(&payload) {
            return Err(ConveyorError::AlreadyInFlight);
        }

        // Re-enqueue of a scheduled payload is a rescore; claim_count is
        // metadata about the item's history and survives it.
        let claim_count = state
            .remove_scheduled(&payload)
            .map(|entry| entry.claim_count)
            .unwrap_or(0);
        state.insert_scheduled(payload, ready_at, claim_count);
        Ok(())
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
        owner: &WorkerId,
    ) -> Result<Vec<InFlightClaim>, ConveyorError> {
        let mut state = self.state.lock().await;
        let mut claims = Vec::new();

        while claims.len() < limit {
            let Some(key) = state.order.iter().next().cloned() else {
                break;
            };
            if key.ready_at > now {
                // Order is sorted, nothing further is ready.
                break;
            }

            let entry = state
                .remove_scheduled(&key.payload)
                .expect("order key without scheduled entry");
            let claim = InFlightClaim {
                payload: key.payload.clone(),
                owner: *owner,
                lease_expires_at: now + lease,
                claim_count: entry.claim_count,
            };
            state.in_flight.insert(key.payload, claim.clone());
            claims.push(claim);
        }

        Ok(claims)
    }

    async fn acknowledge(&self, payload: &Payload) -> Result<StoreAck, ConveyorError> {
        let mut state = self.state.lock().await;
        Ok(match state.in_flight.remove(payload) {
            Some(_) => StoreAck::Applied,
            None => StoreAck::NotFound,
        })
    }

    async fn requeue(
        &self,
        payload: &Payload,
        new_ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError> {
        let mut state = self.state.lock().await;
        Ok(state.restore(payload, new_ready_at, false))
    }

    async fn counts(&self) -> Result<StoreCounts, ConveyorError> {
        let state = self.state.lock().await;
        Ok(StoreCounts {
            scheduled: state.scheduled.len(),
            in_flight: state.in_flight.len(),
        })
    }
}

#[async_trait]
impl LeaseTracker for MemoryStore {
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InFlightClaim>, ConveyorError> {
        let state = self.state.lock().await;
        let mut expired: Vec<InFlightClaim> = state
            .in_flight
            .values()
            .filter(|claim| claim.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|claim| claim.lease_expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn extend(
        &self,
        payload: &Payload,
        additional: Duration,
    ) -> Result<StoreAck, ConveyorError> {
        let mut state = self.state.lock().await;
        Ok(match state.in_flight.get_mut(payload) {
            Some(claim) => {
                claim.lease_expires_at = claim.lease_expires_at + additional;
                StoreAck::Applied
            }
            None => StoreAck::NotFound,
        })
    }

    async fn reclaim(
        &self,
        payload: &Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError> {
        let mut state = self.state.lock().await;
        Ok(state.restore(payload, ready_at, true))
    }
}
