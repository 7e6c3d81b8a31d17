//! Store ports: the capability this crate consumes from the backing store.
//!
//! Every mutating operation is a single atomic transaction against the store;
//! no partial application is observable by other callers. A payload is in
//! exactly one of {scheduled, in-flight} at any observable instant, never in
//! both and never in neither, from enqueue until final acknowledgment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::domain::{InFlightClaim, Payload, WorkerId};
use crate::error::ConveyorError;
use crate::observability::StoreCounts;

/// Result of an acknowledge/requeue/extend style operation.
///
/// `NotFound` is benign: it means another worker settled the claim first
/// (usually the recovery sweeper after a lease expiry). The loser of that
/// race must not treat it as an error, and no state was changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    Applied,
    NotFound,
}

impl StoreAck {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// The ordered-score store: scheduled items keyed by payload, scored by
/// `ready_at`. This trait is the seam for swapping implementations; the
/// in-memory store backs tests and the Redis store backs production.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// Insert a payload into the scheduled set, scored by `ready_at`.
    ///
    /// Re-enqueueing an already-scheduled payload updates its score (plain
    /// sorted-set semantics). Enqueueing a payload that is currently in
    /// flight fails with `AlreadyInFlight`.
    async fn enqueue(
        &self,
        payload: Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<(), ConveyorError>;

    /// Atomically select up to `limit` items with `ready_at <= now`, move
    /// them to the in-flight set with `lease_expires_at = now + lease`, and
    /// return the resulting claims.
    ///
    /// Lowest score first; ordering among equal scores follows the backing
    /// store's member order (insertion order in memory, member bytes in
    /// Redis). An empty result is normal, not an error. Two concurrent
    /// callers never receive the same payload from one ready set.
    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
        owner: &WorkerId,
    ) -> Result<Vec<InFlightClaim>, ConveyorError>;

    /// Remove the in-flight claim for `payload`. Idempotent: acknowledging an
    /// item already reclaimed by the sweeper returns `NotFound`.
    async fn acknowledge(&self, payload: &Payload) -> Result<StoreAck, ConveyorError>;

    /// Atomically move `payload` from in-flight back to scheduled with the
    /// given score. `claim_count` is carried over unchanged; this is the path
    /// for recoverable failures and "not yet ready" deferrals.
    async fn requeue(
        &self,
        payload: &Payload,
        new_ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError>;

    /// Observability hook.
    async fn counts(&self) -> Result<StoreCounts, ConveyorError>;
}

/// The lease-tracking view over the in-flight set.
///
/// Usually the same physical structure as [`OrderedStore`]'s in-flight side,
/// exposed separately for the recovery sweeper's read pattern.
#[async_trait]
pub trait LeaseTracker: Send + Sync {
    /// Claims whose `lease_expires_at < now`, oldest expiry first, at most
    /// `limit` per call. Callers page through repeated calls; reclaiming
    /// between calls keeps the scan finite.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InFlightClaim>, ConveyorError>;

    /// Push `lease_expires_at` out by `additional` for a long-running item.
    /// Does not touch `claim_count`.
    async fn extend(
        &self,
        payload: &Payload,
        additional: Duration,
    ) -> Result<StoreAck, ConveyorError>;

    /// The expiry path: atomically move `payload` from in-flight back to
    /// scheduled with the given score and increment `claim_count` as part of
    /// the same move.
    async fn reclaim(
        &self,
        payload: &Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError>;
}
