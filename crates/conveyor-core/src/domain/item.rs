//! Item model: payloads, worker identity, and the two places a payload can live.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ulid::Ulid;

/// Opaque payload bytes.
///
/// The payload doubles as the item's identity: it is the sorted-set member in
/// the backing store, so two items with equal bytes are the same item.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl fmt::Debug for Payload {
    /// Render a short lossy-UTF-8 preview; payloads can be large or binary.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 32;
        let text = String::from_utf8_lossy(&self.0);
        if text.chars().count() <= PREVIEW {
            write!(f, "Payload({text:?})")
        } else {
            let head: String = text.chars().take(PREVIEW).collect();
            write!(f, "Payload({head:?}.., {} bytes)", self.0.len())
        }
    }
}

/// Identity of a poller instance.
///
/// ULID-backed: sortable by creation time and generatable on any node without
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Parse the `Display` form back into an id.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        let raw = s.strip_prefix("worker-").unwrap_or(s);
        Ok(Self(Ulid::from_string(raw)?))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// An item waiting in the scheduled set, scored by `ready_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledItem {
    pub payload: Payload,
    pub ready_at: DateTime<Utc>,
}

/// An item that has been claimed and moved to the in-flight set.
///
/// Created atomically when an item is claimed; destroyed on acknowledgment;
/// moved back to the scheduled set (with `claim_count` incremented) when the
/// lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightClaim {
    pub payload: Payload,
    pub owner: WorkerId,
    pub lease_expires_at: DateTime<Utc>,

    /// How many times this item has been reclaimed after a lease expiry.
    /// Only ever increases; the handle for capping retries of stuck items.
    pub claim_count: u32,
}

impl InFlightClaim {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_identity_is_byte_equality() {
        let a = Payload::from("job-1");
        let b = Payload::new(b"job-1".to_vec());
        let c = Payload::from("job-2");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn payload_debug_truncates_long_content() {
        let long = Payload::new(vec![b'x'; 100]);
        let rendered = format!("{long:?}");
        assert!(rendered.contains("100 bytes"));
        assert!(rendered.len() < 100);
    }

    #[test]
    fn worker_id_roundtrips_through_display() {
        let id = WorkerId::generate();
        let parsed = WorkerId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("worker-"));
    }

    #[test]
    fn claim_expiry_is_strict() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let claim = InFlightClaim {
            payload: Payload::from("p"),
            owner: WorkerId::generate(),
            lease_expires_at: t,
            claim_count: 0,
        };

        assert!(!claim.is_expired(t));
        assert!(claim.is_expired(t + chrono::Duration::milliseconds(1)));
    }
}
