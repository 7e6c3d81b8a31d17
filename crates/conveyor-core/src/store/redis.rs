//! Redis sorted-set store (single version of `redis` via deadpool-redis).
//!
//! Keyspace, given a base key `jobs`:
//! - `jobs:scheduled` - zset, member = payload, score = ready_at (unix ms)
//! - `jobs:inflight`  - zset, member = payload, score = lease expiry (unix ms)
//! - `jobs:claims`    - hash, member -> claim_count
//! - `jobs:owners`    - hash, member -> worker id
//!
//! Every mutating operation is one Lua script, so each state transition is a
//! single atomic step on the server and no partial move is ever observable.
//! Redis errors are mapped to `StoreUnavailable` at this boundary; the redis
//! crate's types do not leak out of this module.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, Script};
use deadpool_redis::{Config, Pool, Runtime};

use crate::domain::{InFlightClaim, Payload, WorkerId};
use crate::error::ConveyorError;
use crate::observability::StoreCounts;
use crate::ports::store::{LeaseTracker, OrderedStore, StoreAck};

/// Claim: move ready members to the in-flight zset, stamp lease and owner,
/// and return (member, claim_count) pairs as a flat array.
const CLAIM_SCRIPT: &str = r#"
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for _, member in ipairs(ready) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('ZADD', KEYS[2], ARGV[3], member)
    redis.call('HSET', KEYS[4], member, ARGV[4])
    local count = redis.call('HGET', KEYS[3], member)
    if not count then
        count = '0'
        redis.call('HSET', KEYS[3], member, count)
    end
    out[#out + 1] = member
    out[#out + 1] = count
end
return out
"#;

const ACKNOWLEDGE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

/// Requeue: back to the scheduled zset, claim_count untouched.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Reclaim: the expiry path; same move as requeue plus the count increment,
/// in the same atomic step.
const RECLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HINCRBY', KEYS[4], ARGV[1], 1)
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
    return 0
end
redis.call('ZADD', KEYS[1], score + ARGV[2], ARGV[1])
return 1
"#;

/// Enqueue: reject members currently in flight, otherwise upsert the score.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[2], ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

/// List expired: strictly-before-now range over the in-flight zset, joined
/// with count and owner metadata, as a flat (member, expiry, count, owner)
/// array.
const LIST_EXPIRED_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'WITHSCORES', 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for i = 1, #expired, 2 do
    local member = expired[i]
    out[#out + 1] = member
    out[#out + 1] = expired[i + 1]
    out[#out + 1] = redis.call('HGET', KEYS[2], member) or '0'
    out[#out + 1] = redis.call('HGET', KEYS[3], member) or ''
end
return out
"#;

struct Keys {
    scheduled: String,
    in_flight: String,
    claims: String,
    owners: String,
}

impl Keys {
    fn new(base: &str) -> Self {
        Self {
            scheduled: format!("{base}:scheduled"),
            in_flight: format!("{base}:inflight"),
            claims: format!("{base}:claims"),
            owners: format!("{base}:owners"),
        }
    }
}

struct Scripts {
    claim: Script,
    acknowledge: Script,
    requeue: Script,
    reclaim: Script,
    extend: Script,
    enqueue: Script,
    list_expired: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            acknowledge: Script::new(ACKNOWLEDGE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            enqueue: Script::new(ENQUEUE_SCRIPT),
            list_expired: Script::new(LIST_EXPIRED_SCRIPT),
        }
    }
}

/// Store implementation over a Redis-style sorted set.
pub struct RedisStore {
    pool: Pool,
    keys: Keys,
    scripts: Scripts,
}

impl RedisStore {
    /// Create a pooled store for `base_key` from a connection URL.
    pub fn connect(url: &str, base_key: &str) -> Result<Self, ConveyorError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::with_pool(pool, base_key))
    }

    pub fn with_pool(pool: Pool, base_key: &str) -> Self {
        Self {
            pool,
            keys: Keys::new(base_key),
            scripts: Scripts::new(),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, ConveyorError> {
        self.pool
            .get()
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))
    }

    /// Drop everything under the base key. Destructive; meant for tests and
    /// operator resets.
    pub async fn clear(&self) -> Result<(), ConveyorError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(&self.keys.scheduled)
            .arg(&self.keys.in_flight)
            .arg(&self.keys.claims)
            .arg(&self.keys.owners)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn ack_from(applied: i64) -> StoreAck {
        if applied == 1 {
            StoreAck::Applied
        } else {
            StoreAck::NotFound
        }
    }
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, ConveyorError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ConveyorError::Malformed(format!("timestamp out of range: {ms}")))
}

fn parse_count(raw: &[u8]) -> Result<u32, ConveyorError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ConveyorError::Malformed(format!("claim count is not a u32: {:?}", raw))
        })
}

fn parse_score_millis(raw: &[u8]) -> Result<i64, ConveyorError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|f| f as i64)
        .ok_or_else(|| ConveyorError::Malformed(format!("score is not numeric: {:?}", raw)))
}

#[async_trait]
impl OrderedStore for RedisStore {
    async fn enqueue(
        &self,
        payload: Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<(), ConveyorError> {
        let mut conn = self.conn().await?;
        let accepted: i64 = self
            .scripts
            .enqueue
            .key(&self.keys.scheduled)
            .key(&self.keys.in_flight)
            .arg(millis(ready_at))
            .arg(payload.as_bytes())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;

        if accepted == 1 {
            Ok(())
        } else {
            Err(ConveyorError::AlreadyInFlight)
        }
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
        owner: &WorkerId,
    ) -> Result<Vec<InFlightClaim>, ConveyorError> {
        let lease_expires_at = now + lease;
        let mut conn = self.conn().await?;
        let raw: Vec<Vec<u8>> = self
            .scripts
            .claim
            .key(&self.keys.scheduled)
            .key(&self.keys.in_flight)
            .key(&self.keys.claims)
            .key(&self.keys.owners)
            .arg(millis(now))
            .arg(limit)
            .arg(millis(lease_expires_at))
            .arg(owner.to_string())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;

        let mut claims = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            claims.push(InFlightClaim {
                payload: Payload::new(pair[0].clone()),
                owner: *owner,
                lease_expires_at,
                claim_count: parse_count(&pair[1])?,
            });
        }
        Ok(claims)
    }

    async fn acknowledge(&self, payload: &Payload) -> Result<StoreAck, ConveyorError> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .scripts
            .acknowledge
            .key(&self.keys.in_flight)
            .key(&self.keys.claims)
            .key(&self.keys.owners)
            .arg(payload.as_bytes())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::ack_from(applied))
    }

    async fn requeue(
        &self,
        payload: &Payload,
        new_ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .scripts
            .requeue
            .key(&self.keys.in_flight)
            .key(&self.keys.scheduled)
            .key(&self.keys.owners)
            .arg(payload.as_bytes())
            .arg(millis(new_ready_at))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::ack_from(applied))
    }

    async fn counts(&self) -> Result<StoreCounts, ConveyorError> {
        let mut conn = self.conn().await?;
        let scheduled: i64 = redis::cmd("ZCARD")
            .arg(&self.keys.scheduled)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        let in_flight: i64 = redis::cmd("ZCARD")
            .arg(&self.keys.in_flight)
            .query_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(StoreCounts {
            scheduled: scheduled as usize,
            in_flight: in_flight as usize,
        })
    }
}

#[async_trait]
impl LeaseTracker for RedisStore {
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InFlightClaim>, ConveyorError> {
        let mut conn = self.conn().await?;
        let raw: Vec<Vec<u8>> = self
            .scripts
            .list_expired
            .key(&self.keys.in_flight)
            .key(&self.keys.claims)
            .key(&self.keys.owners)
            .arg(millis(now))
            .arg(limit)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;

        let mut claims = Vec::with_capacity(raw.len() / 4);
        for entry in raw.chunks_exact(4) {
            let owner_raw = String::from_utf8_lossy(&entry[3]);
            let owner = WorkerId::parse(&owner_raw).map_err(|_| {
                ConveyorError::Malformed(format!("bad owner for in-flight member: {owner_raw:?}"))
            })?;
            claims.push(InFlightClaim {
                payload: Payload::new(entry[0].clone()),
                owner,
                lease_expires_at: from_millis(parse_score_millis(&entry[1])?)?,
                claim_count: parse_count(&entry[2])?,
            });
        }
        Ok(claims)
    }

    async fn extend(
        &self,
        payload: &Payload,
        additional: Duration,
    ) -> Result<StoreAck, ConveyorError> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .scripts
            .extend
            .key(&self.keys.in_flight)
            .arg(payload.as_bytes())
            .arg(additional.as_millis() as i64)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::ack_from(applied))
    }

    async fn reclaim(
        &self,
        payload: &Payload,
        ready_at: DateTime<Utc>,
    ) -> Result<StoreAck, ConveyorError> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .scripts
            .reclaim
            .key(&self.keys.in_flight)
            .key(&self.keys.scheduled)
            .key(&self.keys.owners)
            .key(&self.keys.claims)
            .arg(payload.as_bytes())
            .arg(millis(ready_at))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| ConveyorError::StoreUnavailable(e.to_string()))?;
        Ok(Self::ack_from(applied))
    }
}
