//! conveyor-core
//!
//! At-least-once delivery for time-scheduled work items over a shared
//! ordered-score store.
//!
//! # Module map
//! - **domain**: payloads, claims, processing outcomes
//! - **ports**: trait seams (`OrderedStore`, `LeaseTracker`, `Processor`, `Clock`)
//! - **store**: in-memory and Redis implementations of the store ports
//! - **poller**: the claim/dispatch/settle loop
//! - **sweeper**: expired-lease recovery
//! - **group**: pollers + sweeper under one shutdown channel
//! - **backoff**, **config**, **error**, **observability**: supporting pieces
//!
//! # Delivery contract
//! An enqueued payload lives in exactly one of the scheduled set or the
//! in-flight set until it is acknowledged or handed to the dead-letter hook.
//! Claims are leases: if a worker dies mid-processing, the recovery sweeper
//! returns the item to the schedule once the lease expires. Processing may
//! therefore happen more than once; it never silently happens zero times.

pub mod backoff;
pub mod config;
pub mod domain;
pub mod error;
pub mod group;
pub mod observability;
pub mod poller;
pub mod ports;
pub mod store;
pub mod sweeper;
