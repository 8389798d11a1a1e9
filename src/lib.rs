//! Asynchronous volunteer sign-up request pipeline.
//!
//! Submissions are enqueued as commands on a message broker and applied by
//! idempotent consumers. Failed deliveries escalate through TTL retry tiers
//! before landing in a terminal dead-letter queue; every committed change
//! evicts the read-through cache entries it makes stale.

pub mod application;
pub mod broker;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
