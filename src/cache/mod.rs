//! Read-through cache for the read side of the request pipeline.
//!
//! Entries are keyed by semantic query signature (`namespace:key`) and expire
//! after a per-namespace TTL. Every write path evicts the entries its
//! mutation makes stale through [`CacheEvictor`].

mod config;
mod events;
mod evictor;
mod keys;
mod planner;
mod read_through;
mod store;

pub use config::CacheConfig;
pub use events::Mutation;
pub use evictor::CacheEvictor;
pub use keys::{CacheKey, Namespace};
pub use planner::EvictionPlan;
pub use read_through::ReadThroughCache;
pub use store::{CacheError, CacheStore, MemoryCacheStore};
