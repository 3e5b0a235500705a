//! SQLite-backed key-value cache with TTL expiry and LRU eviction.
//!
//! This module provides an embedded cache on a single SQLite file with async
//! access via tokio-rusqlite. It supports:
//!
//! - Upserts, conditional inserts and atomic counters keyed by string id
//! - Lazy expiry on read plus a background expiry sweep
//! - Approximate LRU eviction from batched, deferred recency updates
//! - Recovery from a full store by evicting the least recently used rows
//! - A bounded connection pool as the single serialization point

pub mod connection;
pub mod engine;
pub mod maintenance;
pub mod migrations;
pub mod pool;
pub mod retry;
pub mod statements;
pub mod stats;
pub mod value;

pub use crate::Error;

pub use engine::{Cache, CacheSnapshot, PruneLimit};
pub use retry::RetryPolicy;
pub use stats::CacheStats;
pub use value::{Cached, Entry, Value};
