//! Embedded key-value cache on top of SQLite.
//!
//! This crate provides:
//! - The cache engine with TTL expiry and LRU eviction
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{Cache, CacheStats, Cached, Entry, PruneLimit, Value};
pub use config::CacheConfig;
pub use error::Error;
