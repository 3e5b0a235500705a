//! The public cache API.
//!
//! Every operation checks a handle out of the pool, runs one statement (or one
//! short immediate transaction), and returns the handle. Writes go through
//! the storage-exhaustion recovery in [`super::retry`]; reads only retry on
//! lock contention. Reads never write: recency updates are queued for the
//! maintenance worker.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_rusqlite::rusqlite;

use super::maintenance::{Maintenance, PendingTouches, Worker};
use super::pool::Pool;
use super::retry::RetryPolicy;
use super::stats::{CacheStats, Counters};
use super::statements;
use super::value::{Cached, Entry, Value};
use crate::Error;
use crate::config::CacheConfig;

/// How many rows [`Cache::prune`] removes beyond the expired ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PruneLimit {
    /// Remove exactly this many rows, least recently used first.
    Count(u64),
    /// Remove this share (0, 1] of all rows, least recently used first.
    Fraction(f64),
}

/// Serializable summary of a cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub path: PathBuf,
    pub entries: u64,
    pub size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Embedded key-value cache backed by a single SQLite file.
///
/// Cheap to clone; all clones share the pool, the counters and the
/// maintenance worker. The worker stops on [`Cache::close`] or when the last
/// clone is dropped.
#[derive(Clone, Debug)]
pub struct Cache {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: CacheConfig,
    pool: Arc<Pool>,
    touches: Arc<PendingTouches>,
    counters: Counters,
    policy: RetryPolicy,
    maintenance: Mutex<Option<Maintenance>>,
    closed: AtomicBool,
    shutdown: OnceCell<()>,
}

impl Cache {
    /// Open (or create) the store described by `config` and start maintenance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration and
    /// `Error::Database` if the store cannot be opened.
    pub async fn open(config: CacheConfig) -> Result<Self, Error> {
        config.validate()?;

        let pool = Arc::new(Pool::open(&config).await?);
        let touches = Arc::new(PendingTouches::default());
        let policy = RetryPolicy::from_config(&config);

        let worker = Worker { pool: pool.clone(), touches: touches.clone(), policy: policy.clone() };
        let maintenance = Maintenance::spawn(worker, config.maintenance_interval());

        tracing::info!(
            path = %config.path.display(),
            pool_size = pool.size(),
            max_size = config.max_size_bytes,
            "cache opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                touches,
                counters: Counters::default(),
                policy,
                maintenance: Mutex::new(Some(maintenance)),
                closed: AtomicBool::new(false),
                shutdown: OnceCell::new(),
            }),
        })
    }

    /// Open a private in-memory cache with default settings.
    pub async fn open_in_memory() -> Result<Self, Error> {
        Self::open(CacheConfig::in_memory()).await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Store `value` under `key`, replacing any existing entry.
    ///
    /// `ttl` of `None` or zero uses the configured default.
    pub async fn set(&self, key: &str, value: impl Into<Value>, ttl: Option<Duration>) -> Result<bool, Error> {
        let key = key.to_string();
        let value = value.into();
        let ttl = self.ttl_secs(ttl);

        self.write(move |conn| {
            let now = statements::now();
            statements::set(conn, &key, &value, now + ttl, now)
        })
        .await?;
        Ok(true)
    }

    /// Store `value` only if `key` is absent or expired.
    ///
    /// Returns whether the value was written.
    pub async fn set_unless_exists(
        &self, key: &str, value: impl Into<Value>, ttl: Option<Duration>,
    ) -> Result<bool, Error> {
        let key = key.to_string();
        let value = value.into();
        let ttl = self.ttl_secs(ttl);

        self.write(move |conn| {
            let tx = statements::immediate(conn)?;
            let now = statements::now();
            let written = statements::insert(&tx, &key, &value, now + ttl, now)?;
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// Store many entries in one transaction with a shared TTL.
    pub async fn set_multi<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>, ttl: Option<Duration>) -> Result<(), Error>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let pairs: Vec<(String, Value)> = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let ttl = self.ttl_secs(ttl);

        self.write(move |conn| {
            let tx = statements::immediate(conn)?;
            let now = statements::now();
            for (key, value) in &pairs {
                statements::set(&tx, key, value, now + ttl, now)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Payload stored under `key`, or `None` when absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Full row stored under `key`, or `None` when absent or expired.
    pub async fn get_entry(&self, key: &str) -> Result<Option<Entry>, Error> {
        let lookup_key = key.to_string();
        let entry = self
            .read(move |conn| statements::get(conn, &lookup_key, statements::now()))
            .await?;
        self.record_read(key, entry.is_some());
        Ok(entry)
    }

    /// Read shaped by the `return_full_record` setting.
    pub async fn lookup(&self, key: &str) -> Result<Option<Cached>, Error> {
        let entry = self.get_entry(key).await?;
        Ok(entry.map(|entry| {
            if self.inner.config.return_full_record { Cached::Entry(entry) } else { Cached::Value(entry.value) }
        }))
    }

    /// Payloads for `keys` that are present and live, under one pool checkout.
    pub async fn get_multi<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<(String, Value)>, Error> {
        let lookup: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let found = self
            .read(move |conn| {
                let now = statements::now();
                let mut found = Vec::new();
                for key in &lookup {
                    if let Some(entry) = statements::get(conn, key, now)? {
                        found.push((entry.id, entry.value));
                    }
                }
                Ok(found)
            })
            .await?;

        for key in keys {
            let key = key.as_ref();
            self.record_read(key, found.iter().any(|(id, _)| id == key));
        }
        Ok(found)
    }

    /// Remove `key`. Returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.write(move |conn| statements::delete(conn, &key, statements::now())).await
    }

    /// Add `amount` to the integer stored under `key`, creating it at `amount`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotNumeric` if the live payload is not an integer.
    pub async fn increment(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64, Error> {
        let key = key.to_string();
        let ttl = self.ttl_secs(ttl);

        self.write(move |conn| {
            let tx = statements::immediate(conn)?;
            let now = statements::now();
            let value = statements::increment(&tx, &key, amount, now + ttl, now)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    pub async fn decrement(&self, key: &str, amount: i64, ttl: Option<Duration>) -> Result<i64, Error> {
        let amount = amount
            .checked_neg()
            .ok_or_else(|| Error::InvalidInput(format!("cannot negate {amount}")))?;
        self.increment(key, amount, ttl).await
    }

    /// Evict rows and return how many were removed.
    ///
    /// `None` removes every expired row; a limit removes rows by ascending
    /// `last_used` regardless of expiry.
    pub async fn prune(&self, limit: Option<PruneLimit>) -> Result<u64, Error> {
        if let Some(PruneLimit::Fraction(fraction)) = limit {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(Error::InvalidInput(format!("prune fraction {fraction} is outside (0, 1]")));
            }
        }

        let deleted = self
            .write(move |conn| match limit {
                None => statements::prune_expired(conn, statements::now()),
                Some(PruneLimit::Count(n)) => statements::prune_oldest(conn, n),
                Some(PruneLimit::Fraction(f)) => statements::prune_fraction(conn, f),
            })
            .await?;

        tracing::debug!(deleted, ?limit, "pruned cache");
        Ok(deleted)
    }

    /// Number of stored rows, including expired rows not yet swept.
    pub async fn count(&self) -> Result<u64, Error> {
        self.read(|conn| statements::count(conn)).await
    }

    /// Current size of the store in bytes.
    pub async fn size(&self) -> Result<u64, Error> {
        self.read(|conn| statements::size(conn)).await
    }

    /// Configured size ceiling in bytes.
    pub fn max_size(&self) -> u64 {
        self.inner.config.max_size_bytes
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<(), Error> {
        let deleted = self.write(|conn| statements::clear(conn)).await?;
        tracing::debug!(deleted, "cleared cache");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    pub async fn snapshot(&self) -> Result<CacheSnapshot, Error> {
        let (entries, size) = self
            .read(|conn| Ok((statements::count(conn)?, statements::size(conn)?)))
            .await?;
        let stats = self.stats();
        Ok(CacheSnapshot {
            path: self.inner.config.path.clone(),
            entries,
            size,
            max_size: self.max_size(),
            hits: stats.hits,
            misses: stats.misses,
        })
    }

    /// Stop the maintenance worker and release the store.
    ///
    /// Operations already waiting for a handle are allowed to finish; later
    /// ones fail with `Error::Closed`. Every caller, including concurrent
    /// ones, returns only after the handles have been released.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .shutdown
            .get_or_init(|| async {
                let maintenance = self.inner.maintenance.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(maintenance) = maintenance {
                    maintenance.shutdown().await;
                }
                self.inner.pool.close().await;

                tracing::info!(path = %self.inner.config.path.display(), "cache closed");
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ttl_secs(&self, ttl: Option<Duration>) -> f64 {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl.as_secs_f64(),
            _ => self.inner.config.default_ttl().as_secs_f64(),
        }
    }

    fn record_read(&self, key: &str, hit: bool) {
        if hit {
            self.inner.counters.record_hit();
            self.inner.touches.mark(key, statements::now());
        } else {
            self.inner.counters.record_miss();
        }
    }

    /// Run a read, retrying on lock contention.
    async fn read<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: Fn(&mut rusqlite::Connection) -> Result<T, Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let op = Arc::new(op);
        let pool = &self.inner.pool;
        let wait = self.inner.config.operation_timeout();
        self.inner
            .policy
            .retry_contended(|| {
                let op = op.clone();
                pool.acquire_within(wait, move |conn| (*op)(conn))
            })
            .await
    }

    /// Run a write, retrying on lock contention and recovering once from a full store.
    ///
    /// The configured operation timeout bounds the wait for a handle. A write
    /// that has reached a handle always runs to completion, so an
    /// `Error::Timeout` means it was never applied.
    async fn write<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: Fn(&mut rusqlite::Connection) -> Result<T, Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let op = Arc::new(op);
        let pool = &self.inner.pool;
        let wait = self.inner.config.operation_timeout();
        self.inner
            .policy
            .with_recovery(pool, || {
                let op = op.clone();
                pool.acquire_within(wait, move |conn| (*op)(conn))
            })
            .await
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() { Err(Error::Closed) } else { Ok(()) }
    }
}
