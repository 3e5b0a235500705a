//! Reaction to storage exhaustion and lock contention.
//!
//! Lock contention is retried with a doubling backoff up to a fixed attempt
//! count. Storage exhaustion evicts a fraction of the least recently used rows,
//! compacts the file, and retries the operation exactly once more.

use std::time::Duration;

use super::pool::Pool;
use super::statements;
use crate::config::CacheConfig;
use crate::error::{Error, FailureKind};

/// Cap for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first contended attempt.
    pub max_lock_retries: u32,
    /// Sleep before the first retry, doubled for each further one.
    pub backoff: Duration,
    /// Fraction of rows evicted to recover from a full store.
    pub prune_fraction: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            max_lock_retries: config.max_lock_retries,
            backoff: config.lock_retry_backoff(),
            prune_fraction: config.prune_fraction,
        }
    }

    /// Sleep before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op`, retrying while it fails with lock contention.
    ///
    /// Gives up with [`Error::Busy`] once the retry budget is spent.
    pub async fn retry_contended<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(err) if err.failure_kind() == FailureKind::Contended => {
                    attempt += 1;
                    if attempt > self.max_lock_retries {
                        tracing::warn!(attempts = attempt, error = %err, "store stayed locked, giving up");
                        return Err(Error::Busy { attempts: attempt });
                    }
                    let delay = self.backoff_for(attempt);
                    tracing::debug!(attempt, ?delay, "store locked, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Run a write, recovering once from a full store.
    pub async fn with_recovery<T, F, Fut>(&self, pool: &Pool, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.retry_contended(&mut op).await {
            Err(err) if err.failure_kind() == FailureKind::Exhausted => {
                tracing::warn!(error = %err, fraction = self.prune_fraction, "store full, evicting least recently used entries");
                let evicted = self
                    .retry_contended(|| recover_space(pool, self.prune_fraction))
                    .await
                    .map_err(storage_full)?;
                tracing::info!(evicted, "recovered space after store filled up");

                self.retry_contended(&mut op).await.map_err(storage_full)
            }
            other => other,
        }
    }
}

/// Report any exhaustion as [`Error::StorageFull`]; other errors pass through.
pub fn storage_full(err: Error) -> Error {
    match err {
        Error::StorageFull(_) => err,
        err if err.failure_kind() == FailureKind::Exhausted => Error::StorageFull(err.to_string()),
        err => err,
    }
}

/// Evict `fraction` of rows (oldest-used first) and compact the file.
pub async fn recover_space(pool: &Pool, fraction: f64) -> Result<u64, Error> {
    pool.acquire(move |conn| {
        let tx = statements::immediate(conn)?;
        let evicted = statements::prune_fraction(&tx, fraction)?;
        statements::compact(&tx)?;
        tx.commit()?;
        Ok(evicted)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::value::Value;
    use std::cell::Cell;
    use tokio_rusqlite::rusqlite::{self, ffi};

    fn policy(max_lock_retries: u32) -> RetryPolicy {
        RetryPolicy { max_lock_retries, backoff: Duration::from_millis(1), prune_fraction: 0.2 }
    }

    fn failure(code: i32) -> Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None).into()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy { backoff: Duration::from_millis(10), ..policy(5) };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_contention_is_retried() {
        let calls = Cell::new(0);
        let result = policy(5)
            .retry_contended(|| {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n < 3 { Err(failure(ffi::SQLITE_BUSY)) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_contention_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), Error> = policy(2)
            .retry_contended(|| {
                calls.set(calls.get() + 1);
                async { Err(failure(ffi::SQLITE_LOCKED)) }
            })
            .await;

        assert!(matches!(result, Err(Error::Busy { attempts: 3 })));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), Error> = policy(5)
            .retry_contended(|| {
                calls.set(calls.get() + 1);
                async { Err(failure(ffi::SQLITE_CORRUPT)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_prunes_then_retries_once() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        pool.acquire(|conn| {
            for i in 0..10i64 {
                statements::set(conn, &format!("k{i}"), &Value::Integer(i), 1e12, i as f64)?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let calls = Cell::new(0);
        let result = policy(0)
            .with_recovery(&pool, || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n == 1 { Err(failure(ffi::SQLITE_FULL)) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        let remaining = pool.acquire(|conn| statements::count(conn)).await.unwrap();
        assert_eq!(remaining, 8);
        let oldest_gone = pool.acquire(|conn| statements::get(conn, "k0", 0.0)).await.unwrap();
        assert!(oldest_gone.is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_after_second_failure() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        let calls = Cell::new(0);
        let result: Result<(), Error> = policy(0)
            .with_recovery(&pool, || {
                calls.set(calls.get() + 1);
                async { Err(failure(ffi::SQLITE_FULL)) }
            })
            .await;

        assert!(matches!(result, Err(Error::StorageFull(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_storage_full_normalizes_exhaustion_only() {
        assert!(matches!(storage_full(failure(ffi::SQLITE_FULL)), Error::StorageFull(_)));
        assert!(matches!(storage_full(Error::StorageFull("x".into())), Error::StorageFull(msg) if msg == "x"));
        assert!(matches!(storage_full(Error::Closed), Error::Closed));
        assert!(matches!(storage_full(failure(ffi::SQLITE_BUSY)), Error::Database(_)));
    }

    #[tokio::test]
    async fn test_fatal_recovery_error_passes_through() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        pool.acquire(|conn| {
            conn.execute_batch("DROP TABLE data;")?;
            Ok(())
        })
        .await
        .unwrap();

        let result: Result<(), Error> = policy(0)
            .with_recovery(&pool, || async { Err(failure(ffi::SQLITE_FULL)) })
            .await;
        assert!(matches!(result, Err(Error::Database(_))));
    }
}
