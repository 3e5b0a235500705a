//! Bounded pool of store handles.
//!
//! Every foreground operation and every maintenance cycle runs through
//! [`Pool::acquire`], which hands out one handle exclusively for the duration of
//! the call. With the default size of one this is a fair async mutex around the
//! single connection; waiters are served in acquisition order.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_rusqlite::{Connection, rusqlite};

use super::{connection, migrations};
use crate::Error;
use crate::config::CacheConfig;

pub struct Pool {
    handles: Vec<Connection>,
    idle: Mutex<Vec<usize>>,
    permits: Semaphore,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.handles.len())
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

/// A checked-out handle. Returned to the pool on drop, whatever the exit path.
struct PooledHandle<'a> {
    pool: &'a Pool,
    index: usize,
    _permit: SemaphorePermit<'a>,
}

impl PooledHandle<'_> {
    fn conn(&self) -> &Connection {
        &self.pool.handles[self.index]
    }
}

impl Drop for PooledHandle<'_> {
    fn drop(&mut self) {
        self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner).push(self.index);
    }
}

impl Pool {
    /// Open `config.effective_pool_size()` handles and bring the schema up to date.
    pub async fn open(config: &CacheConfig) -> Result<Self, Error> {
        let size = config.effective_pool_size();
        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            handles.push(connection::open(config).await?);
        }

        if let Some(first) = handles.first() {
            migrations::run(first).await?;
        }

        Ok(Self { idle: Mutex::new((0..size).rev().collect()), permits: Semaphore::new(size), handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Run `f` with exclusive access to one handle.
    ///
    /// Waits (without spinning) until a handle is free. Fails with
    /// [`Error::Closed`] once the pool has been closed.
    pub async fn acquire<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        self.acquire_within(None, f).await
    }

    /// Like [`Pool::acquire`], but gives up with [`Error::Timeout`] when no
    /// handle frees up within `wait`.
    ///
    /// The limit covers the wait only. Once `f` has been handed to a handle it
    /// runs to completion and its result is returned.
    pub async fn acquire_within<F, R>(&self, wait: Option<Duration>, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let handle = match wait {
            Some(limit) => tokio::time::timeout(limit, self.checkout())
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => self.checkout().await?,
        };
        handle.conn().call(f).await.map_err(Error::from)
    }

    async fn checkout(&self) -> Result<PooledHandle<'_>, Error> {
        let permit = self.permits.acquire().await.map_err(|_| Error::Closed)?;
        let index = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(Error::Closed)?;
        Ok(PooledHandle { pool: self, index, _permit: permit })
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Wait for in-flight and queued operations, then close every handle.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }

        let all = u32::try_from(self.handles.len()).unwrap_or(u32::MAX);
        match self.permits.acquire_many(all).await {
            Ok(permits) => {
                self.permits.close();
                drop(permits);
            }
            Err(_) => return,
        }

        for conn in &self.handles {
            if let Err(e) = conn.clone().close().await {
                tracing::warn!(error = %e, "failed to close store handle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_runs_statement() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        let one: i64 = pool.acquire(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?)).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_errors_release_the_handle() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        let failed: Result<(), Error> = pool.acquire(|_| Err(Error::InvalidInput("boom".into()))).await;
        assert!(matches!(failed, Err(Error::InvalidInput(_))));

        let ok = pool.acquire(|_| Ok(())).await;
        assert!(ok.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_two_operations_share_a_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig { pool_size: 2, ..CacheConfig::at(dir.path().join("pool.db")) };
        let pool = Arc::new(Pool::open(&config).await.unwrap());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= pool.size());
    }

    #[tokio::test]
    async fn test_wait_limit_does_not_cut_dispatched_work() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        let result = pool
            .acquire_within(Some(Duration::from_millis(1)), |_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_wait_limit_times_out_on_busy_pool() {
        let pool = Arc::new(Pool::open(&CacheConfig::in_memory()).await.unwrap());
        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(|_| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waited = pool.acquire_within(Some(Duration::from_millis(10)), |_| Ok(())).await;
        assert!(matches!(waited, Err(Error::Timeout(_))));

        holder.await.unwrap().unwrap();
        assert!(pool.acquire_within(Some(Duration::from_millis(10)), |_| Ok(())).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = Pool::open(&CacheConfig::in_memory()).await.unwrap();
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        let result = pool.acquire(|_| Ok(())).await;
        assert!(matches!(result, Err(Error::Closed)));
    }
}
