//! Background maintenance: batched recency updates and the expiry sweep.
//!
//! Reads never write. They record the key in [`PendingTouches`] and the worker
//! commits all of them in one immediate transaction per cycle, together with
//! the sweep of expired rows. The worker logs failures and carries on; nothing
//! it does can take the host process down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::Pool;
use super::retry::{RetryPolicy, recover_space, storage_full};
use super::statements;
use crate::error::{Error, FailureKind};

/// Keys read since the last cycle, with the latest read time for each.
#[derive(Debug, Default)]
pub(crate) struct PendingTouches {
    keys: Mutex<HashMap<String, f64>>,
}

impl PendingTouches {
    pub fn mark(&self, key: &str, at: f64) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        match keys.get_mut(key) {
            Some(seen) => *seen = seen.max(at),
            None => {
                keys.insert(key.to_string(), at);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.iter().map(|(k, at)| (k.clone(), *at)).collect()
    }

    /// Drop the keys of a committed batch.
    ///
    /// A key read again after the snapshot keeps its newer time for the next cycle.
    pub fn settle(&self, batch: &[(String, f64)]) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, at) in batch {
            if keys.get(key).is_some_and(|seen| seen <= at) {
                keys.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CycleReport {
    /// Keys whose `last_used` moved forward.
    pub touched: usize,
    /// Rows removed by the expiry sweep.
    pub expired: u64,
    /// Rows evicted because the store was full.
    pub evicted: u64,
}

impl CycleReport {
    fn is_idle(&self) -> bool {
        self.touched == 0 && self.expired == 0 && self.evicted == 0
    }
}

/// One maintenance pass over the store.
#[derive(Debug, Clone)]
pub(crate) struct Worker {
    pub pool: Arc<Pool>,
    pub touches: Arc<PendingTouches>,
    pub policy: RetryPolicy,
}

impl Worker {
    pub async fn cycle(&self) -> Result<CycleReport, Error> {
        let batch = Arc::new(self.touches.snapshot());

        let result = self
            .policy
            .retry_contended(|| {
                let batch = batch.clone();
                self.pool.acquire(move |conn| {
                    let tx = statements::immediate(conn)?;
                    let mut touched = 0usize;
                    for (key, at) in batch.iter() {
                        if statements::touch(&tx, key, *at)? {
                            touched += 1;
                        }
                    }
                    let expired = statements::prune_expired(&tx, statements::now())?;
                    tx.commit()?;
                    Ok((touched, expired))
                })
            })
            .await;

        match result {
            Ok((touched, expired)) => {
                self.touches.settle(&batch);
                Ok(CycleReport { touched, expired, evicted: 0 })
            }
            Err(err) if err.failure_kind() == FailureKind::Exhausted => {
                let evicted = recover_space(&self.pool, self.policy.prune_fraction).await.map_err(storage_full)?;
                Ok(CycleReport { evicted, ..Default::default() })
            }
            Err(err) => Err(err),
        }
    }
}

/// Handle to the running worker task.
#[derive(Debug)]
pub(crate) struct Maintenance {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Maintenance {
    /// Spawn the worker: run a cycle, sleep `interval`, repeat until stopped.
    ///
    /// Dropping the handle also stops the worker at its next wake-up.
    pub fn spawn(worker: Worker, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "maintenance worker started");

            loop {
                if *stopped.borrow_and_update() {
                    break;
                }

                match worker.cycle().await {
                    Ok(report) if report.is_idle() => {}
                    Ok(report) => debug!(
                        touched = report.touched,
                        expired = report.expired,
                        evicted = report.evicted,
                        "maintenance cycle"
                    ),
                    Err(err) => warn!(error = %err, "maintenance cycle failed"),
                }

                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow_and_update() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!("maintenance worker stopped");
        });

        Self { stop, task }
    }

    /// Signal the worker and wait for its current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(error = %e, "maintenance worker panicked");
            }
        }
    }
}
