//! Per-pool fair queueing.
//!
//! Concurrent allocations against one pool all fight over the same status
//! object, so each pool gets a FIFO queue admitting one holder at a time.
//! Queueing is an optimization, not a lock: a caller that fails to acquire
//! proceeds anyway and the Store's optimistic concurrency stays the safety
//! net.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Maximum number of waiters per pool; excess callers are turned away
    pub max_queue_size: usize,

    /// Maximum total time one caller may spend queued
    pub max_wait_time: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_wait_time: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("waiting queue of IPPool {0} is full")]
    QueueFull(String),

    #[error("timed out waiting in the queue of IPPool {0}")]
    QueueTimeout(String),

    #[error("queueing canceled")]
    Canceled,
}

struct PoolQueue {
    semaphore: Arc<Semaphore>,
    waiters: Arc<AtomicUsize>,
}

/// Admission ticket across one or more pools. Dropping it releases every
/// held pool.
#[derive(Debug)]
pub struct Ticket {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Ticket {
    pub fn release(self) {}
}

/// FIFO fair queue, one lane per pool.
pub struct Limiter {
    config: LimiterConfig,
    queues: Mutex<HashMap<String, PoolQueue>>,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queue(&self, pool: &str) -> (Arc<Semaphore>, Arc<AtomicUsize>) {
        let mut queues = self.queues.lock().unwrap();
        let entry = queues.entry(pool.to_string()).or_insert_with(|| PoolQueue {
            semaphore: Arc::new(Semaphore::new(1)),
            waiters: Arc::new(AtomicUsize::new(0)),
        });
        (entry.semaphore.clone(), entry.waiters.clone())
    }

    /// Queues on every named pool in turn and returns a ticket once admitted
    /// on all of them. Pools are visited in sorted order so two callers
    /// naming overlapping sets cannot deadlock each other.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        pools: &[String],
    ) -> Result<Ticket, LimiterError> {
        let mut names: Vec<&String> = pools.iter().collect();
        names.sort();
        names.dedup();

        let deadline = tokio::time::Instant::now() + self.config.max_wait_time;
        let mut permits = Vec::with_capacity(names.len());

        for name in names {
            let (semaphore, waiters) = self.queue(name);

            if waiters.load(Ordering::SeqCst) >= self.config.max_queue_size {
                return Err(LimiterError::QueueFull(name.clone()));
            }

            waiters.fetch_add(1, Ordering::SeqCst);
            let acquired = tokio::select! {
                _ = cancel.cancelled() => Err(LimiterError::Canceled),
                result = tokio::time::timeout_at(deadline, semaphore.acquire_owned()) => {
                    match result {
                        Ok(Ok(permit)) => Ok(permit),
                        // The semaphore is never closed.
                        Ok(Err(_)) => Err(LimiterError::QueueTimeout(name.clone())),
                        Err(_) => Err(LimiterError::QueueTimeout(name.clone())),
                    }
                }
            };
            waiters.fetch_sub(1, Ordering::SeqCst);

            permits.push(acquired?);
        }

        Ok(Ticket { _permits: permits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_queue_size: usize, max_wait: Duration) -> Limiter {
        Limiter::new(LimiterConfig {
            max_queue_size,
            max_wait_time: max_wait,
        })
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let limiter = limiter(10, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let ticket = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();
        ticket.release();

        limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let limiter = limiter(10, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let _held = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();
        let err = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::QueueTimeout(_)));
    }

    #[tokio::test]
    async fn test_distinct_pools_do_not_contend() {
        let limiter = limiter(10, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let _p1 = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();
        limiter
            .acquire(&cancel, &["p2".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_wait() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let _held = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();

        let waiting = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel, &["p1".to_string()]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, LimiterError::Canceled));
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_arrival_order() {
        let limiter = Arc::new(limiter(10, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = limiter
            .acquire(&cancel, &["p1".to_string()])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let ticket = limiter.acquire(&cancel, &["p1".to_string()]).await.unwrap();
                order.lock().unwrap().push(i);
                ticket.release();
            }));
            // Let each waiter enqueue before the next arrives.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        first.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
