//! Bounded pool for asymmetric crypto work
//!
//! KEM key generation and encryption are too slow for the connection tasks,
//! so they run on tokio's blocking threads. A semaphore caps how many run at
//! once; excess requests wait for a permit.

use super::HandshakeError;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default number of concurrent crypto jobs
pub const DEFAULT_WORKERS: usize = 4;

/// Handle to the crypto worker pool (cheap to clone)
#[derive(Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    /// Create a pool running at most `workers` jobs at once
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `job` on a worker and wait for its result
    pub async fn run<F, T>(&self, job: F) -> Result<T, HandshakeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| HandshakeError::Worker(e.to_string()))?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| HandshakeError::Worker(e.to_string()))
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for CryptoPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_job() {
        let pool = CryptoPool::new(2);
        let out = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = CryptoPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            jobs.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for job in jobs {
            job.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
