//! Bounded worker pool for timed gets.
//!
//! A get dispatched here runs on its own task so a hung remote call cannot hold
//! the caller past the timeout. The semaphore bounds how many such calls are in
//! flight per client.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Named, size-bounded pool of get workers.
#[derive(Debug, Clone)]
pub struct GetPool {
    name: String,
    permits: Arc<Semaphore>,
    size: usize,
}

impl GetPool {
    /// Create a pool allowing `size` concurrent calls (at least one).
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pool size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `call` on a pool worker, waiting at most `timeout` for a worker and the result.
    ///
    /// On timeout the worker is aborted. Timeouts surface as `Error::Timeout`,
    /// a worker that panicked or was cancelled as `Error::Internal`.
    pub async fn execute<F, T>(&self, call: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let permit = tokio::time::timeout(timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                warn!(pool = %self.name, "No get worker available before timeout");
                Error::Timeout
            })?
            .map_err(|_| Error::Internal(format!("get pool {} closed", self.name)))?;

        let remaining = timeout.saturating_sub(started.elapsed());
        let mut worker = tokio::spawn(async move {
            let _permit = permit;
            call.await
        });

        match tokio::time::timeout(remaining, &mut worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::Internal(format!(
                "get worker in {} failed: {}",
                self.name, join_err
            ))),
            Err(_) => {
                worker.abort();
                let _ = worker.await;
                trace!(pool = %self.name, ?timeout, "Get worker aborted after timeout");
                Err(Error::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_returns_result() {
        let pool = GetPool::new("gets", 2);
        let value = pool.execute(async { Ok(41 + 1) }, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out_and_frees_worker() {
        let pool = GetPool::new("gets", 1);
        let err = pool
            .execute(std::future::pending::<Result<()>>(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The aborted worker hands its permit back.
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_execute_propagates_call_error() {
        let pool = GetPool::new("gets", 1);
        let err = pool
            .execute(async { Err::<(), _>(Error::RemoteIo("reset".into())) }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_io());
    }
}
