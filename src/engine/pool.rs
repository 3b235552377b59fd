//! Bounded pool for blocking model fits.
//!
//! Curve and regression fits are CPU-bound, so they run on tokio's blocking
//! threads. A semaphore caps how many run at once, and each fit is raced
//! against the per-fit timeout. A timed-out fit cannot be cancelled: its
//! thread finishes in the background, still holding its permit, and the
//! result is discarded.

use futures::future::join_all;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

pub(crate) struct FitPool {
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl FitPool {
    pub(crate) fn new(workers: usize, timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    /// Run one blocking job. Errors, panics and timeouts all come back as a
    /// human-readable reason.
    pub(crate) async fn run<T, F>(&self, job: F) -> Result<T, String>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| format!("fit pool closed: {e}"))?;

        // The permit lives on the blocking thread, so an abandoned fit keeps
        // its worker slot until it actually returns.
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Model fit timed out");
                    return Err(format!("fit timed out after {} ms", limit.as_millis()));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) if e.is_panic() => Err(format!("fit panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("fit task failed: {e}")),
        }
    }

    /// Run every job concurrently; results come back in job order.
    pub(crate) async fn run_all<T, F>(&self, jobs: Vec<F>) -> Vec<Result<T, String>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        join_all(jobs.into_iter().map(|job| self.run(job))).await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
