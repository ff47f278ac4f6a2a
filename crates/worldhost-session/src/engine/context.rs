//! Serialized engine execution context.
//!
//! A single task drains a queue of jobs in submission order, so two world
//! mutations never run at the same time no matter how many sessions are live.

use futures_util::future::BoxFuture;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::{mpsc, oneshot};

use super::EngineError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct EngineContext {
    jobs: mpsc::UnboundedSender<Job>,
}

impl EngineContext {
    /// Spawn the context loop on the current runtime.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Engine job panicked");
                }
            }
            tracing::debug!("Engine context stopped");
        });

        Self { jobs }
    }

    /// Queue `f` without waiting for it.
    pub fn post<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs
            .send(Box::new(f))
            .map_err(|_| EngineError::ContextClosed)
    }

    /// Run `f` on the engine context and wait for its result.
    pub async fn run<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.post(move || {
            let _ = done_tx.send(f());
        })?;
        done_rx.await.map_err(|_| EngineError::ContextClosed)
    }

    /// Start a long-running engine operation on the context, then wait for it
    /// to complete without holding the context.
    pub async fn start<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(f).await?.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let ctx = EngineContext::spawn();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = log.clone();
            ctx.post(move || log.lock().push(i)).unwrap();
        }
        let len = ctx.run({
            let log = log.clone();
            move || log.lock().len()
        })
        .await
        .unwrap();

        assert_eq!(len, 10);
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_start_begins_on_context_and_completes_off_it() {
        let ctx = EngineContext::spawn();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<u32>();

        {
            let log = log.clone();
            ctx.post(move || log.lock().push("queued")).unwrap();
        }
        let pending = tokio::spawn({
            let ctx = ctx.clone();
            let log = log.clone();
            async move {
                ctx.start(move || {
                    log.lock().push("started");
                    Box::pin(async move { release_rx.await.map_err(|_| EngineError::ContextClosed) })
                })
                .await
            }
        });

        while log.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock(), vec!["queued", "started"]);

        // the context stays free while the operation is still running
        assert_eq!(ctx.run(|| 5).await.unwrap(), 5);
        assert!(!pending.is_finished());

        release_tx.send(7).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_the_loop() {
        let ctx = EngineContext::spawn();
        let counter = Arc::new(AtomicUsize::new(0));

        let failed = ctx.run(|| -> usize { panic!("boom") }).await;
        assert!(matches!(failed, Err(EngineError::ContextClosed)));

        let c = counter.clone();
        ctx.run(move || c.fetch_add(1, Ordering::SeqCst)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
