//! Execution and timer seams.
//!
//! The channel reschedules itself through an [`Executor`] whenever a
//! suspended exchange is woken from another thread, and arms one-shot
//! [`Scheduler`] timers for async-context timeouts. Both have tokio-backed
//! implementations; tests use the inline executor.

use std::time::Duration;

use tracing::warn;

/// Runs channel turns.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// One-shot cancellable timers.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Cancellation handle for a scheduled timer.
///
/// Dropping the handle does not cancel the timer; call [`TimerHandle::cancel`].
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// A handle for timers that cannot be cancelled.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Executor that runs channel turns on the tokio blocking pool.
///
/// Channel turns run synchronous application handlers, so they go to
/// `spawn_blocking` rather than onto the async workers.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context.
    pub fn current() -> Self {
        Self { handle: tokio::runtime::Handle::current() }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(task);
    }
}

/// Scheduler backed by tokio timers.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Self {
        Self { handle: tokio::runtime::Handle::current() }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || join.abort())
    }
}

/// Executor that runs tasks on the calling thread.
///
/// Useful in tests and in single-threaded embedders; a woken channel is
/// advanced before the waking call returns.
#[derive(Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Scheduler that refuses to arm timers.
///
/// Embedders that never suspend exchanges asynchronously can use this; a
/// scheduled timeout is logged and dropped.
#[derive(Clone, Copy, Default)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn schedule(&self, delay: Duration, _task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        warn!(delay_ms = delay.as_millis() as u64, "timer dropped, no scheduler configured");
        TimerHandle::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_executor_runs_synchronously() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        InlineExecutor.execute(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tokio_scheduler_fires_and_cancels() {
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        TokioScheduler::current().schedule(
            Duration::from_millis(10),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        let cancelled_flag = Arc::new(AtomicBool::new(false));
        let flag = cancelled_flag.clone();
        let handle = TokioScheduler::current().schedule(
            Duration::from_millis(10),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!cancelled_flag.load(Ordering::SeqCst));
    }
}
