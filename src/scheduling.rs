//! Cancellable scheduled tasks.
//!
//! A [`ScheduledTask`] owns the `JoinHandle` of a spawned tokio task and
//! aborts it when cancelled or dropped. Abort is only cooperative: a task
//! that already passed its last await point still completes. Every timer
//! callback in this crate therefore re-validates its own state when it
//! wakes up instead of trusting that cancellation reached it in time.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Handle to a spawned, cancellable task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawn `future` on the current runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Run `future` once `delay` has elapsed.
    pub fn after<F>(delay: Duration, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::at(Instant::now() + delay, future)
    }

    /// Run `future` at `deadline`.
    pub fn at<F>(deadline: Instant, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            future.await;
        })
    }

    /// Abort the task. Safe to call on a finished task.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Let the task run to completion without keeping a handle.
    ///
    /// Used by a task that removes its own registry entry: dropping the
    /// entry must not abort the code that is still running.
    pub fn detach(mut self) {
        self.handle.take();
    }

    /// Wait for the task to run to completion.
    pub async fn finished(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("scheduled task panicked: {}", e);
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
