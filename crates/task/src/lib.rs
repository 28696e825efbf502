//! Structured task and cancellation primitives.
//!
//! Everything in the runtime that runs concurrently is wrapped in a
//! [`SpawnedTask`]: a tokio task paired with a [`CancellationToken`] that the
//! task body is expected to observe at its await points. Cancellation is
//! always structured — `cancel_and_wait` fires the token, waits up to a
//! timeout for the task to unwind, and only then abandons it.

mod promise;
mod wait_group;

pub use promise::Promise;
pub use wait_group::{WaitGroup, WaitGroupGuard};

use std::time::Duration;

use tokio::task::JoinHandle;
pub use tokio_util::sync::CancellationToken;

/// A spawned unit of work carrying its own cancellation token.
///
/// The task body receives a clone of the token and should return promptly
/// once it fires. Dropping a `SpawnedTask` detaches the task (it keeps
/// running); use [`SpawnedTask::cancel_and_wait`] for a clean stop.
pub struct SpawnedTask<T> {
    token: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> SpawnedTask<T> {
    /// Spawn `f` with a fresh cancellation token.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        Self::with_token(CancellationToken::new(), f)
    }

    /// Spawn `f` with a token that also fires when `parent` is cancelled.
    pub fn spawn_child<F, Fut>(parent: &CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        Self::with_token(parent.child_token(), f)
    }

    fn with_token<F, Fut>(token: CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let handle = tokio::spawn(f(token.clone()));
        Self { token, handle }
    }

    /// The task's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the task has finished (completed, panicked, or aborted).
    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }

    /// Fire the cancellation token without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the task to finish. Returns `None` if the task panicked.
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::error!(error = %err, "task failed");
                None
            }
        }
    }

    /// Fire the token and wait up to `timeout` for the task to finish.
    ///
    /// Returns the task's value if it finished within the window. On timeout
    /// the task is abandoned — left running detached — and `None` is
    /// returned.
    pub async fn cancel_and_wait(self, timeout: Duration) -> Option<T> {
        self.token.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "task failed during cancellation");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "task did not stop in time, abandoning");
                None
            }
        }
    }
}

/// Cancel every task, then wait for all of them under one shared deadline.
///
/// Tasks that finish within the window contribute `Some(value)`; tasks that
/// do not are abandoned and contribute `None`.
pub async fn cancel_and_wait_all<T: Send + 'static>(
    tasks: Vec<SpawnedTask<T>>,
    timeout: Duration,
) -> Vec<Option<T>> {
    for task in &tasks {
        task.cancel();
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let joins = tasks
        .into_iter()
        .map(|task| async move { tokio::time::timeout_at(deadline, task.handle).await });
    futures::future::join_all(joins)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "task failed during cancellation");
                None
            }
            Err(_) => {
                tracing::warn!("task did not stop before the shared deadline, abandoning");
                None
            }
        })
        .collect()
}

/// A token that fires as soon as any of the input tokens fires.
pub fn combine_signals<I>(signals: I) -> CancellationToken
where
    I: IntoIterator<Item = CancellationToken>,
{
    let combined = CancellationToken::new();
    let tokens: Vec<CancellationToken> = signals.into_iter().collect();
    if tokens.is_empty() {
        return combined;
    }
    if tokens.iter().any(|t| t.is_cancelled()) {
        combined.cancel();
        return combined;
    }
    let out = combined.clone();
    tokio::spawn(async move {
        let waits: Vec<_> = tokens.iter().map(|t| Box::pin(t.cancelled())).collect();
        tokio::select! {
            _ = futures::future::select_all(waits) => out.cancel(),
            // Stop watching once the combined token fires through other means.
            _ = out.cancelled() => {}
        }
    });
    combined
}

/// Resolves when `token` fires. Reads better than `token.cancelled()` in
/// select races against non-cancellation futures.
pub async fn wait_for_abort(token: &CancellationToken) {
    token.cancelled().await;
}
