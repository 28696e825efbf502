//! One-shot resolvable value shared between tasks.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::Notify;

/// A one-shot value that many tasks can await.
///
/// `resolve` wins exactly once; later calls are rejected. Clones share the
/// same underlying cell, so a promise can be handed to both the resolver and
/// any number of waiters.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

struct PromiseInner<T> {
    value: OnceLock<T>,
    notify: Notify,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                value: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolve the promise. Returns false if it was already resolved (the
    /// new value is dropped).
    pub fn resolve(&self, value: T) -> bool {
        let resolved = self.inner.value.set(value).is_ok();
        if resolved {
            self.inner.notify.notify_waiters();
        }
        resolved
    }

    pub fn is_done(&self) -> bool {
        self.inner.value.get().is_some()
    }

    pub fn try_get(&self) -> Option<&T> {
        self.inner.value.get()
    }
}

impl<T: Clone> Promise<T> {
    /// Wait until the promise resolves and return a clone of its value.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(value) = self.inner.value.get() {
                return value.clone();
            }
            let notified = self.inner.notify.notified();
            // Re-check: resolve may have landed between the first check and
            // registering the waiter.
            if let Some(value) = self.inner.value.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_resolved_value() {
        let promise = Promise::new();
        let waiter = promise.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(promise.resolve(7));
        assert_eq!(task.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_after_resolution_is_immediate() {
        let promise = Promise::new();
        promise.resolve("done");
        assert_eq!(promise.wait().await, "done");
    }

    #[test]
    fn second_resolve_is_rejected() {
        let promise = Promise::new();
        assert!(promise.resolve(1));
        assert!(!promise.resolve(2));
        assert_eq!(promise.try_get(), Some(&1));
    }

    #[tokio::test]
    async fn many_waiters_observe_the_same_value() {
        let promise: Promise<u32> = Promise::new();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let waiter = promise.clone();
                tokio::spawn(async move { waiter.wait().await })
            })
            .collect();

        promise.resolve(99);
        for task in tasks {
            assert_eq!(task.await.unwrap(), 99);
        }
    }
}
