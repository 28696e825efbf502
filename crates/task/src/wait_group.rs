//! Counting group of in-flight tasks with change notification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks a set of in-flight tasks by RAII guard.
///
/// `add` hands out a guard per task; dropping the guard removes the task.
/// `wait_idle` resolves when the count reaches zero, and `changed` wakes on
/// every membership change so a scheduler loop can re-evaluate its exit
/// condition.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    changed: Notify,
}

pub struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one task; the returned guard must live as long as the task.
    pub fn add(&self) -> WaitGroupGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
        WaitGroupGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake on the next membership change. Spurious wakeups are possible;
    /// callers re-check their condition in a loop.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }

    /// Resolve once no guards remain.
    pub async fn wait_idle(&self) {
        loop {
            if self.is_empty() {
                return;
            }
            let notified = self.inner.changed.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.inner.count.fetch_sub(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_resolves_when_all_guards_drop() {
        let group = WaitGroup::new();
        let guards: Vec<_> = (0..3).map(|_| group.add()).collect();
        assert_eq!(group.len(), 3);

        let waiter = group.clone();
        let task = tokio::spawn(async move { waiter.wait_idle().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!task.is_finished());

        drop(guards);
        task.await.unwrap();
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn wait_idle_on_empty_group_is_immediate() {
        let group = WaitGroup::new();
        group.wait_idle().await;
    }

    #[tokio::test]
    async fn guard_moves_with_task() {
        let group = WaitGroup::new();
        let guard = group.add();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_millis(5)).await;
        });
        group.wait_idle().await;
        assert_eq!(group.len(), 0);
    }
}
