//! Cancellation of long-lived per-container tasks
//!
//! Tunnels, reverse proxies, log-follow and attach streams each take a
//! listener token from the container's [`TaskRegistry`] when they start and
//! exit once it fires. Stop/kill/delete/restart call
//! [`TaskRegistry::cancel_all`], which fires every listener once and starts a
//! fresh generation for tasks registered afterwards.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Registry of cancellation listeners for one container
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<Generation>>,
}

#[derive(Debug, Default)]
struct Generation {
    parent: CancellationToken,
    listeners: usize,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task and get its cancellation token
    pub fn register(&self) -> CancellationToken {
        let mut generation = self.lock();
        generation.listeners += 1;
        generation.parent.child_token()
    }

    /// Number of registrations since the last [`cancel_all`](Self::cancel_all)
    ///
    /// Tasks that already ended on their own still count until then.
    pub fn registered(&self) -> usize {
        self.lock().listeners
    }

    /// Signal every registered task and discard their tokens
    ///
    /// Returns the number of listeners that were signalled. Calling it again
    /// with nothing registered is a no-op.
    pub fn cancel_all(&self) -> usize {
        let previous = std::mem::take(&mut *self.lock());
        if previous.listeners > 0 {
            previous.parent.cancel();
        }
        previous.listeners
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Generation> {
        // A panic while holding this lock cannot leave the generation half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_all_signals_every_listener() {
        let registry = TaskRegistry::new();
        let a = registry.register();
        let b = registry.clone().register();
        assert_eq!(registry.registered(), 2);

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(registry.registered(), 0);
    }

    #[test]
    fn test_cancel_all_is_idempotent() {
        let registry = TaskRegistry::new();
        let token = registry.register();

        registry.cancel_all();
        assert_eq!(registry.cancel_all(), 0);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_new_generation_after_cancel() {
        let registry = TaskRegistry::new();
        let old = registry.register();
        registry.cancel_all();

        let fresh = registry.register();
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn test_task_exits_on_cancel() {
        let registry = TaskRegistry::new();
        let token = registry.register();

        let task = tokio::spawn(async move {
            token.cancelled().await;
            "done"
        });

        registry.cancel_all();
        assert_eq!(task.await.unwrap(), "done");
    }
}
