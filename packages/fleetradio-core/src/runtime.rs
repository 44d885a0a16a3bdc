//! Task spawning abstraction for runtime independence.
//!
//! The control plane spawns several independent cooperative tasks
//! (discovery, clock sync, scheduling, status, collaboration — see
//! [`crate::controller`]). This trait lets [`crate::controller::ControlPlaneController`]
//! spawn them without hard-coding a Tokio handle, which keeps unit tests able
//! to substitute a synchronous/no-op spawner. Every task is named: a node
//! can have half a dozen of these running at once, and `on_internal_message`
//! runs on a caller's own task rather than one spawned here, so when one of
//! them wedges or panics the log line naming it is the only way to tell
//! which periodic loop stopped.

use std::future::Future;

/// Abstraction for spawning background tasks.
///
/// Implementations should ensure tasks are properly tracked and can complete
/// even if the spawner handle is dropped; the caller does not get a join
/// handle back.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Spawns a future as a background task, logging its start and exit
    /// under `name`. Default implementation just wraps [`TaskSpawner::spawn`];
    /// override if the runtime can track tasks more directly (e.g. to report
    /// a panic against the name rather than losing it in a generic Tokio
    /// panic message).
    fn spawn_named<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            log::debug!("task '{name}' starting");
            future.await;
            log::debug!("task '{name}' exited");
        });
    }
}

/// Tokio-based spawner used by the standalone server.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    fn spawn_named<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            log::debug!("task '{name}' starting");
            future.await;
            log::debug!("task '{name}' exited");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tokio_spawner_executes_task() {
        let spawner = TokioSpawner::current();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        spawner.spawn(async move {
            executed_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_named_runs_the_future_like_spawn() {
        let spawner = TokioSpawner::current();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();

        spawner.spawn_named("test-task", async move {
            executed_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(executed.load(Ordering::SeqCst));
    }
}
