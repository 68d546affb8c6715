//! Task spawning abstraction for single-threaded execution.

use std::future::Future;

use async_trait::async_trait;

/// Provider for spawning local tasks.
///
/// Every directory task (replication rounds, cache refresh, the
/// cross-cluster registration protocol) runs on the current thread. With
/// the Tokio provider this means the caller must be inside a
/// [`tokio::task::LocalSet`].
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Tokio task provider using `spawn_local`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskProvider;

#[async_trait(?Send)]
impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        tracing::trace!(task = name, "spawning local task");
        tokio::task::spawn_local(future)
    }
}
