//! This module provides the lifetime scope shared by all tasks of a fetch.

use std::sync::{Arc, Mutex};

use futures::future::Future;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A cancellable lifetime scope to run asynchronous tasks in the background.
///
/// Every task of a fetch (dispatcher loop aside) is spawned within a single scope. Cancelling the scope both flags it as
/// cancelled, which tasks can cooperatively observe through [`Scope::cancelled()`], and aborts every task spawned
/// within it at its next suspension point, unblocking any pending timer, channel wait or network read.
///
/// Scopes are cheap to clone, all clones sharing the same lifetime.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use dagfetch::task::Scope;
/// let scope = Scope::new();
///
/// scope.spawn(futures::future::pending());
/// scope.cancel();
///
/// scope.cancelled().await;
/// assert!(scope.is_cancelled());
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: watch::Sender<bool>,
    /// Tasks spawned and not reaped yet.
    tasks: Mutex<JoinSet<()>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: watch::Sender::new(false),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Spawn a task within this scope.
    ///
    /// _Note: if the scope has already been cancelled, the task is just dropped without executing anything._
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.inner.tasks.lock().unwrap();

        // the flag is raised before tasks are drained, so that a task is either never spawned or aborted on cancellation
        if self.is_cancelled() {
            return;
        }

        // reap finished tasks, so that a long-lived scope only ever holds the running ones
        while tasks.try_join_next().is_some() {}

        tasks.spawn(future);
    }

    /// Cancel this scope, aborting every task spawned within it.
    pub fn cancel(&self) {
        if self.inner.cancelled.send_replace(true) {
            return;
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());

        tracing::debug!("Cancelling scope, aborting {} tasks...", tasks.len());

        tasks.abort_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Wait for this scope to be cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.cancelled.subscribe();

        // the sender lives as long as the scope itself
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Number of tasks held by this scope, finished ones included until reaped.
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }
}
