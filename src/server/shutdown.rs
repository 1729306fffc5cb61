//! Shutdown coordination.
//!
//! Tracks the accept loop and in-flight connection workers, and owns the
//! one-shot shutdown signal. Initiating shutdown closes the transport (waking
//! the accept loop) and sets the signal; draining waits until the loop has
//! exited and every worker has released its guard.
//! There is no drain timeout: a handler that never returns blocks the drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::utils::ConfigError;

/// Counts live workers and wakes waiters when the count drops to zero.
#[derive(Debug, Default)]
pub struct WorkerGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one worker. The returned guard releases it on drop, whether
    /// the worker finished, failed or panicked.
    pub fn add(self: &Arc<Self>) -> WorkerGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            group: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no worker is registered.
    pub async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so the last guard's notification
            // cannot slip in between the check and the await.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one worker slot of a [`WorkerGroup`] when dropped.
#[derive(Debug)]
pub struct WorkerGuard {
    group: Arc<WorkerGroup>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.group.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.group.idle.notify_waiters();
        }
    }
}

/// One-shot shutdown signal, transport close broadcast and worker tracking.
///
/// Accept loops and session workers are tracked in separate groups. Draining
/// waits for the loops first: a loop registers every session it accepted
/// before it exits, so once no loop is left the session count can only fall.
#[derive(Debug)]
pub struct Shutdown {
    signal: AtomicBool,
    closed: watch::Sender<bool>,
    acceptors: Arc<WorkerGroup>,
    workers: Arc<WorkerGroup>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            signal: AtomicBool::new(false),
            closed,
            acceptors: Arc::new(WorkerGroup::new()),
            workers: Arc::new(WorkerGroup::new()),
        }
    }

    /// Whether shutdown has been initiated. Never blocks.
    pub fn is_set(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    /// Receiver a [`Transport`](crate::server::transport::Transport) uses to
    /// learn that it has been closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Running accept loops.
    pub fn acceptors(&self) -> &Arc<WorkerGroup> {
        &self.acceptors
    }

    /// Running session workers.
    pub fn workers(&self) -> &Arc<WorkerGroup> {
        &self.workers
    }

    /// Closes the transport and sets the signal.
    ///
    /// Only the first call succeeds; later calls return
    /// [`ConfigError::ShutdownTwice`] and change nothing.
    pub fn initiate(&self) -> Result<(), ConfigError> {
        if self
            .signal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConfigError::ShutdownTwice);
        }
        self.closed.send_replace(true);
        Ok(())
    }

    /// Waits until the accept loop has exited and every dispatched worker
    /// has finished.
    ///
    /// Does not cancel anything in flight.
    pub async fn wait_drain(&self) {
        self.acceptors.wait().await;
        self.workers.wait().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn worker_group_counts() {
        let group = Arc::new(WorkerGroup::new());
        assert_eq!(group.active(), 0);

        let guard1 = group.add();
        let guard2 = group.add();
        assert_eq!(group.active(), 2);

        drop(guard1);
        assert_eq!(group.active(), 1);
        drop(guard2);
        assert_eq!(group.active(), 0);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let group = Arc::new(WorkerGroup::new());
        tokio::time::timeout(Duration::from_millis(100), group.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_last_guard_drops() {
        let group = Arc::new(WorkerGroup::new());
        let first = group.add();
        let second = group.add();

        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(70)).await;
            drop(second);
        });

        group.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(95));
        assert_eq!(group.active(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_sessions_registered_by_a_running_loop() {
        let shutdown = Arc::new(Shutdown::new());
        let accepting = shutdown.acceptors().add();
        shutdown.initiate().unwrap();

        let draining = tokio::spawn({
            let shutdown = Arc::clone(&shutdown);
            async move { shutdown.wait_drain().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!draining.is_finished());

        // The loop hands off one last session, then exits.
        let session = shutdown.workers().add();
        drop(accepting);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!draining.is_finished());

        drop(session);
        tokio::time::timeout(Duration::from_secs(1), draining)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn initiate_only_once() {
        let shutdown = Shutdown::new();
        let closed = shutdown.closed();
        assert!(!shutdown.is_set());
        assert!(!*closed.borrow());

        shutdown.initiate().unwrap();
        assert!(shutdown.is_set());
        assert!(*closed.borrow());

        assert_eq!(shutdown.initiate(), Err(ConfigError::ShutdownTwice));
        assert!(shutdown.is_set());
    }
}
