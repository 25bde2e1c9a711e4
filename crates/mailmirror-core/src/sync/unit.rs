//! Tracked background units.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Counts live units so shutdown can be verified.
#[derive(Debug, Clone, Default)]
pub struct UnitTracker {
    live: Arc<AtomicUsize>,
}

impl UnitTracker {
    /// Number of units that have not yet finished.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn spawn<F>(&self, name: impl Into<String>, future: F) -> Unit
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        trace!("Starting {name}");

        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });

        Unit { name, handle }
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A spawned unit of work owned by a session.
#[derive(Debug)]
pub(crate) struct Unit {
    name: String,
    handle: JoinHandle<()>,
}

impl Unit {
    /// Waits for the unit to finish, warning every `warn_every` while it
    /// has not.
    pub(crate) async fn join(mut self, warn_every: Duration) {
        loop {
            match tokio::time::timeout(warn_every, &mut self.handle).await {
                Ok(Ok(())) => {
                    trace!("Joined {}", self.name);
                    return;
                }
                Ok(Err(e)) if e.is_panic() => {
                    error!("{} panicked", self.name);
                    return;
                }
                Ok(Err(_)) => {
                    debug!("{} cancelled", self.name);
                    return;
                }
                Err(_) => warn!("Still waiting for {} to finish", self.name),
            }
        }
    }

    /// Waits up to `limit` for the unit to finish, then cancels it.
    /// Returns false if it had to be cancelled.
    pub(crate) async fn join_within(mut self, limit: Duration) -> bool {
        if tokio::time::timeout(limit, &mut self.handle).await.is_ok() {
            return true;
        }
        warn!("{} did not finish within {limit:?}, cancelling", self.name);
        self.handle.abort();
        let _ = self.handle.await;
        false
    }

    /// Cancels the unit at its next await point.
    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn join_waits_past_warnings() {
        let tracker = UnitTracker::default();
        let unit = tracker.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(95)).await;
        });
        assert_eq!(tracker.live(), 1);

        unit.join(Duration::from_secs(30)).await;
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn join_within_cancels_stuck_unit() {
        let tracker = UnitTracker::default();
        let unit = tracker.spawn("stuck", std::future::pending());
        assert!(!unit.join_within(Duration::from_secs(20)).await);
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn aborted_unit_is_not_live() {
        let tracker = UnitTracker::default();
        let unit = tracker.spawn("forever", std::future::pending());
        unit.abort();
        unit.join(Duration::from_secs(1)).await;
        assert_eq!(tracker.live(), 0);
    }
}
