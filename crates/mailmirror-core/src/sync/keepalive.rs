//! Wall-clock keepalive wakeups.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::signal::Wakeup;

const SLICE: Duration = Duration::from_secs(30);

/// A pending wake of an account session. Cancelled on drop.
pub(crate) struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Wakes `wakeup` once `interval` has elapsed.
    ///
    /// The deadline is checked against the wall clock as well as the
    /// monotonic clock, so a host that suspends still fires on resume.
    pub(crate) fn schedule(interval: Duration, wakeup: Arc<Wakeup>) -> Self {
        let deadline = Instant::now() + interval;
        let wall_deadline: Option<DateTime<Utc>> = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        let handle = tokio::spawn(async move {
            loop {
                let now = Instant::now();
                if now >= deadline || wall_deadline.is_some_and(|w| Utc::now() >= w) {
                    break;
                }
                tokio::time::sleep((deadline - now).min(SLICE)).await;
            }
            trace!("Keepalive fired");
            wakeup.wake();
        });

        Self { handle }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_interval() {
        let wakeup = Arc::new(Wakeup::default());
        let _keepalive = KeepAlive::schedule(Duration::from_secs(540), Arc::clone(&wakeup));

        tokio::time::sleep(Duration::from_secs(539)).await;
        assert!(!wakeup.is_pending());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(wakeup.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_keepalive_never_fires() {
        let wakeup = Arc::new(Wakeup::default());
        drop(KeepAlive::schedule(Duration::from_secs(60), Arc::clone(&wakeup)));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!wakeup.is_pending());
    }
}
