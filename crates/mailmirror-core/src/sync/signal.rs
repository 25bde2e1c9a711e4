//! Wake and stop primitives shared by session units.

use std::sync::{Mutex, PoisonError};

use tokio::sync::{Semaphore, watch};

/// Counting wake-up for a session's main wait, with an optional fault
/// raised by one of its units.
#[derive(Debug)]
pub(crate) struct Wakeup {
    permits: Semaphore,
    fault: Mutex<Option<String>>,
}

impl Default for Wakeup {
    fn default() -> Self {
        Self {
            permits: Semaphore::new(0),
            fault: Mutex::new(None),
        }
    }
}

impl Wakeup {
    /// Releases one pending wait.
    pub(crate) fn wake(&self) {
        self.permits.add_permits(1);
    }

    /// Records `reason` (the first one wins) and wakes the session so it
    /// reconnects.
    pub(crate) fn fail(&self, reason: String) {
        {
            let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            fault.get_or_insert(reason);
        }
        self.wake();
    }

    /// Takes the recorded fault, if any.
    pub(crate) fn take_fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Waits for one wake.
    pub(crate) async fn wait(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.permits.available_permits() > 0
    }
}

/// Sending half of a stop broadcast.
#[derive(Debug)]
pub(crate) struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half of a stop broadcast.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flags every signal as stopped.
    pub(crate) fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub(crate) fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stopped, or once the handle is gone.
    pub(crate) async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
