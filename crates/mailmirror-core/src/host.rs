//! Host platform services: connectivity and power management.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

/// Connectivity as seen by the host.
pub trait Network: Send + Sync {
    /// Whether any network is currently connected.
    fn is_connected(&self) -> bool;

    /// Whether the active network is metered.
    fn is_metered(&self) -> bool;
}

/// Keeps the device awake while work is in progress.
///
/// Acquire and release calls for one tag are always paired.
pub trait PowerManager: Send + Sync {
    /// Takes a hold for `tag`.
    fn acquire(&self, tag: &str);

    /// Drops the hold for `tag`.
    fn release(&self, tag: &str);
}

/// A scoped hold on a [`PowerManager`], released on drop.
///
/// Taken around bounded work only; never held across a wait for the
/// server or for the next wake.
#[must_use = "the hold is released as soon as the lease is dropped"]
pub struct Lease {
    power: Arc<dyn PowerManager>,
    tag: String,
}

impl Lease {
    /// Takes a hold tagged `tag`.
    pub fn acquire(power: &Arc<dyn PowerManager>, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        trace!("Acquiring power lease {tag}");
        power.acquire(&tag);
        Self {
            power: Arc::clone(power),
            tag,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        trace!("Releasing power lease {}", self.tag);
        self.power.release(&self.tag);
    }
}

/// A [`PowerManager`] that does nothing, for hosts without power policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPower;

impl PowerManager for NoPower {
    fn acquire(&self, _tag: &str) {}
    fn release(&self, _tag: &str) {}
}

/// A [`Network`] whose state is set by the host.
#[derive(Debug)]
pub struct StaticNetwork {
    connected: AtomicBool,
    metered: AtomicBool,
}

impl StaticNetwork {
    /// Creates a network with the given state.
    #[must_use]
    pub const fn new(connected: bool, metered: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            metered: AtomicBool::new(metered),
        }
    }

    /// Updates the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Updates the metered state.
    pub fn set_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::SeqCst);
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl Network for StaticNetwork {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_metered(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PowerManager for Recorder {
        fn acquire(&self, tag: &str) {
            self.0.lock().unwrap().push(format!("+{tag}"));
        }
        fn release(&self, tag: &str) {
            self.0.lock().unwrap().push(format!("-{tag}"));
        }
    }

    #[test]
    fn lease_pairs_acquire_and_release() {
        let recorder = Arc::new(Recorder::default());
        let power: Arc<dyn PowerManager> = recorder.clone();
        {
            let _outer = Lease::acquire(&power, "account.1.monitor");
            let _inner = Lease::acquire(&power, "folder.2.sync");
        }
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "+account.1.monitor",
                "+folder.2.sync",
                "-folder.2.sync",
                "-account.1.monitor"
            ]
        );
    }

    #[test]
    fn static_network_updates() {
        let network = StaticNetwork::default();
        assert!(network.is_connected());
        network.set_metered(true);
        network.set_connected(false);
        assert!(network.is_metered());
        assert!(!network.is_connected());
    }
}
