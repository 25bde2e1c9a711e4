//! The synchronization engine.
//!
//! A [`Supervisor`] owns one account session per synchronized account plus
//! the outbox session. Each account session keeps a store connection open,
//! runs a sync unit (and an idle unit when the server supports push) per
//! synchronized folder, and reconnects with [`Backoff`] when anything fails.

mod account;
mod backoff;
mod download;
mod folder;
mod keepalive;
mod operations;
mod outbox;
mod reconcile;
mod signal;
mod supervisor;
mod unit;

use std::sync::Arc;

pub use backoff::Backoff;
pub use download::{download_message, should_fetch};
pub use operations::{QueueOutcome, RemoteHandles, process_operations};
pub use reconcile::{
    Reconciled, WindowSummary, synchronize_folders, synchronize_message, window_start,
};
pub use supervisor::{Connectivity, Control, Supervisor};
pub use unit::UnitTracker;

use crate::config::SyncConfig;
use crate::events::{Dispatcher, EventBus};
use crate::host::{Lease, Network, PowerManager};
use crate::protocol::{ProtocolAdapter, Transport};
use crate::store::{AccountId, Mirror};

/// Everything a session needs, shared by all of them.
#[derive(Clone)]
pub struct SyncContext {
    /// The local mirror.
    pub mirror: Arc<dyn Mirror>,
    /// Store connections.
    pub protocol: Arc<dyn ProtocolAdapter>,
    /// Outgoing transport.
    pub transport: Arc<dyn Transport>,
    /// Connectivity.
    pub network: Arc<dyn Network>,
    /// Power management.
    pub power: Arc<dyn PowerManager>,
    /// Tunables.
    pub config: Arc<SyncConfig>,
    /// Engine events.
    pub events: EventBus,
    /// Work request routing.
    pub dispatcher: Dispatcher,
    pub(crate) units: UnitTracker,
}

impl SyncContext {
    /// Bundles the host services with a fresh event bus and dispatcher.
    #[must_use]
    pub fn new(
        mirror: Arc<dyn Mirror>,
        protocol: Arc<dyn ProtocolAdapter>,
        transport: Arc<dyn Transport>,
        network: Arc<dyn Network>,
        power: Arc<dyn PowerManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            mirror,
            protocol,
            transport,
            network,
            power,
            config: Arc::new(config),
            events: EventBus::default(),
            dispatcher: Dispatcher::new(),
            units: UnitTracker::default(),
        }
    }

    pub(crate) fn lease(&self, tag: impl Into<String>) -> Lease {
        Lease::acquire(&self.power, tag)
    }

    /// Recomputes the unseen count of `account` and emits it if it changed.
    pub(crate) async fn refresh_unseen(&self, account: Option<AccountId>) {
        let Some(account) = account else { return };
        match self.mirror.unseen_count(account).await {
            Ok(unseen) => self.events.unseen(account, unseen),
            Err(e) => tracing::warn!("Unseen count of account {account}: {e}"),
        }
    }
}
