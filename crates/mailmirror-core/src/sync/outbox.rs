//! The outbox session: drains queued sends on request.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use super::SyncContext;
use super::operations::process_operations;
use super::signal::{StopHandle, StopSignal};
use super::unit::Unit;
use crate::events::{Route, WorkRequest};
use crate::store::{Folder, SyncState};

/// A running outbox session.
pub(crate) struct OutboxSession {
    stop: StopHandle,
    unit: Unit,
}

impl OutboxSession {
    /// Registers the outbox route and spawns the drain loop.
    pub(crate) fn start(ctx: &SyncContext, outbox: Folder) -> Self {
        let stop = StopHandle::new();
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.dispatcher.register(Route::Outbox, tx);

        let drain = Drain {
            ctx: ctx.clone(),
            outbox,
            lock: Mutex::new(()),
            stop: stop.signal(),
        };
        let unit = ctx.units.spawn("outbox", drain.run(rx));
        Self { stop, unit }
    }

    pub(crate) fn stop(&self) {
        self.stop.stop();
    }

    pub(crate) async fn join(self, warn_every: Duration) {
        self.unit.join(warn_every).await;
    }
}

struct Drain {
    ctx: SyncContext,
    outbox: Folder,
    lock: Mutex<()>,
    stop: StopSignal,
}

impl Drain {
    async fn run(self, mut requests: UnboundedReceiver<WorkRequest>) {
        info!("Outbox session started");
        let mut stop = self.stop.clone();

        self.set_error(None).await;
        self.drain().await;
        loop {
            tokio::select! {
                biased;
                () = stop.stopped() => break,
                request = requests.recv() => match request {
                    Some(request) => {
                        debug!("Outbox: {:?} requested", request.kind);
                        self.drain().await;
                    }
                    None => break,
                },
            }
        }

        self.ctx.dispatcher.unregister(Route::Outbox);
        self.set_state(None).await;
        info!("Outbox session ended");
    }

    async fn drain(&self) {
        self.set_state(Some(SyncState::Syncing)).await;
        match process_operations(&self.ctx, &self.outbox, None, &self.lock).await {
            Ok(outcome) => {
                if outcome.executed + outcome.dropped > 0 {
                    info!(
                        "Outbox: {} sent, {} dropped",
                        outcome.executed, outcome.dropped
                    );
                }
                self.set_error(None).await;
            }
            Err(e) => {
                self.set_error(Some(&e.to_string())).await;
                self.ctx.events.report(None, Some(&self.outbox.name), &e);
            }
        }
        self.set_state(Some(SyncState::Connected)).await;
    }

    async fn set_state(&self, state: Option<SyncState>) {
        if let Err(e) = self.ctx.mirror.set_folder_state(self.outbox.id, state).await {
            warn!("Outbox state: {e}");
        }
    }

    async fn set_error(&self, error: Option<&str>) {
        if let Err(e) = self.ctx.mirror.set_folder_error(self.outbox.id, error).await {
            warn!("Outbox error: {e}");
        }
    }
}
