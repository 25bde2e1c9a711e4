//! Lifecycle of all sessions.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::SyncContext;
use super::account::AccountSession;
use super::outbox::OutboxSession;
use crate::Result;
use crate::events::SyncEvent;

/// Network availability as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// A usable network appeared.
    Available,
    /// The network went away.
    Lost,
}

/// Commands accepted by [`Supervisor::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Start every session.
    Start,
    /// Stop every session.
    Stop,
    /// Stop, then start with fresh account data.
    Reload,
    /// Connectivity changed.
    Network(Connectivity),
}

struct Sessions {
    outbox: OutboxSession,
    accounts: Vec<AccountSession>,
}

#[derive(Default)]
struct State {
    sessions: Option<Sessions>,
    last_lost: Option<Instant>,
}

/// Starts and stops the outbox session and one session per synchronized
/// account.
///
/// Control calls are serialized: a stop always finishes joining every unit
/// before the next start begins.
pub struct Supervisor {
    ctx: SyncContext,
    state: Mutex<State>,
}

impl Supervisor {
    /// Creates a stopped supervisor.
    #[must_use]
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(State::default()),
        }
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Subscribes to engine events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    /// Whether sessions are running.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.sessions.is_some()
    }

    /// Units that have not finished yet. Zero once stopped.
    #[must_use]
    pub fn live_units(&self) -> usize {
        self.ctx.units.live()
    }

    /// Starts the outbox session and one session per synchronized account.
    ///
    /// Does nothing if already running, if the network is down, or if
    /// there is nothing to synchronize. Within the reconnect quiet period
    /// after a connectivity loss, waits out the rest of it first without
    /// blocking [`Supervisor::stop`], then checks the network again.
    /// Returns whether sessions were started.
    ///
    /// # Errors
    ///
    /// Returns an error if the mirror cannot be read.
    pub async fn start(&self) -> Result<bool> {
        let lost = {
            let state = self.state.lock().await;
            if state.sessions.is_some() {
                debug!("Already running");
                return Ok(false);
            }
            if !self.ctx.network.is_connected() {
                info!("No network, not starting");
                return Ok(false);
            }
            state.last_lost
        };

        if let Some(at) = lost {
            let quiet = self.ctx.config.reconnect_quiet();
            if let Some(remaining) = quiet.checked_sub(at.elapsed()).filter(|d| !d.is_zero()) {
                info!("Network came back, waiting {remaining:?} before reconnecting");
                tokio::time::sleep(remaining).await;
            }
        }

        let mut state = self.state.lock().await;
        if state.sessions.is_some() {
            debug!("Already running");
            return Ok(false);
        }
        if state.last_lost != lost {
            info!("Network lost again while waiting, not starting");
            return Ok(false);
        }
        if !self.ctx.network.is_connected() {
            info!("No network, not starting");
            return Ok(false);
        }

        let Some(outbox) = self.ctx.mirror.outbox().await? else {
            warn!("No outbox, not starting");
            return Ok(false);
        };
        let accounts = self.ctx.mirror.synchronized_accounts().await?;
        if accounts.is_empty() {
            info!("No synchronized accounts, not starting");
            return Ok(false);
        }

        info!("Starting {} account sessions", accounts.len());
        let outbox = OutboxSession::start(&self.ctx, outbox);
        let accounts = accounts
            .into_iter()
            .map(|account| AccountSession::start(&self.ctx, account))
            .collect();
        state.sessions = Some(Sessions { outbox, accounts });
        Ok(true)
    }

    /// Stops every session and waits until all of their units finished.
    /// Returns whether anything was running.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(sessions) = state.sessions.take() else {
            return false;
        };

        info!("Stopping {} account sessions", sessions.accounts.len());
        sessions.outbox.stop();
        for session in &sessions.accounts {
            session.stop();
        }

        let warn_every = self.ctx.config.join_warn();
        for session in sessions.accounts {
            session.join(warn_every).await;
        }
        sessions.outbox.join(warn_every).await;

        info!("Stopped, {} units live", self.ctx.units.live());
        true
    }

    /// Restarts with the current account configuration.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::start`].
    pub async fn reload(&self) -> Result<bool> {
        info!("Reloading");
        self.stop().await;
        self.start().await
    }

    /// Reacts to a connectivity change: stops on loss, starts when the
    /// network is back.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::start`].
    pub async fn on_connectivity(&self, connectivity: Connectivity) -> Result<()> {
        match connectivity {
            Connectivity::Lost => {
                if self.ctx.network.is_connected() {
                    debug!("Network lost, another one is still connected");
                    return Ok(());
                }
                info!("Network lost");
                self.state.lock().await.last_lost = Some(Instant::now());
                self.stop().await;
            }
            Connectivity::Available => {
                info!("Network available");
                self.start().await?;
            }
        }
        Ok(())
    }

    /// Applies controls in arrival order until the channel closes, then
    /// stops.
    pub async fn run(self: Arc<Self>, mut controls: mpsc::Receiver<Control>) {
        while let Some(control) = controls.recv().await {
            debug!("Control {control:?}");
            let result = match control {
                Control::Start => self.start().await.map(|_| ()),
                Control::Stop => {
                    self.stop().await;
                    Ok(())
                }
                Control::Reload => self.reload().await.map(|_| ()),
                Control::Network(connectivity) => self.on_connectivity(connectivity).await,
            };
            if let Err(e) = result {
                self.ctx.events.report(None, None, &e);
            }
        }
        self.stop().await;
    }
}
