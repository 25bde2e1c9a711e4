//! Events emitted to the host and work requests routed to sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::Error;
use crate::store::{AccountId, Folder, FolderId, MessageId, SyncState};

/// A user-facing error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Account name, if the error is scoped to one.
    pub account: Option<String>,
    /// Folder name, if the error is scoped to one.
    pub folder: Option<String>,
    /// Error text.
    pub message: String,
}

/// Observable engine events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// An account changed connection state.
    AccountState {
        /// The account.
        account: AccountId,
        /// New state.
        state: Option<SyncState>,
    },
    /// The unseen, visible, not ignored count of an account changed.
    UnseenChanged {
        /// The account.
        account: AccountId,
        /// New count.
        unseen: u64,
    },
    /// The transport accepted a message.
    MessageSent {
        /// The message.
        message: MessageId,
    },
    /// A fault that should be shown to the user.
    Error(ErrorReport),
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    unseen: Arc<Mutex<HashMap<AccountId, u64>>>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            unseen: Arc::default(),
        }
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. Events without subscribers are dropped.
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    /// Emits [`SyncEvent::UnseenChanged`] if `unseen` differs from the last
    /// count emitted for `account`.
    pub fn unseen(&self, account: AccountId, unseen: u64) {
        let changed = {
            let mut last = lock(&self.unseen);
            last.insert(account, unseen) != Some(unseen)
        };
        if changed {
            self.emit(SyncEvent::UnseenChanged { account, unseen });
        }
    }

    /// Logs `err` and emits a [`SyncEvent::Error`] if it is user visible.
    pub fn report(&self, account: Option<&str>, folder: Option<&str>, err: &Error) {
        let scope = match (account, folder) {
            (Some(a), Some(f)) => format!("{a}/{f}"),
            (Some(a), None) => a.to_string(),
            (None, Some(f)) => f.to_string(),
            (None, None) => "-".to_string(),
        };

        if !err.is_user_visible() {
            warn!("{scope}: {err}");
            return;
        }

        error!("{scope}: {err}");
        self.emit(SyncEvent::Error(ErrorReport {
            account: account.map(str::to_string),
            folder: folder.map(str::to_string),
            message: err.to_string(),
        }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// What a work request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Drain the queue, then reconcile the message window.
    Synchronize,
    /// Drain the queue.
    ProcessOperations,
}

/// An on-demand request for one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    /// Target folder.
    pub folder: FolderId,
    /// Requested work.
    pub kind: WorkKind,
}

impl WorkRequest {
    /// Requests a queue drain plus reconciliation.
    #[must_use]
    pub const fn synchronize(folder: FolderId) -> Self {
        Self {
            folder,
            kind: WorkKind::Synchronize,
        }
    }

    /// Requests a queue drain.
    #[must_use]
    pub const fn process(folder: FolderId) -> Self {
        Self {
            folder,
            kind: WorkKind::ProcessOperations,
        }
    }
}

/// The session a work request is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// The account session.
    Account(AccountId),
    /// The outbox session.
    Outbox,
}

impl Route {
    /// The session responsible for `folder`.
    #[must_use]
    pub const fn of(folder: &Folder) -> Self {
        match folder.account {
            Some(account) => Self::Account(account),
            None => Self::Outbox,
        }
    }
}

/// Delivers [`WorkRequest`]s to whichever session currently serves a route.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    routes: Arc<Mutex<HashMap<Route, mpsc::UnboundedSender<WorkRequest>>>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, route: Route, tx: mpsc::UnboundedSender<WorkRequest>) {
        lock(&self.routes).insert(route, tx);
    }

    pub(crate) fn unregister(&self, route: Route) {
        lock(&self.routes).remove(&route);
    }

    /// Sends `request` to the session serving `route`.
    ///
    /// Returns false if no session is running for it; the queue is drained
    /// anyway when that session next connects.
    pub fn dispatch(&self, route: Route, request: WorkRequest) -> bool {
        let delivered = lock(&self.routes)
            .get(&route)
            .is_some_and(|tx| tx.send(request).is_ok());
        if !delivered {
            debug!("No session for {route:?}, dropping {request:?}");
        }
        delivered
    }

    /// Sends `request` to the session responsible for `folder`.
    pub fn dispatch_for(&self, folder: &Folder, request: WorkRequest) -> bool {
        self.dispatch(Route::of(folder), request)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolError;

    #[test]
    fn unseen_is_emitted_only_on_change() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let account = AccountId(1);

        bus.unseen(account, 3);
        bus.unseen(account, 3);
        bus.unseen(account, 2);

        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::UnseenChanged { account, unseen: 3 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::UnseenChanged { account, unseen: 2 }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn quiet_errors_are_not_emitted() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.report(
            Some("Work"),
            None,
            &Error::from(ProtocolError::timeout("read timed out")),
        );
        assert!(rx.try_recv().is_err());

        bus.report(
            Some("Work"),
            Some("Outbox"),
            &Error::from(ProtocolError::send_rejected("550 mailbox unavailable")),
        );
        match rx.try_recv().unwrap() {
            SyncEvent::Error(report) => {
                assert_eq!(report.account.as_deref(), Some("Work"));
                assert!(report.message.contains("550"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dispatch_follows_registration() {
        let dispatcher = Dispatcher::new();
        let route = Route::Account(AccountId(4));
        assert!(!dispatcher.dispatch(route, WorkRequest::process(FolderId(1))));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(route, tx);
        assert!(dispatcher.dispatch(route, WorkRequest::synchronize(FolderId(1))));
        assert_eq!(rx.try_recv().unwrap(), WorkRequest::synchronize(FolderId(1)));

        dispatcher.unregister(route);
        assert!(!dispatcher.dispatch(route, WorkRequest::process(FolderId(1))));
    }
}
