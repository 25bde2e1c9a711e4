//! One account session: connect, monitor, reconnect with backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::SyncContext;
use super::backoff::Backoff;
use super::folder::FolderWorker;
use super::keepalive::KeepAlive;
use super::operations::{RemoteHandles, process_operations};
use super::reconcile::{synchronize_folders, synchronize_messages};
use super::signal::{StopHandle, StopSignal, Wakeup};
use super::unit::Unit;
use crate::Result;
use crate::events::{ErrorReport, Route, SyncEvent, WorkKind, WorkRequest};
use crate::protocol::{
    FolderEvent, OpenMode, ProtocolError, RemoteFolder, RemoteStore, StoreEvent,
};
use crate::store::{Account, AccountId, Folder, FolderId, SyncState};

/// A running account session.
pub(crate) struct AccountSession {
    name: String,
    stop: StopHandle,
    unit: Unit,
}

impl AccountSession {
    /// Spawns the monitor of `account`.
    pub(crate) fn start(ctx: &SyncContext, account: Account) -> Self {
        let stop = StopHandle::new();
        let name = account.name.clone();
        let monitor = Monitor {
            ctx: ctx.clone(),
            account: Arc::new(account),
            stop: stop.signal(),
        };
        let unit = ctx
            .units
            .spawn(format!("account.{}", monitor.account.id), monitor.run());
        Self { name, stop, unit }
    }

    /// Asks the session to close its connection and exit.
    pub(crate) fn stop(&self) {
        debug!("{}: stop requested", self.name);
        self.stop.stop();
    }

    /// Waits for the session to exit.
    pub(crate) async fn join(self, warn_every: Duration) {
        self.unit.join(warn_every).await;
        info!("{}: session ended", self.name);
    }
}

struct Monitor {
    ctx: SyncContext,
    account: Arc<Account>,
    stop: StopSignal,
}

impl Monitor {
    async fn run(self) {
        let config = &self.ctx.config;
        let mut backoff = Backoff::new(config.backoff_start(), config.backoff_max());
        let mut stop = self.stop.clone();
        info!("{}: session started", self.account.name);

        while !self.stop.is_stopped() {
            let mut connection = Connection::new(self.ctx.clone(), Arc::clone(&self.account));
            let result = connection.monitor(&mut backoff, self.stop.clone()).await;
            connection.close().await;

            if let Err(e) = result {
                let text = e.to_string();
                if let Err(db) = self
                    .ctx
                    .mirror
                    .set_account_error(self.account.id, Some(&text))
                    .await
                {
                    warn!("{}: recording account error: {db}", self.account.name);
                }
                self.ctx.events.report(Some(&self.account.name), None, &e);
            }

            if self.stop.is_stopped() {
                break;
            }
            let delay = backoff.next_delay();
            info!("{}: reconnecting in {delay:?}", self.account.name);
            tokio::select! {
                () = stop.stopped() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        set_state(&self.ctx, self.account.id, None).await;
    }
}

struct OpenFolder {
    folder: Folder,
    remote: Arc<dyn RemoteFolder>,
    requests: UnboundedSender<WorkKind>,
}

/// One connection attempt and everything it spawned.
struct Connection {
    ctx: SyncContext,
    account: Arc<Account>,
    lock: Arc<Mutex<()>>,
    wakeup: Arc<Wakeup>,
    units_stop: StopHandle,
    store: Option<Arc<dyn RemoteStore>>,
    folders: HashMap<FolderId, OpenFolder>,
    syncs: Vec<Unit>,
    idlers: Vec<Unit>,
    work: Option<Unit>,
}

impl Connection {
    fn new(ctx: SyncContext, account: Arc<Account>) -> Self {
        Self {
            ctx,
            account,
            lock: Arc::new(Mutex::new(())),
            wakeup: Arc::new(Wakeup::default()),
            units_stop: StopHandle::new(),
            store: None,
            folders: HashMap::new(),
            syncs: Vec::new(),
            idlers: Vec::new(),
            work: None,
        }
    }

    /// Connects, starts the folder units and waits for a reason to stop or
    /// reconnect. Returns `Ok` when stopped or when a unit asked for a
    /// reconnect it already reported.
    async fn monitor(&mut self, backoff: &mut Backoff, mut stop: StopSignal) -> Result<()> {
        let account = Arc::clone(&self.account);
        let mirror = Arc::clone(&self.ctx.mirror);

        mirror.clear_folder_states(account.id).await?;
        set_state(&self.ctx, account.id, Some(SyncState::Connecting)).await;

        let (store_tx, mut store_rx) = mpsc::unbounded_channel();
        let store = {
            let _lease = self.ctx.lease(format!("account.{}.connect", account.id));
            self.ctx.protocol.connect(&account, store_tx).await?
        };
        self.store = Some(Arc::clone(&store));
        set_state(&self.ctx, account.id, Some(SyncState::Connected)).await;
        mirror.set_account_error(account.id, None).await?;
        info!("{}: connected", account.name);

        {
            let _guard = self.lock.lock().await;
            synchronize_folders(&self.ctx, &account, store.as_ref()).await?;
        }

        for folder in mirror.synchronized_folders(account.id).await? {
            if stop.is_stopped() {
                return Ok(());
            }
            self.open(&store, folder).await?;
        }
        backoff.reset();

        self.spawn_work(&store);

        for open in self.folders.values() {
            if mirror.operation_count(open.folder.id).await? > 0 {
                let _ = open.requests.send(WorkKind::ProcessOperations);
            }
        }

        let interval = Duration::from_secs(u64::from(account.poll_interval.max(1)) * 60);
        let mut store_open = true;
        loop {
            let _keepalive = KeepAlive::schedule(interval, Arc::clone(&self.wakeup));
            loop {
                tokio::select! {
                    biased;
                    () = stop.stopped() => return Ok(()),
                    () = self.wakeup.wait() => break,
                    event = store_rx.recv(), if store_open => match event {
                        Some(event) => self.on_store_event(store.as_ref(), event).await?,
                        None => store_open = false,
                    },
                }
            }

            if stop.is_stopped() {
                return Ok(());
            }
            if let Some(fault) = self.wakeup.take_fault() {
                info!("{}: reconnecting after {fault}", account.name);
                return Ok(());
            }
            if !store.is_connected() {
                return Err(ProtocolError::store_closed(format!(
                    "{}: connection lost",
                    account.name
                ))
                .into());
            }

            if store.has_push_wait() {
                for open in self.folders.values() {
                    if !open.remote.is_open() {
                        return Err(ProtocolError::folder_closed(open.folder.name.clone()).into());
                    }
                }
                debug!("{}: keepalive ok", account.name);
            } else {
                {
                    let _guard = self.lock.lock().await;
                    synchronize_folders(&self.ctx, &account, store.as_ref()).await?;
                }
                for open in self.folders.values() {
                    let _ = open.requests.send(WorkKind::Synchronize);
                }
                debug!("{}: polling {} folders", account.name, self.folders.len());
            }
        }
    }

    async fn open(&mut self, store: &Arc<dyn RemoteStore>, folder: Folder) -> Result<()> {
        let mirror = self.ctx.mirror.as_ref();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let remote = match store
            .open_folder(&folder.name, OpenMode::ReadWrite, events_tx)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                mirror
                    .set_folder_error(folder.id, Some(&e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };
        mirror
            .set_folder_state(folder.id, Some(SyncState::Connected))
            .await?;
        mirror.set_folder_error(folder.id, None).await?;
        debug!("{}: opened {}", self.account.name, folder.name);

        let units = FolderWorker {
            ctx: self.ctx.clone(),
            account: Arc::clone(&self.account),
            folder: folder.clone(),
            store: Arc::clone(store),
            remote: Arc::clone(&remote),
            lock: Arc::clone(&self.lock),
            wakeup: Arc::clone(&self.wakeup),
            stop: self.units_stop.signal(),
        }
        .spawn(events_rx);

        self.syncs.push(units.sync);
        self.idlers.extend(units.idle);
        self.folders.insert(
            folder.id,
            OpenFolder {
                folder,
                remote,
                requests: units.requests,
            },
        );
        Ok(())
    }

    fn spawn_work(&mut self, store: &Arc<dyn RemoteStore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = WorkRouter {
            ctx: self.ctx.clone(),
            account: Arc::clone(&self.account),
            store: Arc::clone(store),
            lock: Arc::clone(&self.lock),
            wakeup: Arc::clone(&self.wakeup),
            stop: self.units_stop.signal(),
            open: self
                .folders
                .iter()
                .map(|(id, open)| (*id, open.requests.clone()))
                .collect(),
        };
        let name = format!("account.{}.work", self.account.id);
        self.work = Some(self.ctx.units.spawn(name, worker.run(rx)));
        self.ctx
            .dispatcher
            .register(Route::Account(self.account.id), tx);
    }

    async fn on_store_event(&self, store: &dyn RemoteStore, event: StoreEvent) -> Result<()> {
        let account = &self.account;
        match event {
            StoreEvent::Notification(text) => {
                warn!("{}: server says {text}", account.name);
                self.ctx
                    .mirror
                    .set_account_error(account.id, Some(&text))
                    .await?;
                self.ctx.events.emit(SyncEvent::Error(ErrorReport {
                    account: Some(account.name.clone()),
                    folder: None,
                    message: text,
                }));
                self.wakeup.wake();
            }
            StoreEvent::FolderRenamed { from, to } => {
                let renamed = self.ctx.mirror.rename_folder(account.id, &from, &to).await?;
                info!("{}: folder {from} renamed to {to} ({renamed})", account.name);
                self.wakeup.wake();
            }
            StoreEvent::FolderCreated(name) | StoreEvent::FolderDeleted(name) => {
                debug!("{}: folder list changed at {name}", account.name);
                let _guard = self.lock.lock().await;
                synchronize_folders(&self.ctx, account, store).await?;
            }
            StoreEvent::Disconnected(reason) => {
                return Err(ProtocolError::store_closed(reason).into());
            }
        }
        Ok(())
    }

    /// Stops every unit of this connection and closes it. The store close
    /// is bounded by the configured timeout.
    async fn close(mut self) {
        let ctx = self.ctx.clone();
        let account = Arc::clone(&self.account);
        let warn_every = ctx.config.join_warn();

        if self.store.is_some() {
            set_state(&ctx, account.id, Some(SyncState::Closing)).await;
            for id in self.folders.keys() {
                if let Err(e) = ctx
                    .mirror
                    .set_folder_state(*id, Some(SyncState::Closing))
                    .await
                {
                    warn!("{}: folder state: {e}", account.name);
                }
            }
        }

        ctx.dispatcher.unregister(Route::Account(account.id));
        self.units_stop.stop();

        let remotes: Vec<Arc<dyn RemoteFolder>> = self
            .folders
            .drain()
            .map(|(_, open)| open.remote)
            .collect();
        for unit in self.syncs.drain(..) {
            unit.join(warn_every).await;
        }
        if let Some(work) = self.work.take() {
            work.join(warn_every).await;
        }

        if let Some(store) = self.store.take() {
            let name = account.name.clone();
            let closer = ctx.units.spawn(format!("account.{}.close", account.id), async move {
                for remote in remotes {
                    if let Err(e) = remote.close().await {
                        debug!("{name}: closing {}: {e}", remote.name());
                    }
                }
                if let Err(e) = store.close().await {
                    debug!("{name}: closing store: {e}");
                }
            });
            if !closer.join_within(ctx.config.store_close_timeout()).await {
                warn!("{}: store close abandoned", account.name);
            }
        }

        if let Err(e) = ctx.mirror.clear_folder_states(account.id).await {
            warn!("{}: clearing folder states: {e}", account.name);
        }
        set_state(&ctx, account.id, None).await;

        for unit in self.idlers.drain(..) {
            unit.join(warn_every).await;
        }
        debug!("{}: connection closed", account.name);
    }
}

/// Routes dispatched work to the folder units, opening folders that have no
/// unit for the duration of the request.
struct WorkRouter {
    ctx: SyncContext,
    account: Arc<Account>,
    store: Arc<dyn RemoteStore>,
    lock: Arc<Mutex<()>>,
    wakeup: Arc<Wakeup>,
    stop: StopSignal,
    open: HashMap<FolderId, UnboundedSender<WorkKind>>,
}

impl WorkRouter {
    async fn run(self, mut requests: UnboundedReceiver<WorkRequest>) {
        let mut stop = self.stop.clone();
        loop {
            let request = tokio::select! {
                biased;
                () = stop.stopped() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if let Some(tx) = self.open.get(&request.folder) {
                let _ = tx.send(request.kind);
                continue;
            }

            if let Err(e) = self.run_unopened(request).await {
                self.ctx.events.report(Some(&self.account.name), None, &e);
                if e.fault_kind().is_quiet() && !self.stop.is_stopped() {
                    self.wakeup.fail(e.to_string());
                    break;
                }
            }
        }
        debug!("{}: work unit done", self.account.name);
    }

    async fn run_unopened(&self, request: WorkRequest) -> Result<()> {
        let mirror = self.ctx.mirror.as_ref();
        let Some(folder) = mirror.folder(request.folder).await? else {
            warn!("{}: no folder {}", self.account.name, request.folder);
            return Ok(());
        };
        if request.kind == WorkKind::ProcessOperations
            && mirror.operation_count(folder.id).await? == 0
        {
            return Ok(());
        }

        debug!("{}: opening {} for {:?}", self.account.name, folder.name, request.kind);
        // Folder events are not watched while the folder is open for one request.
        let (events_tx, _events_rx) = mpsc::unbounded_channel::<FolderEvent>();
        let remote = self
            .store
            .open_folder(&folder.name, OpenMode::ReadWrite, events_tx)
            .await?;
        mirror
            .set_folder_state(folder.id, Some(SyncState::Connected))
            .await?;

        let result = self.work_on(&folder, remote.as_ref(), request.kind).await;

        if let Err(e) = remote.close().await {
            debug!("{}: closing {}: {e}", self.account.name, folder.name);
        }
        mirror.set_folder_state(folder.id, None).await?;
        if let Err(e) = &result {
            error!("{}: {}: {e}", self.account.name, folder.name);
        }
        result
    }

    async fn work_on(
        &self,
        folder: &Folder,
        remote: &dyn RemoteFolder,
        kind: WorkKind,
    ) -> Result<()> {
        let handles = RemoteHandles {
            store: self.store.as_ref(),
            folder: remote,
        };
        process_operations(&self.ctx, folder, Some(handles), &self.lock).await?;

        if kind == WorkKind::Synchronize {
            let _guard = self.lock.lock().await;
            synchronize_messages(&self.ctx, folder, remote, &self.stop).await?;
        }
        self.ctx.refresh_unseen(folder.account).await;
        Ok(())
    }
}

async fn set_state(ctx: &SyncContext, account: AccountId, state: Option<SyncState>) {
    if let Err(e) = ctx.mirror.set_account_state(account, state).await {
        warn!("Account {account} state: {e}");
        return;
    }
    ctx.events.emit(SyncEvent::AccountState { account, state });
}
