//! Per-folder units: the sync unit and, with server push, the idle unit.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::SyncContext;
use super::download::download_message;
use super::operations::{RemoteHandles, process_operations};
use super::reconcile::{synchronize_message, synchronize_messages};
use super::signal::{StopSignal, Wakeup};
use super::unit::Unit;
use crate::events::WorkKind;
use crate::protocol::{FolderEvent, RemoteFolder, RemoteMessage, RemoteStore};
use crate::store::{Account, Folder};
use crate::{Error, Result};

/// Handles to the units of one open folder.
pub(crate) struct FolderUnits {
    pub(crate) sync: Unit,
    pub(crate) idle: Option<Unit>,
    pub(crate) requests: UnboundedSender<WorkKind>,
}

/// An open folder and everything its units need.
pub(crate) struct FolderWorker {
    pub(crate) ctx: SyncContext,
    pub(crate) account: Arc<Account>,
    pub(crate) folder: Folder,
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) remote: Arc<dyn RemoteFolder>,
    pub(crate) lock: Arc<Mutex<()>>,
    pub(crate) wakeup: Arc<Wakeup>,
    pub(crate) stop: StopSignal,
}

impl FolderWorker {
    /// Spawns the sync unit, plus the idle unit if the store supports push.
    pub(crate) fn spawn(self, events: UnboundedReceiver<FolderEvent>) -> FolderUnits {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let id = self.folder.id;

        let idle = self.store.has_push_wait().then(|| {
            let idler = Idler {
                ctx: self.ctx.clone(),
                account: Arc::clone(&self.account),
                folder: self.folder.clone(),
                remote: Arc::clone(&self.remote),
                wakeup: Arc::clone(&self.wakeup),
                stop: self.stop.clone(),
            };
            self.ctx
                .units
                .spawn(format!("folder.{id}.idle"), idler.run())
        });

        let units = self.ctx.units.clone();
        let sync = units.spawn(format!("folder.{id}.sync"), self.run(events, request_rx));

        FolderUnits {
            sync,
            idle,
            requests,
        }
    }

    async fn run(
        self,
        mut events: UnboundedReceiver<FolderEvent>,
        mut requests: UnboundedReceiver<WorkKind>,
    ) {
        if let Err(e) = self.initial_pass().await {
            self.fail(&e).await;
            return;
        }

        let mut stop = self.stop.clone();
        loop {
            let result = tokio::select! {
                biased;
                () = stop.stopped() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                request = requests.recv() => match request {
                    Some(kind) => self.on_request(kind).await,
                    None => break,
                },
            };
            if let Err(e) = result {
                self.fail(&e).await;
                break;
            }
        }
        debug!("{}: sync unit done", self.folder.name);
    }

    async fn initial_pass(&self) -> Result<()> {
        self.process().await?;
        self.synchronize().await
    }

    async fn process(&self) -> Result<()> {
        let handles = RemoteHandles {
            store: self.store.as_ref(),
            folder: self.remote.as_ref(),
        };
        process_operations(&self.ctx, &self.folder, Some(handles), &self.lock).await?;
        Ok(())
    }

    async fn synchronize(&self) -> Result<()> {
        {
            let _lease = self.ctx.lease(format!("folder.{}.sync", self.folder.id));
            let _guard = self.lock.lock().await;
            synchronize_messages(&self.ctx, &self.folder, self.remote.as_ref(), &self.stop)
                .await?;
        }
        self.ctx.refresh_unseen(self.folder.account).await;
        Ok(())
    }

    async fn on_request(&self, kind: WorkKind) -> Result<()> {
        debug!("{}: {kind:?} requested", self.folder.name);
        match kind {
            WorkKind::ProcessOperations => self.process().await,
            WorkKind::Synchronize => {
                self.process().await?;
                self.synchronize().await
            }
        }
    }

    async fn on_event(&self, event: FolderEvent) -> Result<()> {
        {
            let _lease = self.ctx.lease(format!("folder.{}.event", self.folder.id));
            let _guard = self.lock.lock().await;
            let mirror = self.ctx.mirror.as_ref();

            match event {
                FolderEvent::MessagesAdded(uids) => {
                    info!("{}: {} messages added", self.folder.name, uids.len());
                    let fetched = self.remote.fetch_metadata(&uids).await?;
                    self.upsert_all(fetched).await?;
                }
                FolderEvent::MessagesRemoved(uids) => {
                    info!("{}: {} messages removed", self.folder.name, uids.len());
                    for uid in uids {
                        mirror.delete_message_by_uid(self.folder.id, uid).await?;
                    }
                }
                FolderEvent::MessageChanged(uid) => {
                    debug!("{}: uid {uid} changed", self.folder.name);
                    let fetched = self.remote.fetch_flags(&[uid]).await?;
                    self.upsert_all(fetched).await?;
                }
            }
        }

        self.process().await?;
        self.ctx.refresh_unseen(self.folder.account).await;
        Ok(())
    }

    /// Reconciles and downloads each message. Messages that vanished in
    /// the meantime are skipped.
    async fn upsert_all(&self, messages: Vec<RemoteMessage>) -> Result<()> {
        let mirror = self.ctx.mirror.as_ref();
        for message in messages {
            let uid = message.uid;
            let result = async {
                let outcome =
                    synchronize_message(mirror, &self.folder, self.remote.as_ref(), message)
                        .await?;
                if let Some(id) = outcome.message_id() {
                    download_message(&self.ctx, self.remote.as_ref(), id).await?;
                }
                Ok::<_, Error>(())
            }
            .await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_message_removed() => {
                    warn!("{}: uid {uid} removed: {e}", self.folder.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fail(&self, err: &Error) {
        if self.stop.is_stopped() {
            debug!("{}: stopped during failure: {err}", self.folder.name);
            return;
        }
        record_failure(&self.ctx, &self.account, &self.folder, &self.wakeup, err).await;
    }
}

/// Waits for server pushes on one folder until stopped or closed.
struct Idler {
    ctx: SyncContext,
    account: Arc<Account>,
    folder: Folder,
    remote: Arc<dyn RemoteFolder>,
    wakeup: Arc<Wakeup>,
    stop: StopSignal,
}

impl Idler {
    async fn run(self) {
        let mut stop = self.stop.clone();
        loop {
            let result = tokio::select! {
                biased;
                () = stop.stopped() => break,
                result = self.remote.idle() => result,
            };
            if let Err(e) = result {
                if !self.stop.is_stopped() {
                    let err = Error::from(e);
                    record_failure(&self.ctx, &self.account, &self.folder, &self.wakeup, &err)
                        .await;
                }
                break;
            }
        }
        debug!("{}: idle unit done", self.folder.name);
    }
}

/// Records a unit failure on the folder and forces the session to
/// reconnect.
async fn record_failure(
    ctx: &SyncContext,
    account: &Account,
    folder: &Folder,
    wakeup: &Wakeup,
    err: &Error,
) {
    let text = err.to_string();
    if let Err(e) = ctx.mirror.set_folder_error(folder.id, Some(&text)).await {
        warn!("{}: recording folder error: {e}", folder.name);
    }
    ctx.events.report(Some(&account.name), Some(&folder.name), err);
    wakeup.fail(format!("{}: {text}", folder.name));
}
