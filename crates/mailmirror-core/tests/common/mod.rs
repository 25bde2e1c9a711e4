//! In-memory mail server and transport shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use mailmirror_core::protocol::{
    FolderEvent, OpenMode, OutgoingMessage, ProtocolAdapter, ProtocolError, ProtocolResult,
    RemoteFlag, RemoteFlags, RemoteFolder, RemoteFolderInfo, RemoteMessage, RemoteMetadata,
    RemoteStore, StoreEvent, Transport,
};
use mailmirror_core::store::{
    Account, AccountId, FolderId, FolderType, Mirror, NewFolder, NewMessage, SqliteMirror,
};
use mailmirror_core::{NoPower, StaticNetwork, SyncConfig, SyncContext};

/// A message held by the mock server.
#[derive(Debug, Clone)]
pub struct MockMessage {
    pub flags: RemoteFlags,
    pub metadata: RemoteMetadata,
    pub body: String,
    pub attachments: Vec<Vec<u8>>,
}

impl MockMessage {
    pub fn new(msgid: &str, received: DateTime<Utc>) -> Self {
        Self {
            flags: RemoteFlags::default(),
            metadata: RemoteMetadata {
                message_id: Some(msgid.to_string()),
                from: vec!["sender@example.com".to_string()],
                to: vec!["me@example.com".to_string()],
                subject: Some(format!("Subject of {msgid}")),
                size: Some(512),
                received,
                ..RemoteMetadata::default()
            },
            body: format!("Body of {msgid}"),
            attachments: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Mailbox {
    messages: BTreeMap<u32, MockMessage>,
}

impl Mailbox {
    fn next_uid(&self) -> u32 {
        self.messages.keys().next_back().map_or(1, |uid| uid + 1)
    }

    fn insert(&mut self, message: MockMessage) -> u32 {
        let uid = self.next_uid();
        self.messages.insert(uid, message);
        uid
    }
}

#[derive(Default)]
struct ServerState {
    mailboxes: BTreeMap<String, Mailbox>,
    containers: BTreeSet<String>,
    watchers: HashMap<String, UnboundedSender<FolderEvent>>,
    store_events: Vec<UnboundedSender<StoreEvent>>,
    flag_results: VecDeque<Option<ProtocolError>>,
    connect_faults: VecDeque<ProtocolError>,
    flag_calls: Vec<(String, u32, RemoteFlag, bool)>,
}

/// Shared state of an in-memory mail server.
pub struct MockServer {
    state: Mutex<ServerState>,
    push: bool,
    native_move: bool,
    connects: AtomicUsize,
    opens: AtomicUsize,
    open_folders: AtomicUsize,
}

impl MockServer {
    pub fn new(push: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            push,
            native_move: false,
            connects: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            open_folders: AtomicUsize::new(0),
        })
    }

    /// Adds a folder that only holds other folders.
    pub fn add_container(&self, name: &str) {
        self.state.lock().unwrap().containers.insert(name.to_string());
    }

    /// Creates a folder and announces it to connected stores.
    pub fn create_folder(&self, name: &str) {
        self.add_folder(name);
        self.announce(StoreEvent::FolderCreated(name.to_string()));
    }

    /// Deletes a folder and announces it to connected stores.
    pub fn delete_folder(&self, name: &str) {
        self.state.lock().unwrap().mailboxes.remove(name);
        self.announce(StoreEvent::FolderDeleted(name.to_string()));
    }

    /// Renames a folder and announces it to connected stores.
    pub fn rename_folder(&self, from: &str, to: &str) {
        {
            let mut state = self.state.lock().unwrap();
            let mailbox = state.mailboxes.remove(from).unwrap_or_default();
            state.mailboxes.insert(to.to_string(), mailbox);
        }
        self.announce(StoreEvent::FolderRenamed {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Sends a server alert to connected stores.
    pub fn alert(&self, text: &str) {
        self.announce(StoreEvent::Notification(text.to_string()));
    }

    fn announce(&self, event: StoreEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .store_events
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn add_folder(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .entry(name.to_string())
            .or_default();
    }

    /// Stores `message` under `uid`, replacing any previous one.
    pub fn put(&self, folder: &str, uid: u32, message: MockMessage) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .entry(folder.to_string())
            .or_default()
            .messages
            .insert(uid, message);
    }

    /// Stores `message` and announces it to an open folder, as a push
    /// notification would.
    pub fn deliver(&self, folder: &str, message: MockMessage) -> u32 {
        let mut state = self.state.lock().unwrap();
        let uid = state
            .mailboxes
            .entry(folder.to_string())
            .or_default()
            .insert(message);
        if let Some(watcher) = state.watchers.get(folder) {
            let _ = watcher.send(FolderEvent::MessagesAdded(vec![uid]));
        }
        uid
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(folder)
            .map(|m| m.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn message(&self, folder: &str, uid: u32) -> Option<MockMessage> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(folder)
            .and_then(|m| m.messages.get(&uid).cloned())
    }

    /// Scripts the results of the next `set_flag` calls; `None` succeeds.
    pub fn script_flags(&self, results: Vec<Option<ProtocolError>>) {
        self.state.lock().unwrap().flag_results.extend(results);
    }

    pub fn fail_connects(&self, faults: Vec<ProtocolError>) {
        self.state.lock().unwrap().connect_faults.extend(faults);
    }

    pub fn flag_calls(&self) -> Vec<(String, u32, RemoteFlag, bool)> {
        self.state.lock().unwrap().flag_calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_folders(&self) -> usize {
        self.open_folders.load(Ordering::SeqCst)
    }

    /// Folder opens since the server was created.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn append(&self, folder: &str, message: &OutgoingMessage) -> ProtocolResult<u32> {
        let mut state = self.state.lock().unwrap();
        let mailbox = state
            .mailboxes
            .get_mut(folder)
            .ok_or_else(|| ProtocolError::folder_not_found(folder))?;
        let mock = MockMessage {
            flags: RemoteFlags {
                seen: message.seen,
                ..RemoteFlags::default()
            },
            metadata: RemoteMetadata {
                message_id: message.message_id.clone(),
                references: message
                    .references
                    .as_deref()
                    .map(|r| r.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                in_reply_to: message.in_reply_to.clone(),
                from: message.from.clone(),
                to: message.to.clone(),
                subject: message.subject.clone(),
                size: Some(message.body.len() as u64),
                received: Utc::now(),
                sent: message.sent,
                ..RemoteMetadata::default()
            },
            body: message.body.clone(),
            attachments: message.attachments.iter().map(|a| a.data.clone()).collect(),
        };
        Ok(mailbox.insert(mock))
    }
}

/// Connects to a [`MockServer`].
pub struct MockAdapter(pub Arc<MockServer>);

#[async_trait]
impl ProtocolAdapter for MockAdapter {
    async fn connect(
        &self,
        _account: &Account,
        events: UnboundedSender<StoreEvent>,
    ) -> ProtocolResult<Arc<dyn RemoteStore>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.0.state.lock().unwrap();
            if let Some(fault) = state.connect_faults.pop_front() {
                return Err(fault);
            }
            state.store_events.push(events.clone());
        }
        Ok(Arc::new(MockStore {
            server: Arc::clone(&self.0),
            connected: AtomicBool::new(true),
            _events: events,
        }))
    }
}

pub struct MockStore {
    server: Arc<MockServer>,
    connected: AtomicBool,
    _events: UnboundedSender<StoreEvent>,
}

#[async_trait]
impl RemoteStore for MockStore {
    fn has_push_wait(&self) -> bool {
        self.server.push
    }

    fn has_native_move(&self) -> bool {
        self.server.native_move
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_folders(&self) -> ProtocolResult<Vec<RemoteFolderInfo>> {
        let state = self.server.state.lock().unwrap();
        let containers = state.containers.iter().map(|name| RemoteFolderInfo {
            name: name.clone(),
            selectable: false,
        });
        Ok(state
            .mailboxes
            .keys()
            .map(RemoteFolderInfo::selectable)
            .chain(containers)
            .collect())
    }

    async fn open_folder(
        &self,
        name: &str,
        _mode: OpenMode,
        events: UnboundedSender<FolderEvent>,
    ) -> ProtocolResult<Arc<dyn RemoteFolder>> {
        {
            let mut state = self.server.state.lock().unwrap();
            if !state.mailboxes.contains_key(name) {
                return Err(ProtocolError::folder_not_found(name));
            }
            state.watchers.insert(name.to_string(), events);
        }
        self.server.opens.fetch_add(1, Ordering::SeqCst);
        self.server.open_folders.fetch_add(1, Ordering::SeqCst);
        let (open, _) = watch::channel(true);
        Ok(Arc::new(MockFolder {
            server: Arc::clone(&self.server),
            name: name.to_string(),
            open,
        }))
    }

    async fn append_to(&self, folder: &str, message: &OutgoingMessage) -> ProtocolResult<()> {
        self.server.append(folder, message).map(|_| ())
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockFolder {
    server: Arc<MockServer>,
    name: String,
    open: watch::Sender<bool>,
}

impl MockFolder {
    fn with_message<T>(
        &self,
        uid: u32,
        f: impl FnOnce(&mut MockMessage) -> T,
    ) -> ProtocolResult<T> {
        let mut state = self.server.state.lock().unwrap();
        state
            .mailboxes
            .get_mut(&self.name)
            .and_then(|m| m.messages.get_mut(&uid))
            .map(f)
            .ok_or_else(|| ProtocolError::removed(format!("{}: uid {uid}", self.name)))
    }

    fn collect(&self, uids: &[u32], metadata: bool) -> Vec<RemoteMessage> {
        let state = self.server.state.lock().unwrap();
        let Some(mailbox) = state.mailboxes.get(&self.name) else {
            return Vec::new();
        };
        uids.iter()
            .filter_map(|uid| {
                mailbox.messages.get(uid).map(|m| RemoteMessage {
                    uid: *uid,
                    expunged: false,
                    flags: m.flags,
                    metadata: metadata.then(|| m.metadata.clone()),
                })
            })
            .collect()
    }
}

#[async_trait]
impl RemoteFolder for MockFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn search_since(&self, since: DateTime<Utc>) -> ProtocolResult<Vec<RemoteMessage>> {
        let state = self.server.state.lock().unwrap();
        let mailbox = state
            .mailboxes
            .get(&self.name)
            .ok_or_else(|| ProtocolError::folder_not_found(self.name.clone()))?;
        Ok(mailbox
            .messages
            .iter()
            .filter(|(_, m)| m.metadata.received >= since)
            .map(|(uid, m)| RemoteMessage {
                uid: *uid,
                expunged: false,
                flags: m.flags,
                metadata: None,
            })
            .collect())
    }

    async fn fetch_metadata(&self, uids: &[u32]) -> ProtocolResult<Vec<RemoteMessage>> {
        Ok(self.collect(uids, true))
    }

    async fn fetch_flags(&self, uids: &[u32]) -> ProtocolResult<Vec<RemoteMessage>> {
        Ok(self.collect(uids, false))
    }

    async fn set_flag(&self, uid: u32, flag: RemoteFlag, value: bool) -> ProtocolResult<()> {
        {
            let mut state = self.server.state.lock().unwrap();
            state
                .flag_calls
                .push((self.name.clone(), uid, flag, value));
            if let Some(Some(fault)) = state.flag_results.pop_front() {
                return Err(fault);
            }
        }
        self.with_message(uid, |m| match flag {
            RemoteFlag::Seen => m.flags.seen = value,
            RemoteFlag::Flagged => m.flags.flagged = value,
            RemoteFlag::Deleted => m.flags.deleted = value,
        })
    }

    async fn append(&self, message: &OutgoingMessage) -> ProtocolResult<u32> {
        self.server.append(&self.name, message)
    }

    async fn move_to(&self, uid: u32, target: &str) -> ProtocolResult<()> {
        let mut state = self.server.state.lock().unwrap();
        let message = state
            .mailboxes
            .get_mut(&self.name)
            .and_then(|m| m.messages.remove(&uid))
            .ok_or_else(|| ProtocolError::removed(format!("uid {uid}")))?;
        state
            .mailboxes
            .get_mut(target)
            .ok_or_else(|| ProtocolError::folder_not_found(target))?
            .insert(message);
        Ok(())
    }

    async fn expunge(&self) -> ProtocolResult<()> {
        let mut state = self.server.state.lock().unwrap();
        if let Some(mailbox) = state.mailboxes.get_mut(&self.name) {
            mailbox.messages.retain(|_, m| !m.flags.deleted);
        }
        Ok(())
    }

    async fn fetch_headers(&self, uid: u32) -> ProtocolResult<String> {
        self.with_message(uid, |m| {
            format!(
                "Message-ID: {}\r\nSubject: {}\r\n",
                m.metadata.message_id.clone().unwrap_or_default(),
                m.metadata.subject.clone().unwrap_or_default()
            )
        })
    }

    async fn fetch_body(&self, uid: u32) -> ProtocolResult<String> {
        self.with_message(uid, |m| m.body.clone())
    }

    async fn fetch_attachment(&self, uid: u32, sequence: u32) -> ProtocolResult<Vec<u8>> {
        let index = (sequence as usize).checked_sub(1);
        self.with_message(uid, |m| index.and_then(|i| m.attachments.get(i)).cloned())?
            .ok_or_else(|| ProtocolError::other(format!("uid {uid}: no attachment {sequence}")))
    }

    async fn idle(&self) -> ProtocolResult<()> {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| !*open).await;
        Err(ProtocolError::folder_closed(self.name.clone()))
    }

    async fn close(&self) -> ProtocolResult<()> {
        if self.open.send_replace(false) {
            self.server.open_folders.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A transport that records what it sends and replays scripted faults.
#[derive(Default)]
pub struct MockTransport {
    results: Mutex<VecDeque<ProtocolResult<()>>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    reauthentications: AtomicUsize,
}

impl MockTransport {
    pub fn script(&self, results: Vec<ProtocolResult<()>>) {
        self.results.lock().unwrap().extend(results);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reauthentications(&self) -> usize {
        self.reauthentications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, _account: &Account, message: &OutgoingMessage) -> ProtocolResult<()> {
        let result = self.results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.sent.lock().unwrap().push(message.clone());
        }
        result
    }

    async fn reauthenticate(&self, _account: &Account) -> ProtocolResult<()> {
        self.reauthentications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An engine context wired to the mocks over an in-memory mirror.
pub struct Harness {
    pub mirror: Arc<SqliteMirror>,
    pub server: Arc<MockServer>,
    pub transport: Arc<MockTransport>,
    pub network: Arc<StaticNetwork>,
    pub ctx: SyncContext,
}

impl Harness {
    pub async fn new(push: bool) -> Self {
        Self::with_config(push, SyncConfig::default()).await
    }

    pub async fn with_config(push: bool, config: SyncConfig) -> Self {
        let mirror = Arc::new(SqliteMirror::in_memory().await.unwrap());
        let server = MockServer::new(push);
        let transport = Arc::new(MockTransport::default());
        let network = Arc::new(StaticNetwork::new(true, false));
        let ctx = SyncContext::new(
            mirror.clone(),
            Arc::new(MockAdapter(Arc::clone(&server))),
            transport.clone(),
            network.clone(),
            Arc::new(NoPower),
            config,
        );
        Self {
            mirror,
            server,
            transport,
            network,
            ctx,
        }
    }

    pub async fn account(&self, name: &str, store_sent: bool) -> AccountId {
        self.mirror
            .insert_account(&Account {
                name: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase()),
                synchronize: true,
                poll_interval: 15,
                store_sent,
                ..Account::default()
            })
            .await
            .unwrap()
    }

    /// Creates a folder both locally and on the server.
    pub async fn folder(
        &self,
        account: AccountId,
        name: &str,
        folder_type: FolderType,
        synchronize: bool,
    ) -> FolderId {
        self.server.add_folder(name);
        self.mirror
            .insert_folder(&NewFolder {
                account: Some(account),
                name: name.to_string(),
                folder_type,
                synchronize,
                after: 7,
            })
            .await
            .unwrap()
    }

    pub async fn outbox(&self) -> FolderId {
        self.mirror
            .insert_folder(&NewFolder {
                account: None,
                name: "Outbox".to_string(),
                folder_type: FolderType::Outbox,
                synchronize: false,
                after: 0,
            })
            .await
            .unwrap()
    }

    /// Opens `name` on a fresh store connection.
    pub async fn open(&self, name: &str) -> (Arc<dyn RemoteStore>, Arc<dyn RemoteFolder>) {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let store = MockAdapter(Arc::clone(&self.server))
            .connect(&Account::default(), tx)
            .await
            .unwrap();
        let (events, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let folder = store
            .open_folder(name, OpenMode::ReadWrite, events)
            .await
            .unwrap();
        (store, folder)
    }

    /// Inserts a local row as if reconciled earlier.
    pub async fn mirrored(
        &self,
        account: AccountId,
        folder: FolderId,
        uid: Option<u32>,
        msgid: &str,
    ) -> mailmirror_core::MessageId {
        self.mirror
            .insert_message(&NewMessage {
                account: Some(account),
                folder,
                uid,
                msgid: Some(msgid.to_string()),
                subject: Some(format!("Subject of {msgid}")),
                received: Utc::now(),
                ..NewMessage::default()
            })
            .await
            .unwrap()
    }
}

/// Polls `check` until it holds, failing after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
