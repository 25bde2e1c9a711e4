//! Boundary between the sync engine and the wire protocols.
//!
//! The engine never speaks IMAP or SMTP itself. A host plugs in a
//! [`ProtocolAdapter`] for the message store and a [`Transport`] for
//! outgoing mail; both report failures as [`ProtocolError`].

mod error;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

pub use error::{ProtocolError, ProtocolErrorKind};
pub use types::{
    FolderEvent, OpenMode, OutgoingAttachment, OutgoingMessage, RemoteAttachment, RemoteFlag,
    RemoteFlags, RemoteFolderInfo, RemoteMessage, RemoteMetadata, StoreEvent,
};

use crate::store::Account;

/// Result of a protocol call.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Opens store connections for accounts.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Connects and authenticates. Store-level notifications are delivered
    /// on `events` until the store is closed.
    async fn connect(
        &self,
        account: &Account,
        events: UnboundedSender<StoreEvent>,
    ) -> ProtocolResult<Arc<dyn RemoteStore>>;
}

/// An authenticated connection to a message store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether folders support a server push wait (IDLE).
    fn has_push_wait(&self) -> bool;

    /// Whether the server moves messages natively.
    fn has_native_move(&self) -> bool;

    /// Whether the connection is still alive.
    fn is_connected(&self) -> bool;

    /// Lists all folders.
    async fn list_folders(&self) -> ProtocolResult<Vec<RemoteFolderInfo>>;

    /// Opens a folder. Folder-level notifications are delivered on `events`
    /// until the folder is closed.
    async fn open_folder(
        &self,
        name: &str,
        mode: OpenMode,
        events: UnboundedSender<FolderEvent>,
    ) -> ProtocolResult<Arc<dyn RemoteFolder>>;

    /// Appends a message to a folder that is not necessarily open.
    async fn append_to(&self, folder: &str, message: &OutgoingMessage) -> ProtocolResult<()>;

    /// Closes the connection and every folder opened through it.
    async fn close(&self) -> ProtocolResult<()>;
}

/// An open folder.
#[async_trait]
pub trait RemoteFolder: Send + Sync {
    /// Server-side name.
    fn name(&self) -> &str;

    /// Whether the folder is still open.
    fn is_open(&self) -> bool;

    /// Uids and flags of messages received since `since`, ascending by uid.
    async fn search_since(&self, since: DateTime<Utc>) -> ProtocolResult<Vec<RemoteMessage>>;

    /// Uids, flags and metadata of the given messages. Missing uids are
    /// left out.
    async fn fetch_metadata(&self, uids: &[u32]) -> ProtocolResult<Vec<RemoteMessage>>;

    /// Uids and flags of the given messages. Missing uids are left out.
    async fn fetch_flags(&self, uids: &[u32]) -> ProtocolResult<Vec<RemoteMessage>>;

    /// Sets or clears a flag. Fails with
    /// [`ProtocolErrorKind::MessageRemoved`] if the message is gone.
    async fn set_flag(&self, uid: u32, flag: RemoteFlag, value: bool) -> ProtocolResult<()>;

    /// Appends a message to this folder and returns its new uid.
    async fn append(&self, message: &OutgoingMessage) -> ProtocolResult<u32>;

    /// Moves a message natively.
    async fn move_to(&self, uid: u32, target: &str) -> ProtocolResult<()>;

    /// Removes messages marked deleted.
    async fn expunge(&self) -> ProtocolResult<()>;

    /// Raw header block.
    async fn fetch_headers(&self, uid: u32) -> ProtocolResult<String>;

    /// Body text.
    async fn fetch_body(&self, uid: u32) -> ProtocolResult<String>;

    /// Content of the attachment at `sequence` (1-based).
    async fn fetch_attachment(&self, uid: u32, sequence: u32) -> ProtocolResult<Vec<u8>>;

    /// Blocks until the server reports a change, delivering it on the
    /// folder's event channel. Fails with
    /// [`ProtocolErrorKind::FolderClosed`] once the folder is closed.
    async fn idle(&self) -> ProtocolResult<()>;

    /// Closes the folder.
    async fn close(&self) -> ProtocolResult<()>;
}

/// Outgoing mail transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submits a message.
    async fn send(&self, account: &Account, message: &OutgoingMessage) -> ProtocolResult<()>;

    /// Refreshes credentials after an authentication failure.
    async fn reauthenticate(&self, account: &Account) -> ProtocolResult<()>;
}
