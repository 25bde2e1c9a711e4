//! The local mirror: accounts, folders, messages, attachments and the
//! per-folder operation queue.
//!
//! Every command on [`Mirror`] is atomic. Commands that touch several rows
//! (inserting a message with its attachments, relocating a sent message and
//! queueing its append, staging a UI intent with its operation) run in one
//! transaction.

mod model;
mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use model::{
    Account, AccountId, Attachment, AttachmentId, Folder, FolderId, FolderType, Message,
    MessageId, NewAttachment, NewFolder, NewMessage, Operation, OperationId, OperationKind,
    Security, ServerConfig, ShadowUpdate, SyncState,
};
pub use repository::SqliteMirror;

use crate::Result;

/// An operation to enqueue together with a [`ShadowUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Ordered arguments.
    pub args: Vec<serde_json::Value>,
}

impl QueuedOperation {
    /// Creates a queued operation.
    #[must_use]
    pub const fn new(kind: OperationKind, args: Vec<serde_json::Value>) -> Self {
        Self { kind, args }
    }
}

/// Narrow command interface over the persistent mirror.
///
/// The sync engine only ever talks to the mirror through this trait.
#[async_trait]
pub trait Mirror: Send + Sync {
    // Accounts

    /// Inserts an account and returns its id.
    async fn insert_account(&self, account: &Account) -> Result<AccountId>;
    /// Accounts with synchronization enabled.
    async fn synchronized_accounts(&self) -> Result<Vec<Account>>;
    /// Looks up an account.
    async fn account(&self, id: AccountId) -> Result<Option<Account>>;
    /// Sets the transient state of an account.
    async fn set_account_state(&self, id: AccountId, state: Option<SyncState>) -> Result<()>;
    /// Records or clears the account error.
    async fn set_account_error(&self, id: AccountId, error: Option<&str>) -> Result<()>;

    // Folders

    /// Inserts a folder and returns its id.
    async fn insert_folder(&self, folder: &NewFolder) -> Result<FolderId>;
    /// Looks up a folder.
    async fn folder(&self, id: FolderId) -> Result<Option<Folder>>;
    /// All folders of an account.
    async fn folders(&self, account: AccountId) -> Result<Vec<Folder>>;
    /// Folders of an account with synchronization enabled.
    async fn synchronized_folders(&self, account: AccountId) -> Result<Vec<Folder>>;
    /// Looks up a folder by server name.
    async fn folder_by_name(&self, account: AccountId, name: &str) -> Result<Option<Folder>>;
    /// Looks up the folder of an account with the given role.
    async fn folder_by_type(
        &self,
        account: AccountId,
        folder_type: FolderType,
    ) -> Result<Option<Folder>>;
    /// The local outbox.
    async fn outbox(&self) -> Result<Option<Folder>>;
    /// Inserts `added` and deletes the folders named in `removed`, atomically.
    async fn apply_folder_list(
        &self,
        account: AccountId,
        added: &[NewFolder],
        removed: &[String],
    ) -> Result<()>;
    /// Renames a folder. Returns the number of rows changed.
    async fn rename_folder(&self, account: AccountId, from: &str, to: &str) -> Result<u64>;
    /// Sets the transient state of a folder.
    async fn set_folder_state(&self, id: FolderId, state: Option<SyncState>) -> Result<()>;
    /// Records or clears the folder error.
    async fn set_folder_error(&self, id: FolderId, error: Option<&str>) -> Result<()>;
    /// Clears the transient state of every folder of an account.
    async fn clear_folder_states(&self, account: AccountId) -> Result<()>;

    // Messages

    /// Inserts a message with its attachments and returns its id.
    ///
    /// Attachments are numbered from 1; a repeated Content-ID is skipped.
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId>;
    /// Looks up a message.
    async fn message(&self, id: MessageId) -> Result<Option<Message>>;
    /// Looks up a message by server uid.
    async fn message_by_uid(&self, folder: FolderId, uid: u32) -> Result<Option<Message>>;
    /// Messages of an account whose Message-ID equals `msgid` or `reference`.
    async fn messages_by_msgid(
        &self,
        account: AccountId,
        msgid: &str,
        reference: &str,
    ) -> Result<Vec<Message>>;
    /// Moves an existing row onto a server message and clears its error.
    async fn reattach_message(
        &self,
        id: MessageId,
        folder: FolderId,
        uid: u32,
        msgid: Option<&str>,
        thread: Option<&str>,
    ) -> Result<()>;
    /// Commits remote flags: sets committed and intended seen/flagged and
    /// clears the hidden flag.
    async fn sync_flags(&self, id: MessageId, seen: bool, flagged: bool) -> Result<()>;
    /// Sets the committed seen flag.
    async fn set_message_seen(&self, id: MessageId, seen: bool) -> Result<()>;
    /// Sets the committed flagged flag.
    async fn set_message_flagged(&self, id: MessageId, flagged: bool) -> Result<()>;
    /// Sets the server uid.
    async fn set_message_uid(&self, id: MessageId, uid: Option<u32>) -> Result<()>;
    /// Records or clears the message error.
    async fn set_message_error(&self, id: MessageId, error: Option<&str>) -> Result<()>;
    /// Stores the body and marks the content available.
    async fn set_message_content(&self, id: MessageId, body: &str) -> Result<()>;
    /// Stores raw headers.
    async fn set_message_headers(&self, id: MessageId, headers: &str) -> Result<()>;
    /// Uids of rows received at or after `since`.
    async fn uids_since(&self, folder: FolderId, since: DateTime<Utc>) -> Result<Vec<u32>>;
    /// Deletes rows received before `before`. Returns the number deleted.
    async fn delete_messages_before(&self, folder: FolderId, before: DateTime<Utc>)
    -> Result<u64>;
    /// Deletes the row with the given uid. Returns the number deleted.
    async fn delete_message_by_uid(&self, folder: FolderId, uid: u32) -> Result<u64>;
    /// Deletes a message row.
    async fn delete_message(&self, id: MessageId) -> Result<()>;
    /// Marks a message sent and seen. With `relocate_to`, also moves it into
    /// that folder without uid and queues an `add` there, atomically.
    async fn mark_sent(
        &self,
        id: MessageId,
        sent: DateTime<Utc>,
        relocate_to: Option<FolderId>,
    ) -> Result<Option<OperationId>>;
    /// Unseen, visible, not ignored messages of an account.
    async fn unseen_count(&self, account: AccountId) -> Result<u64>;
    /// Applies `update` and enqueues `operation` against the message's
    /// folder, atomically.
    async fn stage(
        &self,
        message: MessageId,
        update: ShadowUpdate,
        operation: Option<QueuedOperation>,
    ) -> Result<Option<OperationId>>;
    /// Marks every unseen message ignored. Returns the number changed.
    async fn ignore_all(&self) -> Result<u64>;

    // Attachments

    /// Attachments of a message in sequence order.
    async fn attachments(&self, message: MessageId) -> Result<Vec<Attachment>>;
    /// Looks up one attachment.
    async fn attachment(&self, message: MessageId, sequence: u32) -> Result<Option<Attachment>>;
    /// Downloaded attachment bytes.
    async fn attachment_content(&self, id: AttachmentId) -> Result<Option<Vec<u8>>>;
    /// Stores attachment bytes and marks the attachment available.
    async fn set_attachment_content(&self, id: AttachmentId, data: &[u8]) -> Result<()>;

    // Operations

    /// Enqueues an operation against the message's folder.
    async fn enqueue(
        &self,
        message: MessageId,
        kind: OperationKind,
        args: Vec<serde_json::Value>,
    ) -> Result<OperationId>;
    /// Queued operations of a folder, oldest first.
    async fn operations(&self, folder: FolderId) -> Result<Vec<Operation>>;
    /// Number of queued operations of a folder.
    async fn operation_count(&self, folder: FolderId) -> Result<u64>;
    /// Removes a queued operation.
    async fn delete_operation(&self, id: OperationId) -> Result<()>;
}
