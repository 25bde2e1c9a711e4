//! Mirror model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl $name {
            /// Wraps a raw row id.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Unique identifier for an account.
    AccountId
);
row_id!(
    /// Unique identifier for a mirrored folder.
    FolderId
);
row_id!(
    /// Unique identifier for a mirrored message.
    MessageId
);
row_id!(
    /// Unique identifier for an attachment row.
    AttachmentId
);
row_id!(
    /// Unique identifier for a queued operation.
    OperationId
);

/// Security/encryption mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Security {
    /// No encryption.
    None,
    /// Implicit TLS.
    #[default]
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

impl Security {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::StartTls => "starttls",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "starttls" => Self::StartTls,
            _ => Self::Tls,
        }
    }
}

/// Endpoint and credentials for one server (store or transport).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
}

/// Transient connection state of an account or folder.
///
/// Never persisted across restarts: every session start clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Connecting or opening.
    Connecting,
    /// Connected or open.
    Connected,
    /// Reconciling the message window.
    Syncing,
    /// Fetching bodies and attachments.
    Downloading,
    /// Tearing down.
    Closing,
}

impl SyncState {
    /// Returns the stored name of this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Downloading => "downloading",
            Self::Closing => "closing",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "syncing" => Some(Self::Syncing),
            "downloading" => Some(Self::Downloading),
            "closing" => Some(Self::Closing),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote mail account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Row id.
    pub id: AccountId,
    /// Display name.
    pub name: String,
    /// Primary address, used as sender for outgoing mail.
    pub email: String,
    /// Message store endpoint.
    pub store: ServerConfig,
    /// Outgoing transport endpoint.
    pub transport: ServerConfig,
    /// Whether this account is synchronized at all.
    pub synchronize: bool,
    /// Keepalive interval in minutes.
    pub poll_interval: u32,
    /// Whether sent messages are relocated into the Sent folder.
    pub store_sent: bool,
    /// Transient connection state.
    pub state: Option<SyncState>,
    /// Last recorded error.
    pub error: Option<String>,
}

/// Role of a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FolderType {
    /// The inbox.
    Inbox,
    /// Sent mail.
    Sent,
    /// Trash.
    Trash,
    /// Archive. Messages found here never claim a Message-ID for threading.
    Archive,
    /// Drafts.
    Drafts,
    /// The local outbox. Has no account.
    Outbox,
    /// Any other folder.
    User,
}

impl FolderType {
    /// Returns the stored name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Trash => "trash",
            Self::Archive => "archive",
            Self::Drafts => "drafts",
            Self::Outbox => "outbox",
            Self::User => "user",
        }
    }

    /// Parses a stored name; unknown names map to [`FolderType::User`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => Self::Inbox,
            "sent" => Self::Sent,
            "trash" => Self::Trash,
            "archive" => Self::Archive,
            "drafts" => Self::Drafts,
            "outbox" => Self::Outbox,
            _ => Self::User,
        }
    }
}

/// A mirrored folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Row id.
    pub id: FolderId,
    /// Owning account; `None` only for the outbox.
    pub account: Option<AccountId>,
    /// Server-side full name.
    pub name: String,
    /// Folder role.
    pub folder_type: FolderType,
    /// Whether this folder is kept in sync.
    pub synchronize: bool,
    /// Retention window in days.
    pub after: u32,
    /// Transient state.
    pub state: Option<SyncState>,
    /// Last recorded error.
    pub error: Option<String>,
}

/// A folder about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFolder {
    /// Owning account; `None` only for the outbox.
    pub account: Option<AccountId>,
    /// Server-side full name.
    pub name: String,
    /// Folder role.
    pub folder_type: FolderType,
    /// Whether this folder is kept in sync.
    pub synchronize: bool,
    /// Retention window in days.
    pub after: u32,
}

/// A mirrored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Row id.
    pub id: MessageId,
    /// Owning account; `None` for outbox drafts without identity.
    pub account: Option<AccountId>,
    /// Containing folder.
    pub folder: FolderId,
    /// Server uid; `None` until the message exists on the server.
    pub uid: Option<u32>,
    /// Message-ID header value.
    pub msgid: Option<String>,
    /// Space separated References header values.
    pub references: Option<String>,
    /// In-Reply-To header value.
    pub in_reply_to: Option<String>,
    /// Delivered-To header value.
    pub delivered_to: Option<String>,
    /// Thread id supplied by the protocol layer.
    pub thread: Option<String>,
    /// Sender addresses.
    pub from: Vec<String>,
    /// Recipients.
    pub to: Vec<String>,
    /// Carbon copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<String>,
    /// Reply-To addresses.
    pub reply_to: Vec<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Size in bytes as reported by the server.
    pub size: Option<u64>,
    /// Whether the body has been downloaded.
    pub content: bool,
    /// Body text, once downloaded.
    pub body: Option<String>,
    /// Raw headers, once fetched on demand.
    pub headers: Option<String>,
    /// Server receive time.
    pub received: DateTime<Utc>,
    /// Time the message was sent by us.
    pub sent: Option<DateTime<Utc>>,
    /// Committed seen flag.
    pub seen: bool,
    /// Committed flagged flag.
    pub flagged: bool,
    /// Intended seen flag.
    pub ui_seen: bool,
    /// Intended flagged flag.
    pub ui_flagged: bool,
    /// Hidden pending a queued move or delete.
    pub ui_hide: bool,
    /// Excluded from notifications.
    pub ui_ignored: bool,
    /// Last error recorded while processing this message.
    pub error: Option<String>,
}

/// A message about to be inserted by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewMessage {
    /// Owning account.
    pub account: Option<AccountId>,
    /// Containing folder.
    pub folder: FolderId,
    /// Server uid.
    pub uid: Option<u32>,
    /// Message-ID header value.
    pub msgid: Option<String>,
    /// Space separated References header values.
    pub references: Option<String>,
    /// In-Reply-To header value.
    pub in_reply_to: Option<String>,
    /// Delivered-To header value.
    pub delivered_to: Option<String>,
    /// Thread id supplied by the protocol layer.
    pub thread: Option<String>,
    /// Sender addresses.
    pub from: Vec<String>,
    /// Recipients.
    pub to: Vec<String>,
    /// Carbon copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<String>,
    /// Reply-To addresses.
    pub reply_to: Vec<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Server receive time.
    pub received: DateTime<Utc>,
    /// Time the message was sent.
    pub sent: Option<DateTime<Utc>>,
    /// Committed seen flag; the intended flag starts equal.
    pub seen: bool,
    /// Committed flagged flag.
    pub flagged: bool,
    /// Attachment descriptors in server order.
    pub attachments: Vec<NewAttachment>,
}

/// An attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Row id.
    pub id: AttachmentId,
    /// Owning message.
    pub message: MessageId,
    /// 1-based position within the message.
    pub sequence: u32,
    /// File name.
    pub name: Option<String>,
    /// MIME type.
    pub mime_type: String,
    /// Content-ID.
    pub cid: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Whether the content has been downloaded.
    pub available: bool,
}

/// An attachment descriptor about to be inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewAttachment {
    /// File name.
    pub name: Option<String>,
    /// MIME type.
    pub mime_type: String,
    /// Content-ID.
    pub cid: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
}

/// Kind of a queued remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Set or clear the seen flag. Args: `[seen: bool]`.
    Seen,
    /// Set or clear the flagged flag. Args: `[flagged: bool]`.
    Flag,
    /// Append the local message to its folder.
    Add,
    /// Move to another folder. Args: `[target folder id]`.
    Move,
    /// Delete on the server and locally.
    Delete,
    /// Submit through the outgoing transport.
    Send,
    /// Fetch raw headers.
    Headers,
    /// Fetch the body.
    Body,
    /// Fetch one attachment. Args: `[sequence]`.
    Attachment,
}

impl OperationKind {
    /// Returns the stored name of this operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Flag => "flag",
            Self::Add => "add",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Send => "send",
            Self::Headers => "headers",
            Self::Body => "body",
            Self::Attachment => "attachment",
        }
    }

    /// Whether processing this operation requires a server uid.
    #[must_use]
    pub const fn requires_uid(self) -> bool {
        matches!(self, Self::Seen | Self::Delete | Self::Move | Self::Headers)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "seen" => Self::Seen,
            "flag" => Self::Flag,
            "add" => Self::Add,
            "move" => Self::Move,
            "delete" => Self::Delete,
            "send" => Self::Send,
            "headers" => Self::Headers,
            "body" => Self::Body,
            "attachment" => Self::Attachment,
            other => return Err(Error::InvalidOperation(format!("unknown operation {other}"))),
        })
    }
}

/// A queued remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Row id; queue order is ascending id.
    pub id: OperationId,
    /// Folder whose queue holds this operation.
    pub folder: FolderId,
    /// Target message.
    pub message: MessageId,
    /// Stored operation name.
    pub name: String,
    /// Ordered arguments.
    pub args: Vec<serde_json::Value>,
    /// Enqueue time.
    pub created: DateTime<Utc>,
}

impl Operation {
    /// Parses the stored name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for an unknown name.
    pub fn kind(&self) -> Result<OperationKind> {
        self.name.parse()
    }

    /// Reads a boolean argument.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the argument is missing or not a boolean.
    pub fn bool_arg(&self, index: usize) -> Result<bool> {
        self.args
            .get(index)
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| self.bad_arg(index))
    }

    /// Reads an integer argument.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if the argument is missing or not an integer.
    pub fn int_arg(&self, index: usize) -> Result<i64> {
        self.args
            .get(index)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| self.bad_arg(index))
    }

    fn bad_arg(&self, index: usize) -> Error {
        Error::InvalidOperation(format!(
            "{} #{}: argument {index} missing or malformed",
            self.name, self.id
        ))
    }
}

/// Changes to the intended (`ui_*`) flags of one message.
///
/// `None` leaves a flag untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowUpdate {
    /// New intended seen flag.
    pub ui_seen: Option<bool>,
    /// New intended flagged flag.
    pub ui_flagged: Option<bool>,
    /// New hidden flag.
    pub ui_hide: Option<bool>,
    /// New ignored flag.
    pub ui_ignored: Option<bool>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_parse_back() {
        for kind in [
            OperationKind::Seen,
            OperationKind::Flag,
            OperationKind::Add,
            OperationKind::Move,
            OperationKind::Delete,
            OperationKind::Send,
            OperationKind::Headers,
            OperationKind::Body,
            OperationKind::Attachment,
        ] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("purge".parse::<OperationKind>().is_err());
    }

    #[test]
    fn uid_requirement() {
        assert!(OperationKind::Seen.requires_uid());
        assert!(OperationKind::Move.requires_uid());
        assert!(!OperationKind::Add.requires_uid());
        assert!(!OperationKind::Send.requires_uid());
    }

    #[test]
    fn typed_arguments() {
        let op = Operation {
            id: OperationId(7),
            folder: FolderId(1),
            message: MessageId(2),
            name: "move".to_string(),
            args: vec![serde_json::json!(12), serde_json::json!(true)],
            created: Utc::now(),
        };
        assert_eq!(op.int_arg(0).unwrap(), 12);
        assert!(op.bool_arg(1).unwrap());
        assert!(op.bool_arg(0).is_err());
        assert!(op.int_arg(5).is_err());
    }

    #[test]
    fn unknown_folder_type_is_user() {
        assert_eq!(FolderType::parse("junk"), FolderType::User);
        assert_eq!(FolderType::parse(FolderType::Archive.as_str()), FolderType::Archive);
    }

    #[test]
    fn sync_state_names() {
        assert_eq!(SyncState::parse("downloading"), Some(SyncState::Downloading));
        assert_eq!(SyncState::parse(""), None);
        assert_eq!(SyncState::Closing.to_string(), "closing");
    }
}
