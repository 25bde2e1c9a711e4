//! Data exchanged with protocol adapters.

use chrono::{DateTime, Utc};

use crate::store::{Attachment, Message};

/// A folder as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolderInfo {
    /// Full server-side name.
    pub name: String,
    /// Whether the folder can hold messages.
    pub selectable: bool,
}

impl RemoteFolderInfo {
    /// A selectable folder.
    pub fn selectable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selectable: true,
        }
    }
}

/// Access mode for an opened folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
}

/// A settable message flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFlag {
    /// Seen.
    Seen,
    /// Flagged.
    Flagged,
    /// Marked for expunge.
    Deleted,
}

/// Flags reported by the server for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteFlags {
    /// Seen flag.
    pub seen: bool,
    /// Flagged flag.
    pub flagged: bool,
    /// Deleted flag.
    pub deleted: bool,
}

/// Attachment descriptor reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAttachment {
    /// File name.
    pub name: Option<String>,
    /// MIME type.
    pub mime_type: String,
    /// Content-ID.
    pub cid: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
}

/// Envelope and structure of a server message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Message-ID header value.
    pub message_id: Option<String>,
    /// References header values, in order.
    pub references: Vec<String>,
    /// In-Reply-To header value.
    pub in_reply_to: Option<String>,
    /// Delivered-To header value.
    pub delivered_to: Option<String>,
    /// Server thread id.
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
    /// Date header.
    pub sent: Option<DateTime<Utc>>,
    /// Attachment descriptors.
    pub attachments: Vec<RemoteAttachment>,
}

/// A server message as seen through a [`RemoteFolder`](super::RemoteFolder).
///
/// `metadata` is only present after
/// [`fetch_metadata`](super::RemoteFolder::fetch_metadata).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMessage {
    /// Server uid.
    pub uid: u32,
    /// The server has expunged this message.
    pub expunged: bool,
    /// Current flags.
    pub flags: RemoteFlags,
    /// Envelope, when fetched.
    pub metadata: Option<RemoteMetadata>,
}

/// Attachment content handed to an adapter for append or send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    /// File name.
    pub name: Option<String>,
    /// MIME type.
    pub mime_type: String,
    /// Content-ID.
    pub cid: Option<String>,
    /// Content.
    pub data: Vec<u8>,
}

/// A mirrored message rendered for the wire.
///
/// Adapters own the MIME encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Message-ID header value.
    pub message_id: Option<String>,
    /// References header value.
    pub references: Option<String>,
    /// In-Reply-To header value.
    pub in_reply_to: Option<String>,
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
    /// Body text.
    pub body: String,
    /// Time the message was sent, if it was.
    pub sent: Option<DateTime<Utc>>,
    /// Whether the seen flag should be set on append.
    pub seen: bool,
    /// Attachments with content.
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingMessage {
    /// Builds the wire form of a mirrored message.
    ///
    /// `attachments` pairs each descriptor with its downloaded content;
    /// descriptors without content are skipped.
    #[must_use]
    pub fn from_mirror(message: &Message, attachments: Vec<(Attachment, Vec<u8>)>) -> Self {
        Self {
            message_id: message.msgid.clone(),
            references: message.references.clone(),
            in_reply_to: message.in_reply_to.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            cc: message.cc.clone(),
            bcc: message.bcc.clone(),
            reply_to: message.reply_to.clone(),
            subject: message.subject.clone(),
            body: message.body.clone().unwrap_or_default(),
            sent: message.sent,
            seen: message.ui_seen,
            attachments: attachments
                .into_iter()
                .map(|(attachment, data)| OutgoingAttachment {
                    name: attachment.name,
                    mime_type: attachment.mime_type,
                    cid: attachment.cid,
                    data,
                })
                .collect(),
        }
    }
}

/// Notifications raised by an open store connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A server alert or notice for the user.
    Notification(String),
    /// A folder was renamed on the server.
    FolderRenamed {
        /// Old name.
        from: String,
        /// New name.
        to: String,
    },
    /// A folder was created on the server.
    FolderCreated(String),
    /// A folder was deleted on the server.
    FolderDeleted(String),
    /// The connection dropped.
    Disconnected(String),
}

/// Notifications raised by an open folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEvent {
    /// New messages arrived.
    MessagesAdded(Vec<u32>),
    /// Messages were expunged.
    MessagesRemoved(Vec<u32>),
    /// Flags of a message changed.
    MessageChanged(u32),
}
