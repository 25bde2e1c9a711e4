//! Error types for the core library.

use thiserror::Error;

use crate::protocol::{ProtocolError, ProtocolErrorKind};
use crate::store::{AccountId, FolderId, MessageId, OperationKind};

/// How a fault is handled by the queue processor and the account session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The target no longer exists or the transport rejected a send.
    /// The operation is dropped.
    Permanent,
    /// A network timeout wrapping a messaging fault. The operation stays
    /// queued and is retried on the next pass.
    RecoverableTimeout,
    /// Authentication, closed store or folder, socket or TLS failure.
    /// Escalates to reconnect with backoff.
    Connection,
    /// A uid-dependent operation was queued against a message without uid.
    Contract,
    /// Anything else. Escalates to reconnect with backoff.
    Other,
}

impl FaultKind {
    /// Returns true if faults of this kind are expected under normal network
    /// flakiness and must not produce a user-visible error event.
    #[must_use]
    pub const fn is_quiet(self) -> bool {
        matches!(self, Self::Connection | Self::RecoverableTimeout)
    }
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol adapter or transport failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Folder not found in the mirror.
    #[error("Folder not found: {0}")]
    FolderNotFound(FolderId),

    /// Message not found in the mirror.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Attachment not found in the mirror.
    #[error("Attachment {sequence} of message {message} not found")]
    AttachmentNotFound {
        /// Owning message.
        message: MessageId,
        /// 1-based attachment position.
        sequence: u32,
    },

    /// A uid-dependent operation targets a message that has no uid.
    #[error("{operation} without uid for message {message}")]
    MissingUid {
        /// The queued operation.
        operation: OperationKind,
        /// The uid-less message.
        message: MessageId,
    },

    /// Malformed queued operation (unknown name or bad arguments).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classifies this error for the queue processor and session loops.
    #[must_use]
    pub const fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Protocol(e) => e.fault_kind(),
            Self::AccountNotFound(_)
            | Self::FolderNotFound(_)
            | Self::MessageNotFound(_)
            | Self::AttachmentNotFound { .. } => FaultKind::Permanent,
            Self::MissingUid { .. } => FaultKind::Contract,
            Self::Database(_)
            | Self::Serde(_)
            | Self::Io(_)
            | Self::InvalidOperation(_)
            | Self::Config(_) => FaultKind::Other,
        }
    }

    /// Returns true if the transport rejected an outgoing message.
    #[must_use]
    pub const fn is_send_rejected(&self) -> bool {
        matches!(self, Self::Protocol(e) if matches!(e.kind, ProtocolErrorKind::SendRejected))
    }

    /// Returns true if this error reports the remote message as gone.
    #[must_use]
    pub const fn is_message_removed(&self) -> bool {
        matches!(self, Self::Protocol(e) if matches!(e.kind, ProtocolErrorKind::MessageRemoved))
    }

    /// Returns true if a user-visible error event should be emitted.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        match self.fault_kind() {
            FaultKind::Permanent => self.is_send_rejected(),
            kind => !kind.is_quiet(),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
