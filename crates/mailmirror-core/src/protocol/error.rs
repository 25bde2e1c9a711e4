//! Faults raised by protocol adapters and transports.

use thiserror::Error;

use crate::error::FaultKind;

/// Category of a protocol-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The message no longer exists on the server.
    MessageRemoved,
    /// The folder does not exist on the server.
    FolderNotFound,
    /// The outgoing transport refused the message.
    SendRejected,
    /// A read or connect timed out.
    Timeout,
    /// Login was refused.
    Authentication,
    /// The store connection was closed.
    StoreClosed,
    /// The folder was closed, usually as a side effect of closing the store.
    FolderClosed,
    /// Socket-level failure.
    Socket,
    /// TLS handshake or certificate failure.
    Tls,
    /// DNS resolution failed.
    UnknownHost,
    /// Could not establish the connection.
    ConnectFailed,
    /// Anything the adapter cannot classify.
    Other,
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MessageRemoved => "message removed",
            Self::FolderNotFound => "folder not found",
            Self::SendRejected => "send failed",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication failed",
            Self::StoreClosed => "store closed",
            Self::FolderClosed => "folder closed",
            Self::Socket => "socket error",
            Self::Tls => "TLS error",
            Self::UnknownHost => "unknown host",
            Self::ConnectFailed => "connection failure",
            Self::Other => "protocol error",
        };
        f.write_str(name)
    }
}

/// A fault reported by a [`RemoteStore`](super::RemoteStore), a
/// [`RemoteFolder`](super::RemoteFolder) or a [`Transport`](super::Transport).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    /// Failure category.
    pub kind: ProtocolErrorKind,
    /// Adapter-supplied detail.
    pub message: String,
}

impl ProtocolError {
    /// Creates an error of the given kind.
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The message is gone from the server.
    pub fn removed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::MessageRemoved, message)
    }

    /// The folder is gone from the server.
    pub fn folder_not_found(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::FolderNotFound, message)
    }

    /// The transport refused the message.
    pub fn send_rejected(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::SendRejected, message)
    }

    /// A network timeout.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Timeout, message)
    }

    /// Login refused.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Authentication, message)
    }

    /// The store connection is closed.
    pub fn store_closed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::StoreClosed, message)
    }

    /// The folder is closed.
    pub fn folder_closed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::FolderClosed, message)
    }

    /// DNS lookup failed.
    pub fn unknown_host(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::UnknownHost, message)
    }

    /// Connecting failed.
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::ConnectFailed, message)
    }

    /// Unclassified failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::Other, message)
    }

    /// Maps the adapter category onto the handling policy.
    #[must_use]
    pub const fn fault_kind(&self) -> FaultKind {
        match self.kind {
            ProtocolErrorKind::MessageRemoved
            | ProtocolErrorKind::FolderNotFound
            | ProtocolErrorKind::SendRejected => FaultKind::Permanent,
            ProtocolErrorKind::Timeout => FaultKind::RecoverableTimeout,
            ProtocolErrorKind::Authentication
            | ProtocolErrorKind::StoreClosed
            | ProtocolErrorKind::FolderClosed
            | ProtocolErrorKind::Socket
            | ProtocolErrorKind::Tls
            | ProtocolErrorKind::UnknownHost
            | ProtocolErrorKind::ConnectFailed => FaultKind::Connection,
            ProtocolErrorKind::Other => FaultKind::Other,
        }
    }
}
