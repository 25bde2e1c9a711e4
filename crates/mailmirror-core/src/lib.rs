//! # mailmirror-core
//!
//! Mailbox synchronization engine.
//!
//! This crate provides:
//! - A local mirror of accounts, folders, messages and attachments (`SQLite`)
//! - A durable per-folder operation queue for local intents
//! - Account sessions that keep a store connection open, reconcile message
//!   windows and reconnect with exponential backoff
//! - An outbox session that submits queued sends
//! - A supervisor that starts and stops every session with the network
//!
//! Wire protocols are not implemented here. A host plugs them in through
//! the traits in [`protocol`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod actions;
pub mod config;
mod error;
pub mod events;
pub mod host;
pub mod protocol;
pub mod store;
pub mod sync;

pub use actions::Actions;
pub use config::SyncConfig;
pub use error::{Error, FaultKind, Result};
pub use events::{Dispatcher, ErrorReport, EventBus, Route, SyncEvent, WorkKind, WorkRequest};
pub use host::{Lease, Network, NoPower, PowerManager, StaticNetwork};
pub use protocol::{
    ProtocolAdapter, ProtocolError, ProtocolErrorKind, RemoteFolder, RemoteStore, Transport,
};
pub use store::{
    Account, AccountId, Folder, FolderId, FolderType, Message, MessageId, Mirror, SqliteMirror,
};
pub use sync::{Connectivity, Control, Supervisor, SyncContext};
