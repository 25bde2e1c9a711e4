//! Draining a folder's operation queue against the server.

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::SyncContext;
use crate::error::FaultKind;
use crate::events::{SyncEvent, WorkRequest};
use crate::protocol::{
    OutgoingMessage, ProtocolError, ProtocolErrorKind, RemoteFlag, RemoteFolder, RemoteStore,
};
use crate::store::{Folder, FolderId, FolderType, Message, Operation, OperationKind};
use crate::{Error, Result};

/// Result of draining one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    /// Operations applied and removed.
    pub executed: usize,
    /// Operations removed after a permanent fault.
    pub dropped: usize,
    /// The pass stopped on a timeout; the rest stays queued.
    pub deferred: bool,
}

/// The open connection a queue is drained against. The outbox has none.
#[derive(Clone, Copy)]
pub struct RemoteHandles<'a> {
    /// The store connection.
    pub store: &'a dyn RemoteStore,
    /// The open folder owning the queue.
    pub folder: &'a dyn RemoteFolder,
}

/// Applies the queued operations of `folder` in order.
///
/// Runs inside `lock`, the account's critical section. Each operation is
/// removed once applied. A permanent fault records the error on the
/// message, drops the operation and moves on; a timeout stops the pass and
/// leaves the rest queued; any other fault is recorded on the message and
/// the folder and returned.
///
/// # Errors
///
/// Returns the first fault that is neither permanent nor a timeout.
pub async fn process_operations(
    ctx: &SyncContext,
    folder: &Folder,
    remote: Option<RemoteHandles<'_>>,
    lock: &Mutex<()>,
) -> Result<QueueOutcome> {
    let _lease = ctx.lease(format!("folder.{}.operations", folder.id));
    let _guard = lock.lock().await;
    let mirror = ctx.mirror.as_ref();
    let mut outcome = QueueOutcome::default();

    let operations = mirror.operations(folder.id).await?;
    if !operations.is_empty() {
        debug!("{}: {} operations queued", folder.name, operations.len());
    }

    for operation in operations {
        let Some(message) = mirror.message(operation.message).await? else {
            warn!(
                "{}: {} #{} targets missing message {}",
                folder.name, operation.name, operation.id, operation.message
            );
            mirror.delete_operation(operation.id).await?;
            outcome.dropped += 1;
            continue;
        };

        mirror.set_message_error(message.id, None).await?;

        match execute(ctx, folder, remote, &operation, &message).await {
            Ok(()) => {
                mirror.delete_operation(operation.id).await?;
                outcome.executed += 1;
            }
            Err(err) => {
                let text = err.to_string();
                mirror.set_message_error(message.id, Some(&text)).await?;
                match err.fault_kind() {
                    FaultKind::Permanent => {
                        ctx.events.report(None, Some(&folder.name), &err);
                        mirror.delete_operation(operation.id).await?;
                        outcome.dropped += 1;
                    }
                    FaultKind::RecoverableTimeout => {
                        warn!("{}: {} #{}: {err}", folder.name, operation.name, operation.id);
                        outcome.deferred = true;
                        return Ok(outcome);
                    }
                    FaultKind::Connection | FaultKind::Contract | FaultKind::Other => {
                        mirror.set_folder_error(folder.id, Some(&text)).await?;
                        return Err(err);
                    }
                }
            }
        }
    }

    Ok(outcome)
}

async fn execute(
    ctx: &SyncContext,
    folder: &Folder,
    remote: Option<RemoteHandles<'_>>,
    operation: &Operation,
    message: &Message,
) -> Result<()> {
    let kind = operation.kind()?;
    debug!(
        "{}: {kind} message {} args {:?}",
        folder.name, message.id, operation.args
    );

    if kind.requires_uid() && message.uid.is_none() {
        return Err(Error::MissingUid {
            operation: kind,
            message: message.id,
        });
    }

    let on_server = || {
        remote.ok_or_else(|| {
            Error::InvalidOperation(format!("{kind} queued in local folder {}", folder.name))
        })
    };

    match kind {
        OperationKind::Send => send(ctx, message).await,
        OperationKind::Seen => {
            seen(ctx, on_server()?.folder, message, operation.bool_arg(0)?).await
        }
        OperationKind::Flag => {
            flag(ctx, on_server()?.folder, message, operation.bool_arg(0)?).await
        }
        OperationKind::Add => add(ctx, on_server()?.folder, message).await,
        OperationKind::Move => {
            let target = FolderId(operation.int_arg(0)?);
            move_message(ctx, folder, on_server()?, message, target).await
        }
        OperationKind::Delete => delete(ctx, on_server()?.folder, message).await,
        OperationKind::Headers => headers(ctx, on_server()?.folder, message).await,
        OperationKind::Body => body(ctx, on_server()?.folder, message).await,
        OperationKind::Attachment => {
            let sequence = u32::try_from(operation.int_arg(0)?).map_err(|_| {
                Error::InvalidOperation(format!("attachment #{}: bad sequence", operation.id))
            })?;
            attachment(ctx, on_server()?.folder, message, sequence).await
        }
    }
}

fn server_uid(message: &Message) -> Result<u32> {
    message.uid.ok_or_else(|| {
        ProtocolError::removed(format!("message {} is not on the server", message.id)).into()
    })
}

/// Wire form of a mirrored message, with every downloaded attachment.
async fn outgoing(ctx: &SyncContext, message: &Message) -> Result<OutgoingMessage> {
    let mut attachments = Vec::new();
    for attachment in ctx.mirror.attachments(message.id).await? {
        if !attachment.available {
            continue;
        }
        if let Some(data) = ctx.mirror.attachment_content(attachment.id).await? {
            attachments.push((attachment, data));
        }
    }
    Ok(OutgoingMessage::from_mirror(message, attachments))
}

async fn seen(
    ctx: &SyncContext,
    remote: &dyn RemoteFolder,
    message: &Message,
    seen: bool,
) -> Result<()> {
    if message.seen == seen {
        return Ok(());
    }
    remote
        .set_flag(server_uid(message)?, RemoteFlag::Seen, seen)
        .await?;
    ctx.mirror.set_message_seen(message.id, seen).await
}

async fn flag(
    ctx: &SyncContext,
    remote: &dyn RemoteFolder,
    message: &Message,
    flagged: bool,
) -> Result<()> {
    if message.flagged == flagged {
        return Ok(());
    }
    remote
        .set_flag(server_uid(message)?, RemoteFlag::Flagged, flagged)
        .await?;
    ctx.mirror.set_message_flagged(message.id, flagged).await
}

async fn add(ctx: &SyncContext, remote: &dyn RemoteFolder, message: &Message) -> Result<()> {
    let wire = outgoing(ctx, message).await?;
    let uid = remote.append(&wire).await?;
    ctx.mirror.set_message_uid(message.id, Some(uid)).await?;
    debug!("{}: message {} appended as uid {uid}", remote.name(), message.id);

    if let Some(previous) = message.uid.filter(|previous| *previous != uid) {
        match remote.set_flag(previous, RemoteFlag::Deleted, true).await {
            Ok(()) => remote.expunge().await?,
            Err(e) if e.kind == ProtocolErrorKind::MessageRemoved => {
                debug!("{}: previous uid {previous} already gone", remote.name());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn move_message(
    ctx: &SyncContext,
    folder: &Folder,
    remote: RemoteHandles<'_>,
    message: &Message,
    target: FolderId,
) -> Result<()> {
    let uid = server_uid(message)?;
    let target = ctx
        .mirror
        .folder(target)
        .await?
        .ok_or(Error::FolderNotFound(target))?;

    if remote.store.has_native_move() {
        remote.folder.move_to(uid, &target.name).await?;
        return Ok(());
    }

    let wire = outgoing(ctx, message).await?;
    remote.store.append_to(&target.name, &wire).await?;
    if folder.folder_type != FolderType::Archive {
        remote.folder.set_flag(uid, RemoteFlag::Deleted, true).await?;
        remote.folder.expunge().await?;
    }
    Ok(())
}

async fn delete(ctx: &SyncContext, remote: &dyn RemoteFolder, message: &Message) -> Result<()> {
    remote
        .set_flag(server_uid(message)?, RemoteFlag::Deleted, true)
        .await?;
    remote.expunge().await?;
    ctx.mirror.delete_message(message.id).await
}

async fn headers(ctx: &SyncContext, remote: &dyn RemoteFolder, message: &Message) -> Result<()> {
    let headers = remote.fetch_headers(server_uid(message)?).await?;
    ctx.mirror.set_message_headers(message.id, &headers).await
}

async fn body(ctx: &SyncContext, remote: &dyn RemoteFolder, message: &Message) -> Result<()> {
    if message.content {
        return Ok(());
    }
    let body = remote.fetch_body(server_uid(message)?).await?;
    ctx.mirror.set_message_content(message.id, &body).await
}

async fn attachment(
    ctx: &SyncContext,
    remote: &dyn RemoteFolder,
    message: &Message,
    sequence: u32,
) -> Result<()> {
    let attachment = ctx
        .mirror
        .attachment(message.id, sequence)
        .await?
        .ok_or(Error::AttachmentNotFound {
            message: message.id,
            sequence,
        })?;
    if attachment.available {
        return Ok(());
    }
    let data = remote
        .fetch_attachment(server_uid(message)?, sequence)
        .await?;
    ctx.mirror
        .set_attachment_content(attachment.id, &data)
        .await
}

async fn send(ctx: &SyncContext, message: &Message) -> Result<()> {
    let account_id = message.account.ok_or_else(|| {
        ProtocolError::send_rejected(format!("message {} has no sending account", message.id))
    })?;
    let account = ctx
        .mirror
        .account(account_id)
        .await?
        .ok_or(Error::AccountNotFound(account_id))?;
    if !account.synchronize {
        return Err(
            ProtocolError::send_rejected(format!("account {} is disabled", account.name)).into(),
        );
    }

    let wire = outgoing(ctx, message).await?;
    match ctx.transport.send(&account, &wire).await {
        Ok(()) => {}
        Err(e) if e.kind == ProtocolErrorKind::Authentication => {
            info!("{}: reauthenticating transport", account.name);
            ctx.transport.reauthenticate(&account).await?;
            ctx.transport.send(&account, &wire).await?;
        }
        Err(e) => return Err(e.into()),
    }
    info!("{}: sent message {}", account.name, message.id);

    let sent = if account.store_sent {
        ctx.mirror
            .folder_by_type(account.id, FolderType::Sent)
            .await?
    } else {
        None
    };
    ctx.mirror
        .mark_sent(message.id, Utc::now(), sent.as_ref().map(|f| f.id))
        .await?;
    ctx.events.emit(SyncEvent::MessageSent {
        message: message.id,
    });

    if let Some(sent) = sent {
        ctx.dispatcher
            .dispatch_for(&sent, WorkRequest::process(sent.id));
    }
    Ok(())
}
