//! Local intents.
//!
//! Each intent updates the message's intended (`ui_`) flags and enqueues the
//! matching operation in one transaction, then asks the owning session to
//! drain the folder's queue. The committed flags only change once the
//! server has applied the operation.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::events::WorkRequest;
use crate::store::{
    FolderId, FolderType, Message, MessageId, OperationId, OperationKind, QueuedOperation,
    ShadowUpdate,
};
use crate::sync::SyncContext;
use crate::{Error, Result};

/// Entry point for user and notification intents.
#[derive(Clone)]
pub struct Actions {
    ctx: SyncContext,
}

impl Actions {
    /// Creates the intent API over a sync context.
    #[must_use]
    pub fn new(ctx: &SyncContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Marks a message seen from a notification: intended seen, ignored,
    /// and a `seen` operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageNotFound`] if the message does not exist, an
    /// [`Error::InvalidOperation`] if it has no uid or sits in the outbox, or
    /// a database error.
    pub async fn mark_seen(&self, id: MessageId) -> Result<OperationId> {
        let update = ShadowUpdate {
            ui_seen: Some(true),
            ui_ignored: Some(true),
            ..ShadowUpdate::default()
        };
        self.commit(id, update, OperationKind::Seen, vec![json!(true)])
            .await
    }

    /// Sets or clears the seen flag.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn set_seen(&self, id: MessageId, seen: bool) -> Result<OperationId> {
        let update = ShadowUpdate {
            ui_seen: Some(seen),
            ..ShadowUpdate::default()
        };
        self.commit(id, update, OperationKind::Seen, vec![json!(seen)])
            .await
    }

    /// Sets or clears the flagged flag.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn set_flagged(&self, id: MessageId, flagged: bool) -> Result<OperationId> {
        let update = ShadowUpdate {
            ui_flagged: Some(flagged),
            ..ShadowUpdate::default()
        };
        self.commit(id, update, OperationKind::Flag, vec![json!(flagged)])
            .await
    }

    /// Hides a message and moves it to the account's trash. Returns `None`
    /// without changing anything if the account has no trash folder.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn trash(&self, id: MessageId) -> Result<Option<OperationId>> {
        let message = self.message(id).await?;
        let Some(account) = message.account else {
            warn!("Message {id} has no account to trash into");
            return Ok(None);
        };
        let Some(trash) = self
            .ctx
            .mirror
            .folder_by_type(account, FolderType::Trash)
            .await?
        else {
            info!("Account {account} has no trash folder, message {id} kept");
            return Ok(None);
        };
        self.hide_and_move(id, trash.id).await.map(Some)
    }

    /// Hides a message and moves it to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FolderNotFound`] if `target` does not exist, or an
    /// [`Error::InvalidOperation`] if it belongs to another account.
    pub async fn move_to(&self, id: MessageId, target: FolderId) -> Result<OperationId> {
        let message = self.message(id).await?;
        let folder = self
            .ctx
            .mirror
            .folder(target)
            .await?
            .ok_or(Error::FolderNotFound(target))?;
        if folder.account != message.account {
            return Err(Error::InvalidOperation(format!(
                "cannot move message {id} to folder {} of another account",
                folder.name
            )));
        }
        self.hide_and_move(id, target).await
    }

    /// Hides a message and deletes it on the server.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn delete(&self, id: MessageId) -> Result<OperationId> {
        let update = ShadowUpdate {
            ui_hide: Some(true),
            ..ShadowUpdate::default()
        };
        self.commit(id, update, OperationKind::Delete, Vec::new())
            .await
    }

    /// Marks a message ignored, so it no longer counts as unseen. Nothing
    /// is sent to the server.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn ignore(&self, id: MessageId) -> Result<()> {
        let message = self.message(id).await?;
        let update = ShadowUpdate {
            ui_ignored: Some(true),
            ..ShadowUpdate::default()
        };
        self.ctx.mirror.stage(id, update, None).await?;
        self.ctx.refresh_unseen(message.account).await;
        Ok(())
    }

    /// Marks every unseen message ignored. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn ignore_all(&self) -> Result<u64> {
        let changed = self.ctx.mirror.ignore_all().await?;
        debug!("Ignored {changed} unseen messages");
        for account in self.ctx.mirror.synchronized_accounts().await? {
            self.ctx.refresh_unseen(Some(account.id)).await;
        }
        Ok(changed)
    }

    /// Queues an outbox message for sending.
    ///
    /// # Errors
    ///
    /// Returns an [`Error::InvalidOperation`] if the message is not in the
    /// outbox.
    pub async fn send(&self, id: MessageId) -> Result<OperationId> {
        let message = self.message(id).await?;
        let outbox = self.ctx.mirror.outbox().await?;
        if outbox.as_ref().map(|f| f.id) != Some(message.folder) {
            return Err(Error::InvalidOperation(format!(
                "message {id} is not in the outbox"
            )));
        }
        self.commit(id, ShadowUpdate::default(), OperationKind::Send, Vec::new())
            .await
    }

    /// Requests the body of a message.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn fetch_body(&self, id: MessageId) -> Result<OperationId> {
        self.commit(id, ShadowUpdate::default(), OperationKind::Body, Vec::new())
            .await
    }

    /// Requests the raw headers of a message.
    ///
    /// # Errors
    ///
    /// See [`Actions::mark_seen`].
    pub async fn fetch_headers(&self, id: MessageId) -> Result<OperationId> {
        self.commit(id, ShadowUpdate::default(), OperationKind::Headers, Vec::new())
            .await
    }

    /// Requests the content of one attachment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttachmentNotFound`] if the message has no
    /// attachment at `sequence`.
    pub async fn fetch_attachment(&self, id: MessageId, sequence: u32) -> Result<OperationId> {
        if self.ctx.mirror.attachment(id, sequence).await?.is_none() {
            return Err(Error::AttachmentNotFound {
                message: id,
                sequence,
            });
        }
        self.commit(
            id,
            ShadowUpdate::default(),
            OperationKind::Attachment,
            vec![json!(sequence)],
        )
        .await
    }

    async fn hide_and_move(&self, id: MessageId, target: FolderId) -> Result<OperationId> {
        let update = ShadowUpdate {
            ui_hide: Some(true),
            ..ShadowUpdate::default()
        };
        self.commit(id, update, OperationKind::Move, vec![json!(target.0)])
            .await
    }

    async fn message(&self, id: MessageId) -> Result<Message> {
        self.ctx
            .mirror
            .message(id)
            .await?
            .ok_or(Error::MessageNotFound(id))
    }

    async fn commit(
        &self,
        id: MessageId,
        update: ShadowUpdate,
        kind: OperationKind,
        args: Vec<serde_json::Value>,
    ) -> Result<OperationId> {
        let message = self.message(id).await?;
        if kind.requires_uid() && message.uid.is_none() {
            return Err(Error::InvalidOperation(format!(
                "{kind} needs a message on the server, message {id} has no uid"
            )));
        }
        if kind != OperationKind::Send {
            let outbox = self.ctx.mirror.outbox().await?;
            if outbox.is_some_and(|f| f.id == message.folder) {
                return Err(Error::InvalidOperation(format!(
                    "{kind} is not possible on outbox message {id}"
                )));
            }
        }

        let operation = self
            .ctx
            .mirror
            .stage(id, update, Some(QueuedOperation::new(kind, args)))
            .await?
            .ok_or(Error::MessageNotFound(id))?;
        debug!("Message {id}: {kind} queued as #{operation}");

        if let Some(folder) = self.ctx.mirror.folder(message.folder).await? {
            self.ctx
                .dispatcher
                .dispatch_for(&folder, WorkRequest::process(folder.id));
        }
        if update != ShadowUpdate::default() {
            self.ctx.refresh_unseen(message.account).await;
        }
        Ok(operation)
    }
}
