//! Reconciliation of the server view into the mirror.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::SyncContext;
use super::download::download_message;
use super::signal::StopSignal;
use crate::error::FaultKind;
use crate::protocol::{RemoteFolder, RemoteMessage, RemoteMetadata, RemoteStore};
use crate::store::{
    Account, Folder, FolderType, Message, MessageId, Mirror, NewAttachment, NewFolder, NewMessage,
    SyncState,
};
use crate::{Error, Result};

/// Marker carried by Message-IDs this engine generates. A reply whose only
/// reference carries it is matched against that reference.
pub const SELF_REFERENCE_MARKER: &str = "mailmirror";

/// What [`synchronize_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The server reported the message as gone; nothing was written.
    Removed,
    /// A new row was inserted.
    Inserted(MessageId),
    /// An existing row (same Message-ID, same folder or outbox) was moved
    /// onto the server message.
    Reattached(MessageId),
    /// Flags were updated.
    Updated(MessageId),
    /// The row already matched.
    Unchanged(MessageId),
}

impl Reconciled {
    /// The affected row, if any.
    #[must_use]
    pub const fn message_id(self) -> Option<MessageId> {
        match self {
            Self::Removed => None,
            Self::Inserted(id) | Self::Reattached(id) | Self::Updated(id) | Self::Unchanged(id) => {
                Some(id)
            }
        }
    }
}

/// Counters from one pass of [`synchronize_messages`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSummary {
    /// Rows dropped for falling out of the window.
    pub expired: u64,
    /// Rows dropped because the server no longer has them.
    pub vanished: usize,
    /// Server messages reconciled into rows.
    pub reconciled: usize,
    /// Messages whose body or attachments were downloaded.
    pub downloaded: usize,
}

/// Start of the retention window: midnight (UTC) of the day `after_days`
/// ago, never before the epoch.
#[must_use]
pub fn window_start(after_days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let start = now
        .checked_sub_signed(chrono::Duration::days(i64::from(after_days)))
        .unwrap_or(DateTime::UNIX_EPOCH);
    let midnight = start
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(start, |t| t.and_utc());
    midnight.max(DateTime::UNIX_EPOCH)
}

/// Brings the folder list of `account` in line with the server.
///
/// Selectable server folders missing locally are added as unsynchronized
/// user folders; local user folders the server no longer lists are removed.
/// Folders with a role are never removed.
///
/// # Errors
///
/// Returns an error if listing fails or the mirror cannot be updated.
pub async fn synchronize_folders(
    ctx: &SyncContext,
    account: &Account,
    store: &dyn RemoteStore,
) -> Result<()> {
    let remote: HashSet<String> = store
        .list_folders()
        .await?
        .into_iter()
        .filter(|f| f.selectable)
        .map(|f| f.name)
        .collect();
    let local = ctx.mirror.folders(account.id).await?;
    let known: HashSet<&str> = local.iter().map(|f| f.name.as_str()).collect();

    let mut added: Vec<NewFolder> = remote
        .iter()
        .filter(|name| !known.contains(name.as_str()))
        .map(|name| NewFolder {
            account: Some(account.id),
            name: name.clone(),
            folder_type: FolderType::User,
            synchronize: false,
            after: ctx.config.default_folder_days,
        })
        .collect();
    added.sort_by(|a, b| a.name.cmp(&b.name));

    let removed: Vec<String> = local
        .iter()
        .filter(|f| f.folder_type == FolderType::User && !remote.contains(&f.name))
        .map(|f| f.name.clone())
        .collect();

    if added.is_empty() && removed.is_empty() {
        debug!("{}: folder list unchanged", account.name);
        return Ok(());
    }

    info!(
        "{}: {} folders added, {} removed",
        account.name,
        added.len(),
        removed.len()
    );
    ctx.mirror
        .apply_folder_list(account.id, &added, &removed)
        .await
}

/// Reconciles the message window of an open folder, then downloads what
/// the network policy allows.
///
/// Stops early, without error, once `stop` is raised.
///
/// # Errors
///
/// Returns an error if the server search fails or a connection-level fault
/// interrupts the pass. Other per-message faults are logged and skipped.
pub(crate) async fn synchronize_messages(
    ctx: &SyncContext,
    folder: &Folder,
    remote: &dyn RemoteFolder,
    stop: &StopSignal,
) -> Result<WindowSummary> {
    let mirror = ctx.mirror.as_ref();
    let mut summary = WindowSummary::default();
    mirror
        .set_folder_state(folder.id, Some(SyncState::Syncing))
        .await?;

    let ago = window_start(folder.after, Utc::now());
    debug!("{}: window starts {ago}", folder.name);

    summary.expired = mirror.delete_messages_before(folder.id, ago).await?;

    let mut remote_messages = remote.search_since(ago).await?;
    remote_messages.sort_by_key(|m| m.uid);

    let mut vanished: HashSet<u32> = mirror
        .uids_since(folder.id, ago)
        .await?
        .into_iter()
        .collect();
    for message in &remote_messages {
        vanished.remove(&message.uid);
    }
    for uid in &vanished {
        mirror.delete_message_by_uid(folder.id, *uid).await?;
    }
    summary.vanished = vanished.len();

    let mut synced: Vec<MessageId> = Vec::with_capacity(remote_messages.len());
    for range in batches_newest_first(remote_messages.len(), ctx.config.sync_batch_size) {
        if stop.is_stopped() {
            return Ok(summary);
        }

        let batch = &remote_messages[range];
        let mut unknown = Vec::new();
        for message in batch {
            if message.metadata.is_none()
                && mirror.message_by_uid(folder.id, message.uid).await?.is_none()
            {
                unknown.push(message.uid);
            }
        }
        let mut metadata: HashMap<u32, RemoteMetadata> = if unknown.is_empty() {
            HashMap::new()
        } else {
            remote
                .fetch_metadata(&unknown)
                .await?
                .into_iter()
                .filter_map(|m| m.metadata.map(|meta| (m.uid, meta)))
                .collect()
        };

        for message in batch.iter().rev() {
            let mut message = message.clone();
            if message.metadata.is_none() {
                message.metadata = metadata.remove(&message.uid);
            }
            let uid = message.uid;
            match synchronize_message(mirror, folder, remote, message).await {
                Ok(outcome) => {
                    if let Some(id) = outcome.message_id() {
                        synced.push(id);
                    }
                }
                Err(e) => skip_or_abort(folder, &format!("uid {uid}"), e)?,
            }
        }
    }
    summary.reconciled = synced.len();

    mirror
        .set_folder_state(folder.id, Some(SyncState::Downloading))
        .await?;
    for chunk in synced.chunks(ctx.config.download_batch_size) {
        if stop.is_stopped() {
            return Ok(summary);
        }
        for id in chunk {
            match download_message(ctx, remote, *id).await {
                Ok(true) => summary.downloaded += 1,
                Ok(false) => {}
                Err(e) => skip_or_abort(folder, &format!("message {id}"), e)?,
            }
        }
    }

    mirror
        .set_folder_state(folder.id, Some(SyncState::Connected))
        .await?;
    info!(
        "{}: {} reconciled, {} expired, {} vanished, {} downloaded",
        folder.name, summary.reconciled, summary.expired, summary.vanished, summary.downloaded
    );
    Ok(summary)
}

fn skip_or_abort(folder: &Folder, what: &str, err: Error) -> Result<()> {
    match err.fault_kind() {
        FaultKind::Connection => Err(err),
        _ if err.is_message_removed() => {
            warn!("{}: {what} removed: {err}", folder.name);
            Ok(())
        }
        _ => {
            error!("{}: {what}: {err}", folder.name);
            Ok(())
        }
    }
}

/// Index ranges of `len` items in chunks of `size`, highest indices first.
fn batches_newest_first(len: usize, size: usize) -> impl Iterator<Item = Range<usize>> {
    let size = size.max(1);
    (0..len.div_ceil(size)).map(move |i| {
        let end = len - i * size;
        end.saturating_sub(size)..end
    })
}

/// Upserts one server message into the mirror.
///
/// Lookup order: by uid in this folder; then by Message-ID (or the
/// self-reference) among rows of this folder or the outbox; else insert.
///
/// # Errors
///
/// Returns an error if the mirror or a metadata fetch fails.
pub async fn synchronize_message(
    mirror: &dyn Mirror,
    folder: &Folder,
    remote: &dyn RemoteFolder,
    message: RemoteMessage,
) -> Result<Reconciled> {
    if message.expunged || message.flags.deleted {
        return Ok(Reconciled::Removed);
    }
    let uid = message.uid;
    let flags = message.flags;

    if let Some(existing) = mirror.message_by_uid(folder.id, uid).await? {
        if flags_match(&existing, flags.seen, flags.flagged) {
            return Ok(Reconciled::Unchanged(existing.id));
        }
        mirror.sync_flags(existing.id, flags.seen, flags.flagged).await?;
        debug!("{}: uid {uid} flags updated", folder.name);
        return Ok(Reconciled::Updated(existing.id));
    }

    let metadata = match message.metadata {
        Some(metadata) => metadata,
        None => {
            let fetched = remote
                .fetch_metadata(&[uid])
                .await?
                .into_iter()
                .find(|m| m.uid == uid && !m.expunged)
                .and_then(|m| m.metadata);
            match fetched {
                Some(metadata) => metadata,
                None => return Ok(Reconciled::Removed),
            }
        }
    };

    if let (Some(account), Some(msgid)) = (folder.account, metadata.message_id.as_deref()) {
        let reference = self_reference(&metadata.references).unwrap_or(msgid);
        let outbox = mirror.outbox().await?.map(|f| f.id);
        for duplicate in mirror.messages_by_msgid(account, msgid, reference).await? {
            if duplicate.folder == folder.id || Some(duplicate.folder) == outbox {
                mirror
                    .reattach_message(
                        duplicate.id,
                        folder.id,
                        uid,
                        Some(msgid),
                        metadata.thread.as_deref(),
                    )
                    .await?;
                debug!(
                    "{}: uid {uid} reattached to message {}",
                    folder.name, duplicate.id
                );
                return Ok(Reconciled::Reattached(duplicate.id));
            }
        }
    }

    let new = new_message(folder, uid, flags.seen, flags.flagged, metadata);
    let id = mirror.insert_message(&new).await?;
    debug!("{}: uid {uid} inserted as message {id}", folder.name);
    Ok(Reconciled::Inserted(id))
}

const fn flags_match(existing: &Message, seen: bool, flagged: bool) -> bool {
    existing.seen == seen
        && existing.ui_seen == seen
        && existing.flagged == flagged
        && existing.ui_flagged == flagged
        && !existing.ui_hide
}

fn self_reference(references: &[String]) -> Option<&str> {
    match references {
        [only] if only.contains(SELF_REFERENCE_MARKER) => Some(only.as_str()),
        _ => None,
    }
}

fn new_message(
    folder: &Folder,
    uid: u32,
    seen: bool,
    flagged: bool,
    metadata: RemoteMetadata,
) -> NewMessage {
    let references = (!metadata.references.is_empty()).then(|| metadata.references.join(" "));
    // Archive copies must not capture replies that belong to the live thread.
    let msgid = if folder.folder_type == FolderType::Archive {
        None
    } else {
        metadata.message_id
    };

    NewMessage {
        account: folder.account,
        folder: folder.id,
        uid: Some(uid),
        msgid,
        references,
        in_reply_to: metadata.in_reply_to,
        delivered_to: metadata.delivered_to,
        thread: metadata.thread,
        from: metadata.from,
        to: metadata.to,
        cc: metadata.cc,
        bcc: metadata.bcc,
        reply_to: metadata.reply_to,
        subject: metadata.subject,
        size: metadata.size,
        received: metadata.received,
        sent: metadata.sent,
        seen,
        flagged,
        attachments: metadata
            .attachments
            .into_iter()
            .map(|a| NewAttachment {
                name: a.name,
                mime_type: a.mime_type,
                cid: a.cid,
                size: a.size,
            })
            .collect(),
    }
}
