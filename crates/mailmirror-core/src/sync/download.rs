//! Body and attachment download policy.

use tracing::debug;

use super::SyncContext;
use crate::Result;
use crate::protocol::RemoteFolder;
use crate::store::MessageId;

/// Whether content should be fetched automatically.
///
/// Unavailable content is always fetched on an unmetered network. On a
/// metered one only content known to be smaller than `limit` is.
#[must_use]
pub const fn should_fetch(available: bool, size: Option<u64>, metered: bool, limit: u64) -> bool {
    if available {
        return false;
    }
    if !metered {
        return true;
    }
    matches!(size, Some(size) if size < limit)
}

/// Downloads the body and attachments of one message as the network
/// policy allows. Returns true if anything was fetched.
///
/// # Errors
///
/// Returns an error if a fetch or a mirror write fails.
pub async fn download_message(
    ctx: &SyncContext,
    remote: &dyn RemoteFolder,
    id: MessageId,
) -> Result<bool> {
    let Some(message) = ctx.mirror.message(id).await? else {
        return Ok(false);
    };
    let Some(uid) = message.uid else {
        return Ok(false);
    };

    let metered = ctx.network.is_metered();
    let limit = ctx.config.auto_download_limit;
    let mut fetched = false;

    if should_fetch(message.content, message.size, metered, limit) {
        let body = remote.fetch_body(uid).await?;
        ctx.mirror.set_message_content(id, &body).await?;
        fetched = true;
    }

    for attachment in ctx.mirror.attachments(id).await? {
        if should_fetch(attachment.available, attachment.size, metered, limit) {
            let data = remote.fetch_attachment(uid, attachment.sequence).await?;
            ctx.mirror.set_attachment_content(attachment.id, &data).await?;
            fetched = true;
        }
    }

    if fetched {
        debug!("{}: uid {uid} downloaded", remote.name());
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 32 * 1024;

    #[test]
    fn unmetered_fetches_everything_missing() {
        assert!(should_fetch(false, None, false, LIMIT));
        assert!(should_fetch(false, Some(40 * 1024), false, LIMIT));
        assert!(!should_fetch(true, Some(10), false, LIMIT));
    }

    #[test]
    fn metered_fetches_only_small_known_sizes() {
        assert!(should_fetch(false, Some(1024), true, LIMIT));
        assert!(!should_fetch(false, Some(40 * 1024), true, LIMIT));
        assert!(!should_fetch(false, Some(LIMIT), true, LIMIT));
        assert!(!should_fetch(false, None, true, LIMIT));
    }
}
