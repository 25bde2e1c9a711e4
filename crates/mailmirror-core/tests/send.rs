//! Outbox sends through the transport.

mod common;

use tokio::sync::Mutex;

use mailmirror_core::protocol::ProtocolError;
use mailmirror_core::store::{FolderType, Mirror};
use mailmirror_core::sync::process_operations;
use mailmirror_core::{Actions, Supervisor, SyncEvent};

use common::{Harness, eventually};

#[tokio::test]
async fn test_send_relocates_into_sent_folder() {
    let h = Harness::new(false).await;
    let account = h.account("Work", true).await;
    let sent = h.folder(account, "Sent", FolderType::Sent, true).await;
    let outbox = h.outbox().await;
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;
    let mut events = h.ctx.events.subscribe();

    Actions::new(&h.ctx).send(draft).await.unwrap();
    let outbox = h.mirror.folder(outbox).await.unwrap().unwrap();
    let outcome = process_operations(&h.ctx, &outbox, None, &Mutex::new(()))
        .await
        .unwrap();
    assert_eq!(outcome.executed, 1);

    let wire = h.transport.sent();
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].message_id.as_deref(), Some("<draft@example.com>"));

    let message = h.mirror.message(draft).await.unwrap().unwrap();
    assert_eq!(message.folder, sent);
    assert_eq!(message.uid, None);
    assert!(message.sent.is_some());
    assert!(message.seen && message.ui_seen);
    assert_eq!(h.mirror.operation_count(sent).await.unwrap(), 1);
    assert_eq!(h.mirror.operation_count(outbox.id).await.unwrap(), 0);

    let mut announced = false;
    while let Ok(event) = events.try_recv() {
        if event == (SyncEvent::MessageSent { message: draft }) {
            announced = true;
        }
    }
    assert!(announced);
}

#[tokio::test]
async fn test_send_without_store_sent_stays_in_outbox() {
    let h = Harness::new(false).await;
    let account = h.account("Work", false).await;
    let sent = h.folder(account, "Sent", FolderType::Sent, true).await;
    let outbox = h.outbox().await;
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;

    Actions::new(&h.ctx).send(draft).await.unwrap();
    let outbox_folder = h.mirror.folder(outbox).await.unwrap().unwrap();
    process_operations(&h.ctx, &outbox_folder, None, &Mutex::new(()))
        .await
        .unwrap();

    let message = h.mirror.message(draft).await.unwrap().unwrap();
    assert_eq!(message.folder, outbox);
    assert!(message.sent.is_some());
    assert_eq!(h.mirror.operation_count(sent).await.unwrap(), 0);
}

#[tokio::test]
async fn test_authentication_failure_retries_once() {
    let h = Harness::new(false).await;
    let account = h.account("Work", false).await;
    let outbox = h.outbox().await;
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;
    h.transport
        .script(vec![Err(ProtocolError::auth("token expired"))]);

    Actions::new(&h.ctx).send(draft).await.unwrap();
    let outbox = h.mirror.folder(outbox).await.unwrap().unwrap();
    let outcome = process_operations(&h.ctx, &outbox, None, &Mutex::new(()))
        .await
        .unwrap();

    assert_eq!(outcome.executed, 1);
    assert_eq!(h.transport.reauthentications(), 1);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_rejected_send_is_dropped_and_reported() {
    let h = Harness::new(false).await;
    let account = h.account("Work", false).await;
    let outbox = h.outbox().await;
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;
    h.transport
        .script(vec![Err(ProtocolError::send_rejected("550 mailbox unavailable"))]);
    let mut events = h.ctx.events.subscribe();

    Actions::new(&h.ctx).send(draft).await.unwrap();
    let outbox_folder = h.mirror.folder(outbox).await.unwrap().unwrap();
    let outcome = process_operations(&h.ctx, &outbox_folder, None, &Mutex::new(()))
        .await
        .unwrap();

    assert_eq!(outcome.dropped, 1);
    assert_eq!(h.mirror.operation_count(outbox).await.unwrap(), 0);
    let message = h.mirror.message(draft).await.unwrap().unwrap();
    assert!(message.sent.is_none());
    assert!(message.error.is_some());

    let reported = std::iter::from_fn(|| events.try_recv().ok())
        .any(|event| matches!(event, SyncEvent::Error(report) if report.message.contains("550")));
    assert!(reported);
}

#[tokio::test]
async fn test_send_only_from_outbox() {
    let h = Harness::new(false).await;
    let account = h.account("Work", false).await;
    let inbox = h.folder(account, "INBOX", FolderType::Inbox, true).await;
    let message = h.mirrored(account, inbox, Some(1), "<m1@example.com>").await;

    let err = Actions::new(&h.ctx).send(message).await.unwrap_err();
    assert!(matches!(err, mailmirror_core::Error::InvalidOperation(_)));
}

#[tokio::test]
async fn test_sent_copy_reaches_server() {
    let h = &Harness::new(false).await;
    let account = h.account("Work", true).await;
    h.folder(account, "INBOX", FolderType::Inbox, true).await;
    let sent = h.folder(account, "Sent", FolderType::Sent, true).await;
    let outbox = h.outbox().await;
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;

    let supervisor = Supervisor::new(h.ctx.clone());
    assert!(supervisor.start().await.unwrap());
    Actions::new(&h.ctx).send(draft).await.unwrap();

    eventually("sent copy to be appended", move || async move {
        h.server.uids("Sent").len() == 1
    })
    .await;
    eventually("sent copy to get its uid", move || async move {
        let message = h.mirror.message(draft).await.unwrap().unwrap();
        message.folder == sent && message.uid.is_some()
    })
    .await;

    supervisor.stop().await;
    assert_eq!(supervisor.live_units(), 0);
}

#[tokio::test]
async fn test_outbox_session_clears_stale_error() {
    let h = &Harness::new(false).await;
    let account = h.account("Work", false).await;
    h.folder(account, "INBOX", FolderType::Inbox, true).await;
    let outbox = h.outbox().await;
    h.mirror
        .set_folder_error(outbox, Some("old failure"))
        .await
        .unwrap();

    let supervisor = Supervisor::new(h.ctx.clone());
    assert!(supervisor.start().await.unwrap());
    eventually("outbox error to clear", move || async move {
        let folder = h.mirror.folder(outbox).await.unwrap().unwrap();
        folder.error.is_none() && folder.state.is_some()
    })
    .await;

    h.mirror
        .set_folder_error(outbox, Some("older failure"))
        .await
        .unwrap();
    let draft = h.mirrored(account, outbox, None, "<draft@example.com>").await;
    Actions::new(&h.ctx).send(draft).await.unwrap();
    eventually("send to clear the error again", move || async move {
        let folder = h.mirror.folder(outbox).await.unwrap().unwrap();
        h.transport.sent().len() == 1 && folder.error.is_none()
    })
    .await;

    supervisor.stop().await;
    assert_eq!(supervisor.live_units(), 0);
}
