//! `SQLite` implementation of the mirror.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::QueuedOperation;
use super::model::{
    Account, AccountId, Attachment, AttachmentId, Folder, FolderId, FolderType, Message,
    MessageId, NewFolder, NewMessage, Operation, OperationId, OperationKind, Security,
    ServerConfig, ShadowUpdate, SyncState,
};
use crate::{Error, Mirror, Result};

const ACCOUNT_COLUMNS: &str = "id, name, email, \
    store_host, store_port, store_security, store_username, store_password, \
    transport_host, transport_port, transport_security, transport_username, transport_password, \
    synchronize, poll_interval, store_sent, state, error";

const FOLDER_COLUMNS: &str = "id, account, name, type, synchronize, after_days, state, error";

const MESSAGE_COLUMNS: &str = "id, account, folder, uid, msgid, refs, in_reply_to, delivered_to, \
    thread, from_addrs, to_addrs, cc_addrs, bcc_addrs, reply_to_addrs, subject, size, content, \
    body, headers, received, sent, seen, flagged, ui_seen, ui_flagged, ui_hide, ui_ignored, error";

const ATTACHMENT_COLUMNS: &str = "id, message, sequence, name, mime_type, cid, size, available";

/// Mirror backed by a `SQLite` database.
pub struct SqliteMirror {
    pool: SqlitePool,
}

impl SqliteMirror {
    /// Create a new mirror with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let mirror = Self { pool };
        mirror.initialize().await?;
        Ok(mirror)
    }

    /// Create an in-memory mirror for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let mirror = Self { pool };
        mirror.initialize().await?;
        Ok(mirror)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                store_host TEXT NOT NULL,
                store_port INTEGER NOT NULL,
                store_security TEXT NOT NULL,
                store_username TEXT NOT NULL,
                store_password TEXT NOT NULL,
                transport_host TEXT NOT NULL,
                transport_port INTEGER NOT NULL,
                transport_security TEXT NOT NULL,
                transport_username TEXT NOT NULL,
                transport_password TEXT NOT NULL,
                synchronize INTEGER NOT NULL DEFAULT 1,
                poll_interval INTEGER NOT NULL DEFAULT 9,
                store_sent INTEGER NOT NULL DEFAULT 0,
                state TEXT,
                error TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account INTEGER REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                synchronize INTEGER NOT NULL DEFAULT 0,
                after_days INTEGER NOT NULL,
                state TEXT,
                error TEXT,
                UNIQUE(account, name)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account INTEGER REFERENCES accounts(id) ON DELETE CASCADE,
                folder INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                uid INTEGER,
                msgid TEXT,
                refs TEXT,
                in_reply_to TEXT,
                delivered_to TEXT,
                thread TEXT,
                from_addrs TEXT NOT NULL DEFAULT '[]',
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                bcc_addrs TEXT NOT NULL DEFAULT '[]',
                reply_to_addrs TEXT NOT NULL DEFAULT '[]',
                subject TEXT,
                size INTEGER,
                content INTEGER NOT NULL DEFAULT 0,
                body TEXT,
                headers TEXT,
                received INTEGER NOT NULL,
                sent INTEGER,
                seen INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                ui_seen INTEGER NOT NULL DEFAULT 0,
                ui_flagged INTEGER NOT NULL DEFAULT 0,
                ui_hide INTEGER NOT NULL DEFAULT 0,
                ui_ignored INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_folder_uid
            ON messages(folder, uid) WHERE uid IS NOT NULL
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_account_msgid ON messages(account, msgid)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                name TEXT,
                mime_type TEXT NOT NULL,
                cid TEXT,
                size INTEGER,
                available INTEGER NOT NULL DEFAULT 0,
                data BLOB,
                UNIQUE(message, sequence)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                message INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                created INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Mirror for SqliteMirror {
    async fn insert_account(&self, account: &Account) -> Result<AccountId> {
        let result = sqlx::query(
            r"
            INSERT INTO accounts (
                name, email,
                store_host, store_port, store_security, store_username, store_password,
                transport_host, transport_port, transport_security, transport_username,
                transport_password, synchronize, poll_interval, store_sent
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.store.host)
        .bind(account.store.port)
        .bind(account.store.security.as_str())
        .bind(&account.store.username)
        .bind(&account.store.password)
        .bind(&account.transport.host)
        .bind(account.transport.port)
        .bind(account.transport.security.as_str())
        .bind(&account.transport.username)
        .bind(&account.transport.password)
        .bind(account.synchronize)
        .bind(account.poll_interval)
        .bind(account.store_sent)
        .execute(&self.pool)
        .await?;

        Ok(AccountId(result.last_insert_rowid()))
    }

    async fn synchronized_accounts(&self) -> Result<Vec<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE synchronize ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_account).collect())
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_account))
    }

    async fn set_account_state(&self, id: AccountId, state: Option<SyncState>) -> Result<()> {
        sqlx::query("UPDATE accounts SET state = ? WHERE id = ?")
            .bind(state.map(SyncState::as_str))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_account_error(&self, id: AccountId, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE accounts SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_folder(&self, folder: &NewFolder) -> Result<FolderId> {
        let result = sqlx::query(
            "INSERT INTO folders (account, name, type, synchronize, after_days) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(folder.account.map(|a| a.0))
        .bind(&folder.name)
        .bind(folder.folder_type.as_str())
        .bind(folder.synchronize)
        .bind(folder.after)
        .execute(&self.pool)
        .await?;

        Ok(FolderId(result.last_insert_rowid()))
    }

    async fn folder(&self, id: FolderId) -> Result<Option<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_folder))
    }

    async fn folders(&self, account: AccountId) -> Result<Vec<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE account = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(account.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_folder).collect())
    }

    async fn synchronized_folders(&self, account: AccountId) -> Result<Vec<Folder>> {
        let sql = format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE account = ? AND synchronize ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(account.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_folder).collect())
    }

    async fn folder_by_name(&self, account: AccountId, name: &str) -> Result<Option<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE account = ? AND name = ?");
        let row = sqlx::query(&sql)
            .bind(account.0)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_folder))
    }

    async fn folder_by_type(
        &self,
        account: AccountId,
        folder_type: FolderType,
    ) -> Result<Option<Folder>> {
        let sql = format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE account = ? AND type = ? ORDER BY id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(account.0)
            .bind(folder_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_folder))
    }

    async fn outbox(&self) -> Result<Option<Folder>> {
        let sql = format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE account IS NULL AND type = ? LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(FolderType::Outbox.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_folder))
    }

    async fn apply_folder_list(
        &self,
        account: AccountId,
        added: &[NewFolder],
        removed: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for folder in added {
            sqlx::query(
                "INSERT INTO folders (account, name, type, synchronize, after_days) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(account.0)
            .bind(&folder.name)
            .bind(folder.folder_type.as_str())
            .bind(folder.synchronize)
            .bind(folder.after)
            .execute(&mut *tx)
            .await?;
        }

        for name in removed {
            sqlx::query("DELETE FROM folders WHERE account = ? AND name = ?")
                .bind(account.0)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            "Folder list of account {account}: {} added, {} removed",
            added.len(),
            removed.len()
        );
        Ok(())
    }

    async fn rename_folder(&self, account: AccountId, from: &str, to: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE folders SET name = ? WHERE account = ? AND name = ?")
            .bind(to)
            .bind(account.0)
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_folder_state(&self, id: FolderId, state: Option<SyncState>) -> Result<()> {
        sqlx::query("UPDATE folders SET state = ? WHERE id = ?")
            .bind(state.map(SyncState::as_str))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_folder_error(&self, id: FolderId, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE folders SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_folder_states(&self, account: AccountId) -> Result<()> {
        sqlx::query("UPDATE folders SET state = NULL WHERE account = ?")
            .bind(account.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageId> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            INSERT INTO messages (
                account, folder, uid, msgid, refs, in_reply_to, delivered_to, thread,
                from_addrs, to_addrs, cc_addrs, bcc_addrs, reply_to_addrs, subject, size,
                received, sent, seen, flagged, ui_seen, ui_flagged
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.account.map(|a| a.0))
        .bind(message.folder.0)
        .bind(message.uid)
        .bind(&message.msgid)
        .bind(&message.references)
        .bind(&message.in_reply_to)
        .bind(&message.delivered_to)
        .bind(&message.thread)
        .bind(addresses_to_db(&message.from)?)
        .bind(addresses_to_db(&message.to)?)
        .bind(addresses_to_db(&message.cc)?)
        .bind(addresses_to_db(&message.bcc)?)
        .bind(addresses_to_db(&message.reply_to)?)
        .bind(&message.subject)
        .bind(size_to_db(message.size))
        .bind(message.received.timestamp_millis())
        .bind(message.sent.map(|t| t.timestamp_millis()))
        .bind(message.seen)
        .bind(message.flagged)
        .bind(message.seen)
        .bind(message.flagged)
        .execute(&mut *tx)
        .await?;

        let id = MessageId(result.last_insert_rowid());

        let mut cids = HashSet::new();
        let mut sequence: u32 = 1;
        for attachment in &message.attachments {
            if let Some(cid) = attachment.cid.as_deref().filter(|c| !c.is_empty()) {
                if !cids.insert(cid.to_string()) {
                    debug!("Skipping duplicate attachment cid {cid} of message {id}");
                    continue;
                }
            }
            sqlx::query(
                r"
                INSERT INTO attachments (message, sequence, name, mime_type, cid, size)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(id.0)
            .bind(sequence)
            .bind(&attachment.name)
            .bind(&attachment.mime_type)
            .bind(&attachment.cid)
            .bind(size_to_db(attachment.size))
            .execute(&mut *tx)
            .await?;
            sequence += 1;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn message(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn message_by_uid(&self, folder: FolderId, uid: u32) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE folder = ? AND uid = ?");
        let row = sqlx::query(&sql)
            .bind(folder.0)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn messages_by_msgid(
        &self,
        account: AccountId,
        msgid: &str,
        reference: &str,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE account = ? AND (msgid = ? OR msgid = ?) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(account.0)
            .bind(msgid)
            .bind(reference)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn reattach_message(
        &self,
        id: MessageId,
        folder: FolderId,
        uid: u32,
        msgid: Option<&str>,
        thread: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET folder = ?, uid = ?, msgid = ?, thread = ?, error = NULL WHERE id = ?",
        )
        .bind(folder.0)
        .bind(uid)
        .bind(msgid)
        .bind(thread)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_flags(&self, id: MessageId, seen: bool, flagged: bool) -> Result<()> {
        sqlx::query(
            r"
            UPDATE messages
            SET seen = ?, ui_seen = ?, flagged = ?, ui_flagged = ?, ui_hide = 0
            WHERE id = ?
            ",
        )
        .bind(seen)
        .bind(seen)
        .bind(flagged)
        .bind(flagged)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_message_seen(&self, id: MessageId, seen: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET seen = ? WHERE id = ?")
            .bind(seen)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_flagged(&self, id: MessageId, flagged: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET flagged = ? WHERE id = ?")
            .bind(flagged)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_uid(&self, id: MessageId, uid: Option<u32>) -> Result<()> {
        sqlx::query("UPDATE messages SET uid = ? WHERE id = ?")
            .bind(uid)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_error(&self, id: MessageId, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE messages SET error = ? WHERE id = ?")
            .bind(error)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_content(&self, id: MessageId, body: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET body = ?, content = 1 WHERE id = ?")
            .bind(body)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_message_headers(&self, id: MessageId, headers: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET headers = ? WHERE id = ?")
            .bind(headers)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn uids_since(&self, folder: FolderId, since: DateTime<Utc>) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            "SELECT uid FROM messages WHERE folder = ? AND received >= ? AND uid IS NOT NULL",
        )
        .bind(folder.0)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<u32, _>("uid")).collect())
    }

    async fn delete_messages_before(
        &self,
        folder: FolderId,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE folder = ? AND received < ?")
            .bind(folder.0)
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_message_by_uid(&self, folder: FolderId, uid: u32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE folder = ? AND uid = ?")
            .bind(folder.0)
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_message(&self, id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_sent(
        &self,
        id: MessageId,
        sent: DateTime<Utc>,
        relocate_to: Option<FolderId>,
    ) -> Result<Option<OperationId>> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE messages SET sent = ?, seen = 1, ui_seen = 1 WHERE id = ?")
            .bind(sent.timestamp_millis())
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(id));
        }

        let mut queued = None;
        if let Some(folder) = relocate_to {
            sqlx::query("UPDATE messages SET folder = ?, uid = NULL WHERE id = ?")
                .bind(folder.0)
                .bind(id.0)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query(
                "INSERT INTO operations (folder, message, name, args, created) VALUES (?, ?, ?, '[]', ?)",
            )
            .bind(folder.0)
            .bind(id.0)
            .bind(OperationKind::Add.as_str())
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
            queued = Some(OperationId(result.last_insert_rowid()));
        }

        tx.commit().await?;
        Ok(queued)
    }

    async fn unseen_count(&self, account: AccountId) -> Result<u64> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS unseen FROM messages
            WHERE account = ? AND NOT ui_seen AND NOT ui_hide AND NOT ui_ignored
            ",
        )
        .bind(account.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(row.get::<i64, _>("unseen")).unwrap_or_default())
    }

    async fn stage(
        &self,
        message: MessageId,
        update: ShadowUpdate,
        operation: Option<QueuedOperation>,
    ) -> Result<Option<OperationId>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT folder FROM messages WHERE id = ?")
            .bind(message.0)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(Error::MessageNotFound(message));
        };
        let folder: i64 = row.get("folder");

        sqlx::query(
            r"
            UPDATE messages SET
                ui_seen = COALESCE(?, ui_seen),
                ui_flagged = COALESCE(?, ui_flagged),
                ui_hide = COALESCE(?, ui_hide),
                ui_ignored = COALESCE(?, ui_ignored)
            WHERE id = ?
            ",
        )
        .bind(update.ui_seen)
        .bind(update.ui_flagged)
        .bind(update.ui_hide)
        .bind(update.ui_ignored)
        .bind(message.0)
        .execute(&mut *tx)
        .await?;

        let mut queued = None;
        if let Some(operation) = operation {
            let result = sqlx::query(
                "INSERT INTO operations (folder, message, name, args, created) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(folder)
            .bind(message.0)
            .bind(operation.kind.as_str())
            .bind(serde_json::to_string(&operation.args)?)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
            queued = Some(OperationId(result.last_insert_rowid()));
        }

        tx.commit().await?;
        Ok(queued)
    }

    async fn ignore_all(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE messages SET ui_ignored = 1 WHERE NOT ui_seen AND NOT ui_ignored")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn attachments(&self, message: MessageId) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message = ? ORDER BY sequence"
        );
        let rows = sqlx::query(&sql)
            .bind(message.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_attachment).collect())
    }

    async fn attachment(&self, message: MessageId, sequence: u32) -> Result<Option<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message = ? AND sequence = ?"
        );
        let row = sqlx::query(&sql)
            .bind(message.0)
            .bind(sequence)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_attachment))
    }

    async fn attachment_content(&self, id: AttachmentId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT data FROM attachments WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| row.get::<Option<Vec<u8>>, _>("data")))
    }

    async fn set_attachment_content(&self, id: AttachmentId, data: &[u8]) -> Result<()> {
        sqlx::query("UPDATE attachments SET data = ?, available = 1 WHERE id = ?")
            .bind(data)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue(
        &self,
        message: MessageId,
        kind: OperationKind,
        args: Vec<serde_json::Value>,
    ) -> Result<OperationId> {
        let result = sqlx::query(
            r"
            INSERT INTO operations (folder, message, name, args, created)
            SELECT folder, id, ?, ?, ? FROM messages WHERE id = ?
            ",
        )
        .bind(kind.as_str())
        .bind(serde_json::to_string(&args)?)
        .bind(Utc::now().timestamp_millis())
        .bind(message.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(message));
        }
        Ok(OperationId(result.last_insert_rowid()))
    }

    async fn operations(&self, folder: FolderId) -> Result<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT id, folder, message, name, args, created FROM operations WHERE folder = ? ORDER BY id",
        )
        .bind(folder.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_operation).collect())
    }

    async fn operation_count(&self, folder: FolderId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS queued FROM operations WHERE folder = ?")
            .bind(folder.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.get::<i64, _>("queued")).unwrap_or_default())
    }

    async fn delete_operation(&self, id: OperationId) -> Result<()> {
        sqlx::query("DELETE FROM operations WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn size_to_db(size: Option<u64>) -> Option<i64> {
    size.and_then(|s| i64::try_from(s).ok())
}

fn size_from_db(row: &SqliteRow) -> Option<u64> {
    row.get::<Option<i64>, _>("size")
        .and_then(|s| u64::try_from(s).ok())
}

fn time_from_db(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn addresses_to_db(addresses: &[String]) -> Result<String> {
    Ok(serde_json::to_string(addresses)?)
}

fn addresses_from_db(row: &SqliteRow, column: &str) -> Vec<String> {
    let raw: String = row.get(column);
    serde_json::from_str(&raw).unwrap_or_default()
}

fn server_from_row(row: &SqliteRow, prefix: &str) -> ServerConfig {
    ServerConfig {
        host: row.get(format!("{prefix}_host").as_str()),
        port: row.get::<u16, _>(format!("{prefix}_port").as_str()),
        security: Security::parse(&row.get::<String, _>(format!("{prefix}_security").as_str())),
        username: row.get(format!("{prefix}_username").as_str()),
        password: row.get(format!("{prefix}_password").as_str()),
    }
}

fn state_from_row(row: &SqliteRow) -> Option<SyncState> {
    row.get::<Option<String>, _>("state")
        .as_deref()
        .and_then(SyncState::parse)
}

fn row_to_account(row: &SqliteRow) -> Account {
    Account {
        id: AccountId(row.get("id")),
        name: row.get("name"),
        email: row.get("email"),
        store: server_from_row(row, "store"),
        transport: server_from_row(row, "transport"),
        synchronize: row.get("synchronize"),
        poll_interval: row.get::<u32, _>("poll_interval"),
        store_sent: row.get("store_sent"),
        state: state_from_row(row),
        error: row.get("error"),
    }
}

fn row_to_folder(row: &SqliteRow) -> Folder {
    Folder {
        id: FolderId(row.get("id")),
        account: row.get::<Option<i64>, _>("account").map(AccountId),
        name: row.get("name"),
        folder_type: FolderType::parse(&row.get::<String, _>("type")),
        synchronize: row.get("synchronize"),
        after: row.get::<u32, _>("after_days"),
        state: state_from_row(row),
        error: row.get("error"),
    }
}

fn row_to_message(row: &SqliteRow) -> Message {
    Message {
        id: MessageId(row.get("id")),
        account: row.get::<Option<i64>, _>("account").map(AccountId),
        folder: FolderId(row.get("folder")),
        uid: row.get("uid"),
        msgid: row.get("msgid"),
        references: row.get("refs"),
        in_reply_to: row.get("in_reply_to"),
        delivered_to: row.get("delivered_to"),
        thread: row.get("thread"),
        from: addresses_from_db(row, "from_addrs"),
        to: addresses_from_db(row, "to_addrs"),
        cc: addresses_from_db(row, "cc_addrs"),
        bcc: addresses_from_db(row, "bcc_addrs"),
        reply_to: addresses_from_db(row, "reply_to_addrs"),
        subject: row.get("subject"),
        size: size_from_db(row),
        content: row.get("content"),
        body: row.get("body"),
        headers: row.get("headers"),
        received: time_from_db(row.get("received")),
        sent: row.get::<Option<i64>, _>("sent").map(time_from_db),
        seen: row.get("seen"),
        flagged: row.get("flagged"),
        ui_seen: row.get("ui_seen"),
        ui_flagged: row.get("ui_flagged"),
        ui_hide: row.get("ui_hide"),
        ui_ignored: row.get("ui_ignored"),
        error: row.get("error"),
    }
}

fn row_to_attachment(row: &SqliteRow) -> Attachment {
    Attachment {
        id: AttachmentId(row.get("id")),
        message: MessageId(row.get("message")),
        sequence: row.get::<u32, _>("sequence"),
        name: row.get("name"),
        mime_type: row.get("mime_type"),
        cid: row.get("cid"),
        size: size_from_db(row),
        available: row.get("available"),
    }
}

fn row_to_operation(row: &SqliteRow) -> Operation {
    let args: String = row.get("args");
    Operation {
        id: OperationId(row.get("id")),
        folder: FolderId(row.get("folder")),
        message: MessageId(row.get("message")),
        name: row.get("name"),
        args: serde_json::from_str(&args).unwrap_or_default(),
        created: time_from_db(row.get("created")),
    }
}
