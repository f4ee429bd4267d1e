//! SQLite-backed sync store with zstd-compressed message bodies

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::traits::{MessageBody, SyncStore, Upserted};
use crate::models::{
    Account, AccountStatus, AttachmentMeta, BackfillProgress, EmailAddress, MessageFlags,
    MessageRecord, NewAccount, Participant, ParticipantRole, ProviderMessage, ThreadFlags,
    ThreadRecord, ThreadSummary,
};

/// zstd level for message bodies
const COMPRESSION_LEVEL: i32 = 3;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id INTEGER NOT NULL,
                provider TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                encrypted_access_token TEXT NOT NULL,
                encrypted_refresh_token TEXT NOT NULL,
                token_expires_at TEXT NOT NULL,
                sync_cursor TEXT,
                backfill_progress TEXT NOT NULL DEFAULT '{}',
                last_sync_at TEXT,
                last_sync_error TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (org_id, provider, email)
            );

            -- One row per conversation; (account_id, provider_thread_id) is the dedup key
            CREATE TABLE threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                provider_thread_id TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                snippet TEXT NOT NULL DEFAULT '',
                participants TEXT NOT NULL DEFAULT '[]',
                message_count INTEGER NOT NULL DEFAULT 0,
                first_message_at TEXT,
                last_message_at TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                is_trashed INTEGER NOT NULL DEFAULT 0,
                last_analyzed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (account_id, provider_thread_id),
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            -- Messages with zstd-compressed bodies; (thread_id, provider_message_id) is the dedup key
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id INTEGER NOT NULL,
                provider_message_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT,
                snippet TEXT NOT NULL,
                body_text BLOB,  -- zstd compressed
                body_html BLOB,  -- zstd compressed
                message_id_header TEXT,
                in_reply_to TEXT,
                message_references TEXT NOT NULL DEFAULT '[]',
                labels TEXT NOT NULL DEFAULT '[]',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                is_trashed INTEGER NOT NULL DEFAULT 0,
                in_inbox INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                is_from_user INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT NOT NULL,
                UNIQUE (thread_id, provider_message_id),
                FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_messages_thread_sent ON messages(thread_id, sent_at ASC);

            CREATE TABLE participants (
                message_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                email TEXT NOT NULL,
                name TEXT,
                PRIMARY KEY (message_id, role, email),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE TABLE attachments (
                message_id INTEGER NOT NULL,
                provider_attachment_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_id TEXT,
                is_inline INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, provider_attachment_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );
            "#,
        ),
        // Migration 2: Indexes for scheduling and downstream analysis
        M::up(
            r#"
            CREATE INDEX idx_accounts_status ON accounts(status, last_sync_at);
            CREATE INDEX idx_threads_unanalyzed
                ON threads(account_id, last_analyzed_at, updated_at);
            "#,
        ),
    ])
}

/// SQLite-based sync store
///
/// A single connection behind a mutex; every multi-statement write runs in
/// a transaction.
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

const ACCOUNT_COLUMNS: &str = "id, org_id, provider, email, display_name, status,
    encrypted_access_token, encrypted_refresh_token, token_expires_at, sync_cursor,
    backfill_progress, last_sync_at, last_sync_error, created_at";

const THREAD_COLUMNS: &str = "id, account_id, provider_thread_id, subject, snippet,
    participants, message_count, first_message_at, last_message_at, labels,
    is_read, is_starred, is_archived, is_draft, is_trashed,
    last_analyzed_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, provider_message_id, subject, from_name,
    from_email, sent_at, labels, is_read, is_starred, is_draft, is_trashed, in_inbox,
    size, is_from_user";

impl SqliteSyncStore {
    /// Open (or create) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers proceed during writes; NORMAL sync is safe with WAL.
        // foreign_keys is required for ON DELETE CASCADE.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }

    fn update_account(&self, id: i64, sql: &str, values: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(sql, values)?;
        if changed == 0 && !account_exists(&conn, id)? {
            anyhow::bail!("Account {} not found", id);
        }
        Ok(())
    }

    fn load_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
        let sql = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        Ok(conn.query_row(&sql, [id], account_from_row).optional()?)
    }

    fn thread_id_for(conn: &Connection, account_id: i64, provider_thread_id: &str) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT id FROM threads WHERE account_id = ? AND provider_thread_id = ?",
                params![account_id, provider_thread_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn account_exists(conn: &Connection, id: i64) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts WHERE id = ?", [id], |row| row.get(0))?;
    Ok(count > 0)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let provider: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(Account {
        id: row.get(0)?,
        org_id: row.get(1)?,
        provider: provider.parse().map_err(|e: anyhow::Error| conversion_error(2, e))?,
        email: row.get(3)?,
        display_name: row.get(4)?,
        status: status.parse().map_err(|e: anyhow::Error| conversion_error(5, e))?,
        encrypted_access_token: row.get(6)?,
        encrypted_refresh_token: row.get(7)?,
        token_expires_at: timestamp(row, 8)?,
        sync_cursor: row.get(9)?,
        backfill_progress: json_column(row, 10)?,
        last_sync_at: optional_timestamp(row, 11)?,
        last_sync_error: row.get(12)?,
        created_at: timestamp(row, 13)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let message_count: i64 = row.get(6)?;
    Ok(ThreadRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_thread_id: row.get(2)?,
        summary: ThreadSummary {
            subject: row.get(3)?,
            snippet: row.get(4)?,
            participants: json_column(row, 5)?,
            message_count: message_count as usize,
            first_message_at: optional_timestamp(row, 7)?,
            last_message_at: optional_timestamp(row, 8)?,
            labels: json_column(row, 9)?,
            flags: ThreadFlags {
                is_read: row.get(10)?,
                is_starred: row.get(11)?,
                is_archived: row.get(12)?,
                is_draft: row.get(13)?,
                is_trashed: row.get(14)?,
            },
        },
        last_analyzed_at: optional_timestamp(row, 15)?,
        created_at: timestamp(row, 16)?,
        updated_at: timestamp(row, 17)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let from_name: Option<String> = row.get(4)?;
    let from_email: Option<String> = row.get(5)?;
    let size: i64 = row.get(13)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        provider_message_id: row.get(2)?,
        subject: row.get(3)?,
        from: from_email.map(|email| EmailAddress {
            name: from_name,
            email,
        }),
        sent_at: timestamp(row, 6)?,
        labels: json_column(row, 7)?,
        flags: MessageFlags {
            is_read: row.get(8)?,
            is_starred: row.get(9)?,
            is_draft: row.get(10)?,
            is_trashed: row.get(11)?,
            in_inbox: row.get(12)?,
        },
        size: size as u64,
        is_from_user: row.get(14)?,
    })
}

fn compress(text: Option<&String>) -> Result<Option<Vec<u8>>> {
    text.map(|t| zstd::encode_all(t.as_bytes(), COMPRESSION_LEVEL))
        .transpose()
        .context("Failed to compress message body")
}

fn decompress(data: Option<Vec<u8>>) -> Result<Option<String>> {
    data.map(|d| {
        let bytes = zstd::decode_all(d.as_slice()).context("Failed to decompress message body")?;
        String::from_utf8(bytes).context("Message body is not valid UTF-8")
    })
    .transpose()
}

impl SyncStore for SqliteSyncStore {
    fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let conn = self.conn()?;
        let id: i64 = conn.query_row(
            "INSERT INTO accounts
             (org_id, provider, email, display_name, status,
              encrypted_access_token, encrypted_refresh_token, token_expires_at, created_at)
             VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?)
             ON CONFLICT(org_id, provider, email) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, accounts.display_name),
                status = CASE WHEN accounts.status = 'syncing' THEN 'syncing' ELSE 'active' END,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                token_expires_at = excluded.token_expires_at,
                last_sync_error = NULL
             RETURNING id",
            params![
                account.org_id,
                account.provider.as_str(),
                account.email,
                account.display_name,
                account.encrypted_access_token,
                account.encrypted_refresh_token,
                to_text(account.token_expires_at),
                to_text(Utc::now()),
            ],
            |row| row.get(0),
        )?;

        debug!("[STORE] Upserted account {} ({})", id, account.email);
        Self::load_account(&conn, id)?.ok_or_else(|| anyhow!("Account {} vanished after insert", id))
    }

    fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn()?;
        Self::load_account(&conn, id)
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn try_begin_sync(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts SET status = 'syncing' WHERE id = ? AND status = 'active'",
            [id],
        )?;
        if changed == 0 && !account_exists(&conn, id)? {
            anyhow::bail!("Account {} not found", id);
        }
        Ok(changed == 1)
    }

    fn finish_sync(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE accounts SET status = 'active' WHERE id = ? AND status = 'syncing'",
            [id],
        )?;
        Ok(())
    }

    fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )
    }

    fn update_tokens(
        &self,
        id: i64,
        encrypted_access_token: &str,
        encrypted_refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET encrypted_access_token = ?, encrypted_refresh_token = ?,
                token_expires_at = ?
             WHERE id = ?",
            params![encrypted_access_token, encrypted_refresh_token, to_text(expires_at), id],
        )
    }

    fn save_sync_cursor(&self, id: i64, cursor: Option<&str>) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET sync_cursor = ? WHERE id = ?",
            params![cursor, id],
        )
    }

    fn record_sync_result(&self, id: i64, at: DateTime<Utc>, error: Option<&str>) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET last_sync_at = ?, last_sync_error = ? WHERE id = ?",
            params![to_text(at), error, id],
        )
    }

    fn save_backfill_progress(&self, id: i64, progress: &BackfillProgress) -> Result<()> {
        let json = serde_json::to_string(progress).context("Failed to serialize backfill progress")?;
        self.update_account(
            id,
            "UPDATE accounts SET backfill_progress = ? WHERE id = ?",
            params![json, id],
        )
    }

    fn find_thread_ids(
        &self,
        account_id: i64,
        provider_thread_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        if provider_thread_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; provider_thread_ids.len()].join(", ");
        let sql = format!(
            "SELECT provider_thread_id, id FROM threads
             WHERE account_id = ? AND provider_thread_id IN ({})",
            placeholders
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let values = std::iter::once(rusqlite::types::Value::Integer(account_id)).chain(
            provider_thread_ids
                .iter()
                .map(|id| rusqlite::types::Value::Text(id.clone())),
        );
        let found = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(found)
    }

    fn get_thread(&self, account_id: i64, provider_thread_id: &str) -> Result<Option<ThreadRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM threads WHERE account_id = ? AND provider_thread_id = ?",
            THREAD_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![account_id, provider_thread_id], thread_from_row)
            .optional()?)
    }

    fn get_thread_by_id(&self, thread_id: i64) -> Result<Option<ThreadRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM threads WHERE id = ?", THREAD_COLUMNS);
        Ok(conn.query_row(&sql, [thread_id], thread_from_row).optional()?)
    }

    fn upsert_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        summary: &ThreadSummary,
        now: DateTime<Utc>,
    ) -> Result<Upserted> {
        let participants = serde_json::to_string(&summary.participants)?;
        let labels = serde_json::to_string(&summary.labels)?;
        let flags = summary.flags;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // ON CONFLICT DO NOTHING reports whether this writer created the row;
        // a concurrent writer that lost the race falls through to the update.
        let created = tx.execute(
            "INSERT INTO threads (account_id, provider_thread_id, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, provider_thread_id) DO NOTHING",
            params![account_id, provider_thread_id, to_text(now), to_text(now)],
        )? == 1;

        // Only touch updated_at when the summary actually changes
        tx.execute(
            "UPDATE threads SET
                subject = ?1, snippet = ?2, participants = ?3, message_count = ?4,
                first_message_at = ?5, last_message_at = ?6, labels = ?7,
                is_read = ?8, is_starred = ?9, is_archived = ?10, is_draft = ?11,
                is_trashed = ?12, updated_at = ?13
             WHERE account_id = ?14 AND provider_thread_id = ?15
               AND (subject IS NOT ?1 OR snippet IS NOT ?2 OR participants IS NOT ?3
                    OR message_count IS NOT ?4 OR first_message_at IS NOT ?5
                    OR last_message_at IS NOT ?6 OR labels IS NOT ?7 OR is_read IS NOT ?8
                    OR is_starred IS NOT ?9 OR is_archived IS NOT ?10 OR is_draft IS NOT ?11
                    OR is_trashed IS NOT ?12)",
            params![
                summary.subject,
                summary.snippet,
                participants,
                summary.message_count as i64,
                summary.first_message_at.map(to_text),
                summary.last_message_at.map(to_text),
                labels,
                flags.is_read,
                flags.is_starred,
                flags.is_archived,
                flags.is_draft,
                flags.is_trashed,
                to_text(now),
                account_id,
                provider_thread_id,
            ],
        )?;

        let id = Self::thread_id_for(&tx, account_id, provider_thread_id)?
            .ok_or_else(|| anyhow!("Thread {} missing after upsert", provider_thread_id))?;
        tx.commit()?;

        Ok(Upserted { id, created })
    }

    fn ensure_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Upserted> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT INTO threads (account_id, provider_thread_id, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, provider_thread_id) DO NOTHING",
            params![account_id, provider_thread_id, to_text(now), to_text(now)],
        )? == 1;
        let id = Self::thread_id_for(&conn, account_id, provider_thread_id)?
            .ok_or_else(|| anyhow!("Thread {} missing after insert", provider_thread_id))?;
        Ok(Upserted { id, created })
    }

    fn set_thread_trashed(&self, thread_id: i64, trashed: bool, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE threads SET is_trashed = ?, updated_at = ? WHERE id = ? AND is_trashed != ?",
            params![trashed, to_text(now), thread_id, trashed],
        )?;
        Ok(changed == 1)
    }

    fn update_thread_labels(
        &self,
        thread_id: i64,
        labels: &[String],
        flags: ThreadFlags,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let labels = serde_json::to_string(labels)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE threads SET labels = ?, is_read = ?, is_starred = ?, is_archived = ?,
                is_draft = ?, is_trashed = ?, updated_at = ?
             WHERE id = ?",
            params![
                labels,
                flags.is_read,
                flags.is_starred,
                flags.is_archived,
                flags.is_draft,
                flags.is_trashed,
                to_text(now),
                thread_id,
            ],
        )?;
        Ok(())
    }

    fn count_threads(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn mark_thread_analyzed(&self, thread_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE threads SET last_analyzed_at = ? WHERE id = ?",
            params![to_text(at), thread_id],
        )?;
        Ok(())
    }

    fn get_message(&self, thread_id: i64, provider_message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE thread_id = ? AND provider_message_id = ?",
            MESSAGE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![thread_id, provider_message_id], message_from_row)
            .optional()?)
    }

    fn insert_message(&self, thread_id: i64, message: &ProviderMessage) -> Result<Upserted> {
        let body_text = compress(message.body_text.as_ref())?;
        let body_html = compress(message.body_html.as_ref())?;
        let references = serde_json::to_string(&message.references)?;
        let labels = serde_json::to_string(&message.labels)?;
        let flags = message.flags;

        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT INTO messages
             (thread_id, provider_message_id, subject, from_name, from_email, snippet,
              body_text, body_html, message_id_header, in_reply_to, message_references,
              labels, is_read, is_starred, is_draft, is_trashed, in_inbox,
              size, is_from_user, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id, provider_message_id) DO NOTHING",
            params![
                thread_id,
                message.provider_message_id,
                message.subject,
                message.from.as_ref().and_then(|f| f.name.clone()),
                message.from.as_ref().map(|f| f.email.clone()),
                message.snippet,
                body_text,
                body_html,
                message.message_id_header,
                message.in_reply_to,
                references,
                labels,
                flags.is_read,
                flags.is_starred,
                flags.is_draft,
                flags.is_trashed,
                flags.in_inbox,
                message.size as i64,
                message.is_from_user,
                to_text(message.sent_at),
            ],
        )? == 1;

        let id: i64 = conn.query_row(
            "SELECT id FROM messages WHERE thread_id = ? AND provider_message_id = ?",
            params![thread_id, message.provider_message_id],
            |row| row.get(0),
        )?;
        Ok(Upserted { id, created })
    }

    fn update_message_labels(&self, message_id: i64, labels: &[String], flags: MessageFlags) -> Result<()> {
        let labels = serde_json::to_string(labels)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE messages SET labels = ?, is_read = ?, is_starred = ?, is_draft = ?,
                is_trashed = ?, in_inbox = ?
             WHERE id = ?",
            params![
                labels,
                flags.is_read,
                flags.is_starred,
                flags.is_draft,
                flags.is_trashed,
                flags.in_inbox,
                message_id,
            ],
        )?;
        Ok(())
    }

    fn insert_participants(&self, message_id: i64, participants: &[Participant]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO participants (message_id, role, email, name) VALUES (?, ?, ?, ?)
                 ON CONFLICT(message_id, role, email) DO NOTHING",
            )?;
            for p in participants {
                stmt.execute(params![message_id, p.role.as_str(), p.email, p.name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_attachments(&self, message_id: i64, attachments: &[AttachmentMeta]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO attachments
                 (message_id, provider_attachment_id, filename, mime_type, size, content_id, is_inline)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id, provider_attachment_id) DO NOTHING",
            )?;
            for a in attachments {
                stmt.execute(params![
                    message_id,
                    a.provider_attachment_id,
                    a.filename,
                    a.mime_type,
                    a.size as i64,
                    a.content_id,
                    a.is_inline,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_messages(&self, thread_id: i64) -> Result<Vec<MessageRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE thread_id = ? ORDER BY sent_at ASC, id ASC",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map([thread_id], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn get_message_body(&self, message_id: i64) -> Result<Option<MessageBody>> {
        let row: Option<(Option<Vec<u8>>, Option<Vec<u8>>)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT body_text, body_html FROM messages WHERE id = ?",
                [message_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((text, html)) = row else {
            return Ok(None);
        };
        Ok(Some(MessageBody {
            text: decompress(text)?,
            html: decompress(html)?,
        }))
    }

    fn list_participants(&self, message_id: i64) -> Result<Vec<Participant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT role, email, name FROM participants WHERE message_id = ? ORDER BY rowid",
        )?;
        let participants = stmt
            .query_map([message_id], |row| {
                let role: String = row.get(0)?;
                Ok(Participant {
                    role: ParticipantRole::parse(&role)
                        .ok_or_else(|| conversion_error(0, format!("unknown role {}", role)))?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(participants)
    }

    fn list_attachments(&self, message_id: i64) -> Result<Vec<AttachmentMeta>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider_attachment_id, filename, mime_type, size, content_id, is_inline
             FROM attachments WHERE message_id = ? ORDER BY rowid",
        )?;
        let attachments = stmt
            .query_map([message_id], |row| {
                let size: i64 = row.get(3)?;
                Ok(AttachmentMeta {
                    provider_attachment_id: row.get(0)?,
                    filename: row.get(1)?,
                    mime_type: row.get(2)?,
                    size: size as u64,
                    content_id: row.get(4)?,
                    is_inline: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attachments)
    }
}
