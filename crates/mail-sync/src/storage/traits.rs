//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{
    Account, AccountStatus, AttachmentMeta, BackfillProgress, MessageFlags, MessageRecord,
    NewAccount, Participant, ProviderMessage, ThreadFlags, ThreadRecord, ThreadSummary,
};

/// Decompressed message bodies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Outcome of an insert-if-absent write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    /// True when this call created the row
    pub created: bool,
}

/// Persistence for accounts and the mail they sync
///
/// Thread rows are unique per `(account_id, provider_thread_id)` and message
/// rows per `(thread_id, provider_message_id)`. Every write is keyed on those
/// pairs so concurrent writers converge on the same row.
pub trait SyncStore: Send + Sync {
    // === Accounts ===

    /// Insert an account. Reconnecting an existing mailbox replaces its
    /// credentials and reactivates it.
    fn insert_account(&self, account: NewAccount) -> Result<Account>;

    fn get_account(&self, id: i64) -> Result<Option<Account>>;

    /// All accounts ordered by id
    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Atomically move `active` to `syncing`. Returns false (and changes
    /// nothing) when the account is in any other status.
    fn try_begin_sync(&self, id: i64) -> Result<bool>;

    /// Move `syncing` back to `active`; any other status is left as is
    fn finish_sync(&self, id: i64) -> Result<()>;

    fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<()>;

    fn update_tokens(
        &self,
        id: i64,
        encrypted_access_token: &str,
        encrypted_refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Store (or clear) the provider change cursor
    fn save_sync_cursor(&self, id: i64, cursor: Option<&str>) -> Result<()>;

    /// Record the end of a sync run: `last_sync_at` and the top-level error,
    /// `None` clearing a previous one
    fn record_sync_result(&self, id: i64, at: DateTime<Utc>, error: Option<&str>) -> Result<()>;

    fn save_backfill_progress(&self, id: i64, progress: &BackfillProgress) -> Result<()>;

    // === Threads ===

    /// Map the subset of `provider_thread_ids` that already exist to their
    /// local ids. Callers bound the slice length.
    fn find_thread_ids(
        &self,
        account_id: i64,
        provider_thread_ids: &[String],
    ) -> Result<HashMap<String, i64>>;

    fn get_thread(&self, account_id: i64, provider_thread_id: &str) -> Result<Option<ThreadRecord>>;

    fn get_thread_by_id(&self, thread_id: i64) -> Result<Option<ThreadRecord>>;

    /// Insert the thread or overwrite its summary in place
    fn upsert_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        summary: &ThreadSummary,
        now: DateTime<Utc>,
    ) -> Result<Upserted>;

    /// Make sure a row exists for the key, creating an empty placeholder if not
    fn ensure_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Upserted>;

    /// Set the trashed flag; returns false if it already had that value
    fn set_thread_trashed(&self, thread_id: i64, trashed: bool, now: DateTime<Utc>) -> Result<bool>;

    /// Replace the thread's label union and aggregated flags
    fn update_thread_labels(
        &self,
        thread_id: i64,
        labels: &[String],
        flags: ThreadFlags,
        now: DateTime<Utc>,
    ) -> Result<()>;

    fn count_threads(&self, account_id: i64) -> Result<usize>;

    /// Advance the downstream analysis watermark
    fn mark_thread_analyzed(&self, thread_id: i64, at: DateTime<Utc>) -> Result<()>;

    // === Messages ===

    fn get_message(&self, thread_id: i64, provider_message_id: &str) -> Result<Option<MessageRecord>>;

    /// Insert the message unless the key exists; an existing row is never modified
    fn insert_message(&self, thread_id: i64, message: &ProviderMessage) -> Result<Upserted>;

    fn update_message_labels(&self, message_id: i64, labels: &[String], flags: MessageFlags) -> Result<()>;

    /// Write-once: duplicates of existing (role, email) rows are ignored
    fn insert_participants(&self, message_id: i64, participants: &[Participant]) -> Result<()>;

    /// Write-once: duplicates of existing attachment ids are ignored
    fn insert_attachments(&self, message_id: i64, attachments: &[AttachmentMeta]) -> Result<()>;

    /// Messages of a thread ordered by `sent_at` ascending
    fn list_messages(&self, thread_id: i64) -> Result<Vec<MessageRecord>>;

    fn get_message_body(&self, message_id: i64) -> Result<Option<MessageBody>>;

    fn list_participants(&self, message_id: i64) -> Result<Vec<Participant>>;

    fn list_attachments(&self, message_id: i64) -> Result<Vec<AttachmentMeta>>;
}
