//! In-memory storage implementation
//!
//! Used by tests and for dry runs. Each table sits behind its own RwLock;
//! writes that must be atomic take a single lock for their whole duration.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::traits::{MessageBody, SyncStore, Upserted};
use crate::models::{
    Account, AccountStatus, AttachmentMeta, BackfillProgress, MessageFlags, MessageRecord,
    NewAccount, Participant, ProviderMessage, ThreadFlags, ThreadRecord, ThreadSummary,
};

#[derive(Default)]
struct ThreadTable {
    rows: BTreeMap<i64, ThreadRecord>,
    by_key: HashMap<(i64, String), i64>,
}

struct StoredMessage {
    record: MessageRecord,
    body: MessageBody,
}

#[derive(Default)]
struct MessageTable {
    rows: BTreeMap<i64, StoredMessage>,
    by_key: HashMap<(i64, String), i64>,
    participants: HashMap<i64, Vec<Participant>>,
    attachments: HashMap<i64, Vec<AttachmentMeta>>,
}

/// In-memory implementation of SyncStore
pub struct InMemorySyncStore {
    next_id: AtomicI64,
    accounts: RwLock<BTreeMap<i64, Account>>,
    threads: RwLock<ThreadTable>,
    messages: RwLock<MessageTable>,
    rejected_threads: RwLock<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            accounts: RwLock::new(BTreeMap::new()),
            threads: RwLock::new(ThreadTable::default()),
            messages: RwLock::new(MessageTable::default()),
            rejected_threads: RwLock::new(HashSet::new()),
        }
    }

    /// Make every later `upsert_thread` for this provider id fail
    pub fn reject_thread_writes(&self, provider_thread_id: &str) {
        write(&self.rejected_threads).insert(provider_thread_id.to_string());
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_account<R>(&self, id: i64, f: impl FnOnce(&mut Account) -> R) -> Result<R> {
        let mut accounts = write(&self.accounts);
        match accounts.get_mut(&id) {
            Some(account) => Ok(f(account)),
            None => bail!("Account {} not found", id),
        }
    }

    fn with_thread<R>(&self, id: i64, f: impl FnOnce(&mut ThreadRecord) -> R) -> Result<R> {
        let mut threads = write(&self.threads);
        match threads.rows.get_mut(&id) {
            Some(thread) => Ok(f(thread)),
            None => bail!("Thread {} not found", id),
        }
    }

    fn insert_thread_row(
        &self,
        table: &mut ThreadTable,
        account_id: i64,
        provider_thread_id: &str,
        summary: ThreadSummary,
        now: DateTime<Utc>,
    ) -> i64 {
        let id = self.next_id();
        table.rows.insert(
            id,
            ThreadRecord {
                id,
                account_id,
                provider_thread_id: provider_thread_id.to_string(),
                summary,
                last_analyzed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        table
            .by_key
            .insert((account_id, provider_thread_id.to_string()), id);
        id
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn insert_account(&self, new: NewAccount) -> Result<Account> {
        let mut accounts = write(&self.accounts);

        if let Some(existing) = accounts.values_mut().find(|a| {
            a.org_id == new.org_id && a.provider == new.provider && a.email == new.email
        }) {
            existing.encrypted_access_token = new.encrypted_access_token;
            existing.encrypted_refresh_token = new.encrypted_refresh_token;
            existing.token_expires_at = new.token_expires_at;
            existing.display_name = new.display_name.or(existing.display_name.take());
            // A run in flight keeps its claim; finish_sync releases it
            if existing.status != AccountStatus::Syncing {
                existing.status = AccountStatus::Active;
            }
            existing.last_sync_error = None;
            return Ok(existing.clone());
        }

        let id = self.next_id();
        let account = Account {
            id,
            org_id: new.org_id,
            provider: new.provider,
            email: new.email,
            display_name: new.display_name,
            status: AccountStatus::Active,
            encrypted_access_token: new.encrypted_access_token,
            encrypted_refresh_token: new.encrypted_refresh_token,
            token_expires_at: new.token_expires_at,
            sync_cursor: None,
            backfill_progress: BackfillProgress::default(),
            last_sync_at: None,
            last_sync_error: None,
            created_at: Utc::now(),
        };
        accounts.insert(id, account.clone());
        Ok(account)
    }

    fn get_account(&self, id: i64) -> Result<Option<Account>> {
        Ok(read(&self.accounts).get(&id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(read(&self.accounts).values().cloned().collect())
    }

    fn try_begin_sync(&self, id: i64) -> Result<bool> {
        self.with_account(id, |account| {
            if account.status != AccountStatus::Active {
                return false;
            }
            account.status = AccountStatus::Syncing;
            true
        })
    }

    fn finish_sync(&self, id: i64) -> Result<()> {
        self.with_account(id, |account| {
            if account.status == AccountStatus::Syncing {
                account.status = AccountStatus::Active;
            }
        })
    }

    fn set_account_status(&self, id: i64, status: AccountStatus) -> Result<()> {
        self.with_account(id, |account| account.status = status)
    }

    fn update_tokens(
        &self,
        id: i64,
        encrypted_access_token: &str,
        encrypted_refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_account(id, |account| {
            account.encrypted_access_token = encrypted_access_token.to_string();
            account.encrypted_refresh_token = encrypted_refresh_token.to_string();
            account.token_expires_at = expires_at;
        })
    }

    fn save_sync_cursor(&self, id: i64, cursor: Option<&str>) -> Result<()> {
        self.with_account(id, |account| account.sync_cursor = cursor.map(str::to_string))
    }

    fn record_sync_result(&self, id: i64, at: DateTime<Utc>, error: Option<&str>) -> Result<()> {
        self.with_account(id, |account| {
            account.last_sync_at = Some(at);
            account.last_sync_error = error.map(str::to_string);
        })
    }

    fn save_backfill_progress(&self, id: i64, progress: &BackfillProgress) -> Result<()> {
        self.with_account(id, |account| account.backfill_progress = progress.clone())
    }

    fn find_thread_ids(
        &self,
        account_id: i64,
        provider_thread_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let threads = read(&self.threads);
        Ok(provider_thread_ids
            .iter()
            .filter_map(|pid| {
                threads
                    .by_key
                    .get(&(account_id, pid.clone()))
                    .map(|id| (pid.clone(), *id))
            })
            .collect())
    }

    fn get_thread(&self, account_id: i64, provider_thread_id: &str) -> Result<Option<ThreadRecord>> {
        let threads = read(&self.threads);
        Ok(threads
            .by_key
            .get(&(account_id, provider_thread_id.to_string()))
            .and_then(|id| threads.rows.get(id))
            .cloned())
    }

    fn get_thread_by_id(&self, thread_id: i64) -> Result<Option<ThreadRecord>> {
        Ok(read(&self.threads).rows.get(&thread_id).cloned())
    }

    fn upsert_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        summary: &ThreadSummary,
        now: DateTime<Utc>,
    ) -> Result<Upserted> {
        if read(&self.rejected_threads).contains(provider_thread_id) {
            bail!("Write rejected for thread {}", provider_thread_id);
        }
        let mut threads = write(&self.threads);
        let key = (account_id, provider_thread_id.to_string());

        if let Some(&id) = threads.by_key.get(&key) {
            if let Some(row) = threads.rows.get_mut(&id)
                && row.summary != *summary
            {
                row.summary = summary.clone();
                row.updated_at = now;
            }
            return Ok(Upserted { id, created: false });
        }

        let id = self.insert_thread_row(&mut threads, account_id, provider_thread_id, summary.clone(), now);
        Ok(Upserted { id, created: true })
    }

    fn ensure_thread(
        &self,
        account_id: i64,
        provider_thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Upserted> {
        let mut threads = write(&self.threads);
        if let Some(&id) = threads.by_key.get(&(account_id, provider_thread_id.to_string())) {
            return Ok(Upserted { id, created: false });
        }
        let id = self.insert_thread_row(
            &mut threads,
            account_id,
            provider_thread_id,
            ThreadSummary::default(),
            now,
        );
        Ok(Upserted { id, created: true })
    }

    fn set_thread_trashed(&self, thread_id: i64, trashed: bool, now: DateTime<Utc>) -> Result<bool> {
        self.with_thread(thread_id, |thread| {
            if thread.summary.flags.is_trashed == trashed {
                return false;
            }
            thread.summary.flags.is_trashed = trashed;
            thread.updated_at = now;
            true
        })
    }

    fn update_thread_labels(
        &self,
        thread_id: i64,
        labels: &[String],
        flags: ThreadFlags,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_thread(thread_id, |thread| {
            thread.summary.labels = labels.to_vec();
            thread.summary.flags = flags;
            thread.updated_at = now;
        })
    }

    fn count_threads(&self, account_id: i64) -> Result<usize> {
        Ok(read(&self.threads)
            .rows
            .values()
            .filter(|t| t.account_id == account_id)
            .count())
    }

    fn mark_thread_analyzed(&self, thread_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.with_thread(thread_id, |thread| thread.last_analyzed_at = Some(at))
    }

    fn get_message(&self, thread_id: i64, provider_message_id: &str) -> Result<Option<MessageRecord>> {
        let messages = read(&self.messages);
        Ok(messages
            .by_key
            .get(&(thread_id, provider_message_id.to_string()))
            .and_then(|id| messages.rows.get(id))
            .map(|m| m.record.clone()))
    }

    fn insert_message(&self, thread_id: i64, message: &ProviderMessage) -> Result<Upserted> {
        if read(&self.threads).rows.get(&thread_id).is_none() {
            bail!("Thread {} not found", thread_id);
        }

        let mut messages = write(&self.messages);
        let key = (thread_id, message.provider_message_id.clone());
        if let Some(&id) = messages.by_key.get(&key) {
            return Ok(Upserted { id, created: false });
        }

        let id = self.next_id();
        messages.rows.insert(
            id,
            StoredMessage {
                record: MessageRecord {
                    id,
                    thread_id,
                    provider_message_id: message.provider_message_id.clone(),
                    subject: message.subject.clone(),
                    from: message.from.clone(),
                    sent_at: message.sent_at,
                    labels: message.labels.clone(),
                    flags: message.flags,
                    size: message.size,
                    is_from_user: message.is_from_user,
                },
                body: MessageBody {
                    text: message.body_text.clone(),
                    html: message.body_html.clone(),
                },
            },
        );
        messages.by_key.insert(key, id);
        Ok(Upserted { id, created: true })
    }

    fn update_message_labels(&self, message_id: i64, labels: &[String], flags: MessageFlags) -> Result<()> {
        let mut messages = write(&self.messages);
        let Some(message) = messages.rows.get_mut(&message_id) else {
            bail!("Message {} not found", message_id);
        };
        message.record.labels = labels.to_vec();
        message.record.flags = flags;
        Ok(())
    }

    fn insert_participants(&self, message_id: i64, participants: &[Participant]) -> Result<()> {
        let mut messages = write(&self.messages);
        let rows = messages.participants.entry(message_id).or_default();
        for participant in participants {
            if !rows
                .iter()
                .any(|p| p.role == participant.role && p.email == participant.email)
            {
                rows.push(participant.clone());
            }
        }
        Ok(())
    }

    fn insert_attachments(&self, message_id: i64, attachments: &[AttachmentMeta]) -> Result<()> {
        let mut messages = write(&self.messages);
        let rows = messages.attachments.entry(message_id).or_default();
        for attachment in attachments {
            if !rows
                .iter()
                .any(|a| a.provider_attachment_id == attachment.provider_attachment_id)
            {
                rows.push(attachment.clone());
            }
        }
        Ok(())
    }

    fn list_messages(&self, thread_id: i64) -> Result<Vec<MessageRecord>> {
        let mut records: Vec<MessageRecord> = read(&self.messages)
            .rows
            .values()
            .filter(|m| m.record.thread_id == thread_id)
            .map(|m| m.record.clone())
            .collect();
        records.sort_by_key(|m| (m.sent_at, m.id));
        Ok(records)
    }

    fn get_message_body(&self, message_id: i64) -> Result<Option<MessageBody>> {
        Ok(read(&self.messages)
            .rows
            .get(&message_id)
            .map(|m| m.body.clone()))
    }

    fn list_participants(&self, message_id: i64) -> Result<Vec<Participant>> {
        Ok(read(&self.messages)
            .participants
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }

    fn list_attachments(&self, message_id: i64) -> Result<Vec<AttachmentMeta>> {
        Ok(read(&self.messages)
            .attachments
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, Provider};

    fn account(store: &InMemorySyncStore) -> Account {
        store
            .insert_account(NewAccount::new(1, Provider::Gmail, "user@example.com"))
            .unwrap()
    }

    #[test]
    fn test_try_begin_sync_is_exclusive() {
        let store = InMemorySyncStore::new();
        let account = account(&store);

        assert!(store.try_begin_sync(account.id).unwrap());
        assert!(!store.try_begin_sync(account.id).unwrap());

        store.finish_sync(account.id).unwrap();
        assert!(store.try_begin_sync(account.id).unwrap());
    }

    #[test]
    fn test_finish_sync_preserves_expired() {
        let store = InMemorySyncStore::new();
        let account = account(&store);

        store.try_begin_sync(account.id).unwrap();
        store.set_account_status(account.id, AccountStatus::Expired).unwrap();
        store.finish_sync(account.id).unwrap();

        let account = store.get_account(account.id).unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Expired);
        assert!(!store.try_begin_sync(account.id).unwrap());
    }

    #[test]
    fn test_reconnect_reactivates() {
        let store = InMemorySyncStore::new();
        let first = account(&store);
        store.set_account_status(first.id, AccountStatus::Expired).unwrap();

        let again = store
            .insert_account(
                NewAccount::new(1, Provider::Gmail, "user@example.com").with_tokens(
                    "a2",
                    "r2",
                    Utc::now(),
                ),
            )
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, AccountStatus::Active);
        assert_eq!(again.encrypted_access_token, "a2");
        assert_eq!(store.list_accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_reconnect_during_sync_keeps_claim() {
        let store = InMemorySyncStore::new();
        let first = account(&store);
        assert!(store.try_begin_sync(first.id).unwrap());

        let again = store
            .insert_account(NewAccount::new(1, Provider::Gmail, "user@example.com"))
            .unwrap();
        assert_eq!(again.status, AccountStatus::Syncing);
        assert!(!store.try_begin_sync(first.id).unwrap());

        store.finish_sync(first.id).unwrap();
        assert_eq!(store.get_account(first.id).unwrap().unwrap().status, AccountStatus::Active);
    }

    #[test]
    fn test_thread_key_is_unique() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();

        let first = store.ensure_thread(1, "t1", now).unwrap();
        let second = store.upsert_thread(1, "t1", &ThreadSummary::default(), now).unwrap();
        let other_account = store.ensure_thread(2, "t1", now).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other_account.id);
        assert_eq!(store.count_threads(1).unwrap(), 1);
    }

    #[test]
    fn test_insert_message_never_overwrites() {
        let store = InMemorySyncStore::new();
        let thread = store.ensure_thread(1, "t1", Utc::now()).unwrap();

        let original = ProviderMessage::builder("m1")
            .from(EmailAddress::new("a@example.com"))
            .subject("Original")
            .body_text(Some("hello".to_string()))
            .build();
        let changed = ProviderMessage::builder("m1").subject("Changed").build();

        assert!(store.insert_message(thread.id, &original).unwrap().created);
        assert!(!store.insert_message(thread.id, &changed).unwrap().created);

        let record = store.get_message(thread.id, "m1").unwrap().unwrap();
        assert_eq!(record.subject, "Original");
        let body = store.get_message_body(record.id).unwrap().unwrap();
        assert_eq!(body.text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_message_requires_thread() {
        let store = InMemorySyncStore::new();
        let message = ProviderMessage::builder("m1").build();
        assert!(store.insert_message(42, &message).is_err());
    }
}
