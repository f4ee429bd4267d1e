//! Idempotent ingestion of normalized threads into the store
//!
//! Threads and messages are matched by their dedup keys before any write.
//! Participants and attachments are written only when a message row is
//! first created, since envelope and attachment data never change.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::BTreeMap;

use crate::models::{ProviderMessage, ProviderThread, ThreadFlags, ThreadSummary, union_labels};
use crate::provider::LabelUpdate;
use crate::storage::SyncStore;

/// How to treat threads that already exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Return early without writing when the thread row exists
    pub skip_existing: bool,
    /// Process even when `skip_existing` would short-circuit
    pub force_update: bool,
}

impl ProcessOptions {
    /// Backfill: threads already imported are left alone
    pub fn backfill() -> Self {
        Self {
            skip_existing: true,
            force_update: false,
        }
    }

    /// Incremental: changed threads are always reconciled
    pub fn incremental() -> Self {
        Self::default()
    }
}

/// Outcome of processing one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub thread_id: i64,
    /// The thread row was created by this call
    pub is_new: bool,
    /// An existing thread (or one of its messages) changed
    pub was_updated: bool,
    pub messages_added: usize,
}

impl ProcessOutcome {
    pub fn changed(&self) -> bool {
        self.is_new || self.was_updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Ingest one thread with all of its messages
pub fn process_thread(
    store: &dyn SyncStore,
    account_id: i64,
    thread: &ProviderThread,
    options: ProcessOptions,
    now: DateTime<Utc>,
) -> Result<ProcessOutcome> {
    let existing = store.get_thread(account_id, &thread.provider_thread_id)?;

    if let Some(existing) = &existing
        && options.skip_existing
        && !options.force_update
    {
        return Ok(ProcessOutcome {
            thread_id: existing.id,
            is_new: false,
            was_updated: false,
            messages_added: 0,
        });
    }

    let summary = ThreadSummary::from_thread(thread);
    let upserted = store.upsert_thread(account_id, &thread.provider_thread_id, &summary, now)?;

    let mut changed = existing.as_ref().is_some_and(|e| e.summary != summary);
    let mut messages_added = 0;
    for message in &thread.messages {
        match process_message(store, upserted.id, message)? {
            MessageOutcome::Inserted => {
                messages_added += 1;
                changed = true;
            }
            MessageOutcome::Updated => changed = true,
            MessageOutcome::Unchanged => {}
        }
    }

    Ok(ProcessOutcome {
        thread_id: upserted.id,
        is_new: upserted.created,
        was_updated: !upserted.created && changed,
        messages_added,
    })
}

fn process_message(
    store: &dyn SyncStore,
    thread_id: i64,
    message: &ProviderMessage,
) -> Result<MessageOutcome> {
    if let Some(existing) = store.get_message(thread_id, &message.provider_message_id)? {
        if existing.labels == message.labels && existing.flags == message.flags {
            return Ok(MessageOutcome::Unchanged);
        }
        store.update_message_labels(existing.id, &message.labels, message.flags)?;
        return Ok(MessageOutcome::Updated);
    }

    let inserted = store.insert_message(thread_id, message)?;
    if !inserted.created {
        // A concurrent writer got there first
        return Ok(MessageOutcome::Unchanged);
    }

    store.insert_participants(inserted.id, &message.participants())?;
    if !message.attachments.is_empty() {
        store.insert_attachments(inserted.id, &message.attachments)?;
    }
    Ok(MessageOutcome::Inserted)
}

/// A thread that failed to ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestError {
    pub provider_thread_id: String,
    pub message: String,
}

/// Aggregate result of [`process_batch`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: Vec<ProcessOutcome>,
    pub errors: Vec<IngestError>,
}

impl BatchResult {
    pub fn new_threads(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_new).count()
    }

    pub fn updated_threads(&self) -> usize {
        self.outcomes.iter().filter(|o| o.was_updated).count()
    }

    pub fn unchanged_threads(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.changed()).count()
    }
}

/// Ingest a batch; one thread failing is recorded and skipped
pub fn process_batch(
    store: &dyn SyncStore,
    account_id: i64,
    threads: &[ProviderThread],
    options: ProcessOptions,
    now: DateTime<Utc>,
) -> BatchResult {
    let mut result = BatchResult::default();

    for thread in threads {
        match process_thread(store, account_id, thread, options, now) {
            Ok(outcome) => result.outcomes.push(outcome),
            Err(e) => {
                warn!(
                    "[SYNC] Failed to ingest thread {}: {:#}",
                    thread.provider_thread_id, e
                );
                result.errors.push(IngestError {
                    provider_thread_id: thread.provider_thread_id.clone(),
                    message: format!("{:#}", e),
                });
            }
        }
    }

    debug!(
        "[SYNC] Batch for account {}: {} new, {} updated, {} unchanged, {} failed",
        account_id,
        result.new_threads(),
        result.updated_threads(),
        result.unchanged_threads(),
        result.errors.len()
    );
    result
}

/// Flag a thread as trashed. Returns false when the thread is unknown or
/// already trashed.
pub fn mark_thread_deleted(
    store: &dyn SyncStore,
    account_id: i64,
    provider_thread_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    match store.get_thread(account_id, provider_thread_id)? {
        Some(thread) => store.set_thread_trashed(thread.id, true, now),
        None => Ok(false),
    }
}

/// Result of [`update_thread_metadata`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataResult {
    /// Local ids of threads whose labels or flags changed
    pub updated_thread_ids: Vec<i64>,
    pub messages_updated: usize,
    /// Updates for threads or messages that are not stored
    pub skipped: usize,
}

/// Apply label/flag-only changes without refetching bodies, then
/// recompute each touched thread's label union and flags.
pub fn update_thread_metadata(
    store: &dyn SyncStore,
    account_id: i64,
    updates: &[LabelUpdate],
    now: DateTime<Utc>,
) -> Result<MetadataResult> {
    let mut by_thread: BTreeMap<&str, Vec<&LabelUpdate>> = BTreeMap::new();
    for update in updates {
        by_thread
            .entry(update.provider_thread_id.as_str())
            .or_default()
            .push(update);
    }

    let mut result = MetadataResult::default();
    for (provider_thread_id, updates) in by_thread {
        let Some(thread) = store.get_thread(account_id, provider_thread_id)? else {
            result.skipped += updates.len();
            continue;
        };

        let mut changed = false;
        for update in updates {
            match store.get_message(thread.id, &update.provider_message_id)? {
                Some(message) if message.labels != update.labels || message.flags != update.flags => {
                    store.update_message_labels(message.id, &update.labels, update.flags)?;
                    result.messages_updated += 1;
                    changed = true;
                }
                Some(_) => {}
                None => result.skipped += 1,
            }
        }

        if changed {
            let messages = store.list_messages(thread.id)?;
            let labels = union_labels(messages.iter().map(|m| m.labels.as_slice()));
            let flags = ThreadFlags::aggregate(messages.iter().map(|m| &m.flags));
            store.update_thread_labels(thread.id, &labels, flags, now)?;
            result.updated_thread_ids.push(thread.id);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageFlags;
    use crate::provider::fake::sample_thread;
    use crate::storage::InMemorySyncStore;

    #[test]
    fn test_process_thread_twice_is_idempotent() {
        let store = InMemorySyncStore::new();
        let thread = sample_thread("t1", 3);
        let now = Utc::now();

        let first = process_thread(&store, 1, &thread, ProcessOptions::backfill(), now).unwrap();
        assert!(first.is_new);
        assert_eq!(first.messages_added, 3);

        let before = store.get_thread(1, "t1").unwrap().unwrap();
        let second = process_thread(&store, 1, &thread, ProcessOptions::backfill(), now).unwrap();
        assert!(!second.is_new);
        assert!(!second.was_updated);
        assert_eq!(store.get_thread(1, "t1").unwrap().unwrap(), before);
    }

    #[test]
    fn test_reprocessing_unchanged_thread_reports_nothing() {
        let store = InMemorySyncStore::new();
        let thread = sample_thread("t1", 2);
        let now = Utc::now();

        process_thread(&store, 1, &thread, ProcessOptions::incremental(), now).unwrap();
        let again = process_thread(&store, 1, &thread, ProcessOptions::incremental(), now).unwrap();
        assert!(!again.changed());
        assert_eq!(again.messages_added, 0);
    }

    #[test]
    fn test_new_message_updates_existing_thread() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        process_thread(&store, 1, &sample_thread("t1", 1), ProcessOptions::incremental(), now).unwrap();

        let grown = sample_thread("t1", 2);
        let outcome = process_thread(&store, 1, &grown, ProcessOptions::incremental(), now).unwrap();
        assert!(!outcome.is_new);
        assert!(outcome.was_updated);
        assert_eq!(outcome.messages_added, 1);

        let thread = store.get_thread(1, "t1").unwrap().unwrap();
        assert_eq!(thread.summary.message_count, 2);
        assert_eq!(store.list_messages(thread.id).unwrap().len(), 2);
    }

    #[test]
    fn test_skip_existing_unless_forced() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        process_thread(&store, 1, &sample_thread("t1", 1), ProcessOptions::backfill(), now).unwrap();

        let grown = sample_thread("t1", 2);
        let skipped = process_thread(&store, 1, &grown, ProcessOptions::backfill(), now).unwrap();
        assert_eq!(skipped.messages_added, 0);

        let forced = ProcessOptions {
            skip_existing: true,
            force_update: true,
        };
        let outcome = process_thread(&store, 1, &grown, forced, now).unwrap();
        assert_eq!(outcome.messages_added, 1);
    }

    #[test]
    fn test_participants_and_attachments_written_once() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        let thread = sample_thread("t1", 1);
        process_thread(&store, 1, &thread, ProcessOptions::incremental(), now).unwrap();

        // Same message, different labels: only labels change
        let mut relabeled = thread.clone();
        relabeled.messages[0].labels = vec!["IMPORTANT".to_string()];
        let outcome = process_thread(&store, 1, &relabeled, ProcessOptions::incremental(), now).unwrap();
        assert!(outcome.was_updated);

        let record = store.get_thread(1, "t1").unwrap().unwrap();
        let message = store.list_messages(record.id).unwrap().remove(0);
        assert_eq!(message.labels, vec!["IMPORTANT"]);
        assert_eq!(store.list_participants(message.id).unwrap().len(), 2);
        assert_eq!(store.list_attachments(message.id).unwrap().len(), 1);
    }

    #[test]
    fn test_fills_placeholder_thread() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        store.ensure_thread(1, "t1", now).unwrap();

        let outcome = process_thread(&store, 1, &sample_thread("t1", 1), ProcessOptions::incremental(), now).unwrap();
        assert!(!outcome.is_new);
        assert!(outcome.was_updated);
        assert_eq!(store.get_thread(1, "t1").unwrap().unwrap().summary.message_count, 1);
    }

    #[test]
    fn test_mark_thread_deleted() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        process_thread(&store, 1, &sample_thread("t1", 1), ProcessOptions::backfill(), now).unwrap();

        assert!(mark_thread_deleted(&store, 1, "t1", now).unwrap());
        assert!(!mark_thread_deleted(&store, 1, "t1", now).unwrap());
        assert!(!mark_thread_deleted(&store, 1, "unknown", now).unwrap());
        assert!(store.get_thread(1, "t1").unwrap().unwrap().summary.flags.is_trashed);
        // Never hard-deleted
        assert_eq!(store.count_threads(1).unwrap(), 1);
    }

    #[test]
    fn test_update_thread_metadata() {
        let store = InMemorySyncStore::new();
        let now = Utc::now();
        process_thread(&store, 1, &sample_thread("t1", 2), ProcessOptions::backfill(), now).unwrap();

        let updates = vec![
            LabelUpdate {
                provider_thread_id: "t1".to_string(),
                provider_message_id: "t1-m0".to_string(),
                labels: vec!["STARRED".to_string()],
                flags: MessageFlags {
                    is_read: true,
                    is_starred: true,
                    ..Default::default()
                },
            },
            LabelUpdate {
                provider_thread_id: "t9".to_string(),
                provider_message_id: "t9-m0".to_string(),
                labels: Vec::new(),
                flags: MessageFlags::default(),
            },
        ];

        let result = update_thread_metadata(&store, 1, &updates, now).unwrap();
        assert_eq!(result.messages_updated, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.updated_thread_ids.len(), 1);

        let thread = store.get_thread(1, "t1").unwrap().unwrap();
        assert_eq!(thread.summary.labels, vec!["INBOX", "STARRED"]);
        assert!(thread.summary.flags.is_starred);
        // t1-m1 is still in the inbox and unread
        assert!(!thread.summary.flags.is_archived);
        assert!(!thread.summary.flags.is_read);

        let again = update_thread_metadata(&store, 1, &updates[..1], now).unwrap();
        assert!(again.updated_thread_ids.is_empty());
    }

    #[test]
    fn test_process_batch_isolates_failures() {
        let store = InMemorySyncStore::new();
        store.reject_thread_writes("b");
        let now = Utc::now();

        let threads = vec![sample_thread("a", 1), sample_thread("b", 1), sample_thread("c", 2)];
        let result = process_batch(&store, 1, &threads, ProcessOptions::backfill(), now);

        assert_eq!(result.new_threads(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].provider_thread_id, "b");
        assert!(store.get_thread(1, "c").unwrap().is_some());
    }
}
