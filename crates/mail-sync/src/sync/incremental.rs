//! Incremental sync from a stored change cursor
//!
//! One code path for every provider: the client turns its native change
//! feed (Gmail history, Graph delta) into a [`ChangeSet`] and this module
//! applies it.

use log::{info, warn};
use serde::Serialize;

use super::context::SyncContext;
use super::fetch::{FetchOptions, fetch_threads_parallel};
use super::ingest::{ProcessOptions, mark_thread_deleted, process_batch, update_thread_metadata};
use crate::error::{SyncError, SyncErrorCode, SyncFailure};
use crate::events::ThreadProcessed;
use crate::models::Account;
use crate::provider::ChangeSet;

/// Outcome of one incremental sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// False only when the run could not apply the change feed
    pub success: bool,
    pub failure: Option<SyncFailure>,
    /// Cursor to persist for the next run
    pub new_cursor: Option<String>,
    pub new_threads: usize,
    pub updated_threads: usize,
    pub deleted_threads: usize,
    /// Threads whose labels or flags changed without a refetch
    pub relabeled_threads: usize,
    /// Threads that could not be fetched or ingested
    pub failed_threads: usize,
}

impl SyncResult {
    /// The cursor has expired; nothing was applied
    pub fn full_sync_required() -> Self {
        Self {
            success: false,
            failure: Some(SyncFailure::full_sync_required()),
            ..Self::default()
        }
    }

    pub fn needs_backfill(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.code == SyncErrorCode::FullSyncRequired)
    }
}

/// Apply everything that changed since `cursor`.
///
/// Deleted threads are flagged trashed, label-only changes are applied
/// without refetching, changed threads are refetched and reconciled. A
/// changed thread that is gone by the time it is fetched counts as deleted.
/// Per-thread failures are counted and do not fail the run.
pub async fn sync_incremental(
    ctx: &SyncContext<'_>,
    account: &Account,
    cursor: &str,
    fetch_options: FetchOptions,
) -> Result<SyncResult, SyncError> {
    let changes: ChangeSet = ctx.client.get_changes(cursor).await?;

    if changes.full_sync_required {
        warn!(
            "[SYNC] Change cursor for account {} expired; backfill required",
            account.id
        );
        return Ok(SyncResult::full_sync_required());
    }

    let mut result = SyncResult {
        success: true,
        new_cursor: changes.new_cursor.clone().or_else(|| Some(cursor.to_string())),
        ..SyncResult::default()
    };

    for provider_thread_id in &changes.deleted_thread_ids {
        if mark_thread_deleted(ctx.store, account.id, provider_thread_id, ctx.now)? {
            result.deleted_threads += 1;
        }
    }

    if !changes.label_updates.is_empty() {
        let metadata = update_thread_metadata(ctx.store, account.id, &changes.label_updates, ctx.now)?;
        result.relabeled_threads = metadata.updated_thread_ids.len();
        for thread_id in metadata.updated_thread_ids {
            ctx.events.thread_processed(ThreadProcessed {
                thread_id,
                account_id: account.id,
                org_id: account.org_id,
                is_new: false,
            });
        }
    }

    if !changes.changed_thread_ids.is_empty() {
        let fetched =
            fetch_threads_parallel(ctx.client, &changes.changed_thread_ids, fetch_options, |_| {}).await;

        for provider_thread_id in fetched.not_found_ids() {
            if mark_thread_deleted(ctx.store, account.id, provider_thread_id, ctx.now)? {
                result.deleted_threads += 1;
            }
        }

        let ingested = process_batch(
            ctx.store,
            account.id,
            &fetched.threads,
            ProcessOptions::incremental(),
            ctx.now,
        );
        ctx.emit_processed(account, &ingested.outcomes);

        result.new_threads = ingested.new_threads();
        result.updated_threads = ingested.updated_threads();
        result.failed_threads = fetched.hard_failures() + ingested.errors.len();
    }

    info!(
        "[SYNC] Account {} incremental: {} new, {} updated, {} deleted, {} relabeled, {} failed",
        account.id,
        result.new_threads,
        result.updated_threads,
        result.deleted_threads,
        result.relabeled_threads,
        result.failed_threads
    );
    Ok(result)
}
