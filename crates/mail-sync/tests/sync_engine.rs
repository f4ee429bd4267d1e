//! End-to-end tests for backfill, incremental sync and the orchestrator
//!
//! These run the public API against a scripted provider, on both store
//! backends.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, ScriptedProvider, thread};
use mail_sync::sync::{FetchOptions, ProcessOptions, deduplicate_threads};
use mail_sync::{
    AccountStatus, BackfillPhase, ChangeSet, ChannelEventSink, InMemorySyncStore, ProviderError,
    SqliteSyncStore, SyncErrorCode, SyncStore, fetch_threads_parallel, get_phase_date_range,
    process_thread, run_backfill_chain, run_sync_sweep,
};
use tempfile::TempDir;

fn sqlite_store(dir: &TempDir) -> Arc<dyn SyncStore> {
    Arc::new(SqliteSyncStore::new(&dir.path().join("sync.test.sqlite")).unwrap())
}

#[tokio::test]
async fn test_priority_backfill_end_to_end() {
    let dir = TempDir::new().unwrap();
    let provider = ScriptedProvider::new(vec![thread("a", 1, 2), thread("b", 5, 1), thread("c", 30, 3)]);
    let h = Harness::new(sqlite_store(&dir), provider);
    let account = h.connect("owner@example.com");
    assert!(account.sync_cursor.is_none());

    let outcome = h
        .orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();

    assert_eq!(outcome.total_threads, 3);
    assert_eq!(outcome.new_threads, 3);
    assert!(outcome.phase_complete);
    assert_eq!(outcome.next_phase, BackfillPhase::Extended);
    assert!(outcome.new_cursor.is_some());

    let stored = h.account(account.id);
    assert_eq!(stored.sync_cursor, outcome.new_cursor);
    assert_eq!(stored.status, AccountStatus::Active);
    assert_eq!(stored.backfill_progress.phase, BackfillPhase::Extended);
    assert_eq!(h.store.count_threads(account.id).unwrap(), 3);

    let c = h.store.get_thread(account.id, "c").unwrap().unwrap();
    assert_eq!(c.summary.message_count, 3);
    assert_eq!(h.store.list_messages(c.id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_backfill_chain_routes_threads_to_their_phase() {
    let provider = ScriptedProvider::new(vec![
        thread("recent", 10, 1),
        thread("last-year", 200, 1),
        thread("ancient", 800, 1),
    ]);
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");

    let ended = run_backfill_chain(h.orchestrator.clone(), account.id, 3).await.unwrap();
    assert_eq!(ended, BackfillPhase::Complete);

    let progress = h.account(account.id).backfill_progress;
    assert!(progress.is_complete());
    for phase in [BackfillPhase::Priority, BackfillPhase::Extended, BackfillPhase::Archive] {
        let counters = progress.counters(phase).unwrap();
        assert_eq!(counters.new_threads, 1, "phase {}", phase);
        assert!(counters.completed_at.is_some());
    }
    assert_eq!(h.store.count_threads(account.id).unwrap(), 3);
    // Each thread was fetched exactly once across the chain
    assert_eq!(h.provider.get_thread_calls(), 3);
}

#[tokio::test]
async fn test_rerunning_a_phase_does_not_refetch() {
    let provider = ScriptedProvider::new((0..7).map(|i| thread(&format!("t{}", i), 3, 1)).collect());
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");

    h.orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();
    assert_eq!(h.provider.get_thread_calls(), 7);

    // A restarted backfill re-enters priority with everything already stored
    h.orchestrator.start_backfill(account.id).unwrap();
    let outcome = h
        .orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();
    assert_eq!(outcome.existing_threads, 7);
    assert_eq!(outcome.new_threads, 0);
    assert_eq!(h.provider.get_thread_calls(), 7);
}

#[tokio::test]
async fn test_failed_thread_is_imported_once_provider_recovers() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1), thread("b", 1, 1), thread("c", 1, 1)]);
    provider.fail_thread("b");
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");

    let outcome = h
        .orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();
    assert_eq!(outcome.new_threads, 2);
    assert_eq!(outcome.failed_threads, 1);
    assert!(!outcome.phase_complete);

    let stored = h.account(account.id);
    assert_eq!(stored.last_sync_error.as_deref(), Some("1 threads failed to sync"));
    assert_eq!(stored.backfill_progress.error_count, 1);
    assert_eq!(stored.backfill_progress.phase, BackfillPhase::Priority);
    assert_eq!(stored.status, AccountStatus::Active);

    h.provider.recover_thread("b");
    let calls_before = h.provider.get_thread_calls();
    let outcome = h
        .orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();
    assert_eq!(outcome.new_threads, 1);
    assert_eq!(outcome.existing_threads, 2);
    assert!(outcome.phase_complete);
    // Only the thread that failed is fetched again
    assert_eq!(h.provider.get_thread_calls(), calls_before + 1);
    assert!(h.store.get_thread(account.id, "b").unwrap().is_some());
    assert_eq!(h.account(account.id).last_sync_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_chain_retries_transient_thread_failure() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1), thread("b", 1, 1), thread("old", 200, 1)]);
    provider.fail_thread("b");
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");

    let provider = h.provider.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        provider.recover_thread("b");
    });

    let ended = run_backfill_chain(h.orchestrator.clone(), account.id, 3).await.unwrap();
    assert_eq!(ended, BackfillPhase::Complete);
    assert_eq!(h.store.count_threads(account.id).unwrap(), 3);
    assert!(h.store.get_thread(account.id, "b").unwrap().is_some());
    let progress = h.account(account.id).backfill_progress;
    assert_eq!(progress.counters(BackfillPhase::Priority).unwrap().incomplete_runs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_chain_moves_past_a_thread_that_never_recovers() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1), thread("b", 1, 1)]);
    provider.fail_thread("b");
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");

    let ended = run_backfill_chain(h.orchestrator.clone(), account.id, 3).await.unwrap();
    assert_eq!(ended, BackfillPhase::Complete);
    assert!(h.store.get_thread(account.id, "b").unwrap().is_none());
    assert_eq!(h.account(account.id).backfill_progress.error_count, 3);
}

#[test]
fn test_process_thread_is_idempotent_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir);
    let now = Utc::now();
    let input = thread("t1", 2, 3);

    let first = process_thread(store.as_ref(), 1, &input, ProcessOptions::backfill(), now).unwrap();
    let row = store.get_thread(1, "t1").unwrap().unwrap();
    let messages = store.list_messages(row.id).unwrap();

    let later = now + chrono::Duration::minutes(5);
    let second = process_thread(store.as_ref(), 1, &input, ProcessOptions::backfill(), later).unwrap();

    assert!(first.is_new);
    assert!(!second.is_new);
    assert!(!second.was_updated);
    assert_eq!(store.get_thread(1, "t1").unwrap().unwrap(), row);
    assert_eq!(store.list_messages(row.id).unwrap(), messages);

    // Full reconciliation of identical input is also a no-op
    let third = process_thread(store.as_ref(), 1, &input, ProcessOptions::incremental(), later).unwrap();
    assert!(!third.was_updated);
    assert_eq!(store.get_thread(1, "t1").unwrap().unwrap(), row);
}

#[test]
fn test_dedup_partitions_exactly() {
    let store = InMemorySyncStore::new();
    let now = Utc::now();
    let existing: HashSet<String> = (0..300).step_by(3).map(|i| format!("t{}", i)).collect();
    for id in &existing {
        store.ensure_thread(1, id, now).unwrap();
    }

    let query: Vec<String> = (0..250).map(|i| format!("t{}", i)).collect();
    let result = deduplicate_threads(&store, 1, &query).unwrap();

    let expected_existing: Vec<String> = query.iter().filter(|id| existing.contains(*id)).cloned().collect();
    let expected_new: Vec<String> = query.iter().filter(|id| !existing.contains(*id)).cloned().collect();
    assert_eq!(result.existing_ids, expected_existing);
    assert_eq!(result.new_ids, expected_new);
    let mapped: HashSet<&String> = result.existing_map.keys().collect();
    assert_eq!(mapped, result.existing_ids.iter().collect());
}

#[tokio::test]
async fn test_fetch_isolates_a_failing_thread() {
    let threads: Vec<_> = (0..25).map(|i| thread(&format!("t{}", i), 1, 1)).collect();
    let ids: Vec<String> = threads.iter().map(|t| t.provider_thread_id.clone()).collect();
    let provider = ScriptedProvider::new(threads);
    provider.fail_thread("t13");

    let options = FetchOptions {
        concurrency: 4,
        batch_delay: Duration::ZERO,
    };
    let result = fetch_threads_parallel(&provider, &ids, options, |_| {}).await;

    assert_eq!(result.threads.len(), 24);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].provider_thread_id, "t13");
}

#[test]
fn test_phase_ranges_are_contiguous() {
    let now = Utc::now();
    let priority = get_phase_date_range(BackfillPhase::Priority, now).unwrap();
    let extended = get_phase_date_range(BackfillPhase::Extended, now).unwrap();
    let archive = get_phase_date_range(BackfillPhase::Archive, now).unwrap();

    assert_eq!(priority.after, Some(now - chrono::Duration::days(90)));
    assert!(priority.before.is_none());
    assert_eq!(extended.after, Some(now - chrono::Duration::days(365)));
    assert_eq!(extended.before, Some(now - chrono::Duration::days(90)));
    assert!(archive.after.is_none());
    assert_eq!(archive.before, Some(now - chrono::Duration::days(365)));
}

#[tokio::test]
async fn test_expired_cursor_falls_back_to_backfill() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1)]);
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");
    h.orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();
    let calls_after_backfill = h.provider.get_thread_calls();

    h.provider.set_changes(Ok(ChangeSet {
        changed_thread_ids: vec!["a".to_string()],
        ..ChangeSet::full_sync_required()
    }));
    let result = h.orchestrator.perform_incremental_sync(account.id).await.unwrap();
    assert!(!result.success);
    let failure = result.failure.clone().unwrap();
    assert_eq!(failure.code, SyncErrorCode::FullSyncRequired);
    assert!(!failure.retryable);
    assert_eq!(h.provider.get_thread_calls(), calls_after_backfill);

    let report = run_sync_sweep(h.orchestrator.clone()).await.unwrap();
    assert_eq!(report.needs_backfill, vec![account.id]);

    let restarted = h.orchestrator.start_backfill(account.id).unwrap();
    assert!(restarted.sync_cursor.is_none());
    assert_eq!(restarted.backfill_progress.phase, BackfillPhase::Priority);
    assert_eq!(restarted.status, AccountStatus::Active);
    assert!(restarted.last_sync_error.unwrap().starts_with("FULL_SYNC_REQUIRED"));
}

#[tokio::test]
async fn test_status_is_never_left_syncing() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1), thread("b", 1, 1)]);
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");
    h.store.save_sync_cursor(account.id, Some("delta-0")).unwrap();

    // Success
    h.provider.set_changes(Ok(ChangeSet::default()));
    h.orchestrator.perform_incremental_sync(account.id).await.unwrap();
    assert_eq!(h.account(account.id).status, AccountStatus::Active);

    // Partial failure
    h.provider.fail_thread("b");
    h.provider.set_changes(Ok(ChangeSet {
        changed_thread_ids: vec!["a".to_string(), "b".to_string()],
        ..ChangeSet::default()
    }));
    let partial = h.orchestrator.perform_incremental_sync(account.id).await.unwrap();
    assert_eq!(partial.failed_threads, 1);
    assert_eq!(h.account(account.id).status, AccountStatus::Active);

    // Provider error
    h.provider.set_changes(Err(ProviderError::RateLimited {
        retry_after: None,
        message: "slow down".to_string(),
    }));
    let err = h.orchestrator.perform_incremental_sync(account.id).await.unwrap_err();
    assert_eq!(err.code(), SyncErrorCode::RateLimited);
    assert_eq!(h.account(account.id).status, AccountStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_sync_releases_status() {
    let provider = ScriptedProvider::new(Vec::new());
    provider.delay_changes(Duration::from_secs(600));
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let account = h.connect("owner@example.com");
    h.store.save_sync_cursor(account.id, Some("delta-0")).unwrap();

    let timed_out = tokio::time::timeout(
        Duration::from_secs(1),
        h.orchestrator.perform_incremental_sync(account.id),
    )
    .await;
    assert!(timed_out.is_err());
    assert_eq!(h.account(account.id).status, AccountStatus::Active);
}

#[tokio::test]
async fn test_sweep_syncs_accounts_independently() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1)]);
    let h = Harness::new(Arc::new(InMemorySyncStore::new()), provider);
    let first = h.connect("one@example.com");
    let second = h.connect("two@example.com");
    let never_backfilled = h.connect("three@example.com");
    for id in [first.id, second.id] {
        h.store.save_sync_cursor(id, Some("delta-0")).unwrap();
    }
    h.provider.set_changes(Ok(ChangeSet {
        new_cursor: Some("delta-1".to_string()),
        changed_thread_ids: vec!["a".to_string()],
        ..ChangeSet::default()
    }));

    let report = run_sync_sweep(h.orchestrator.clone()).await.unwrap();
    assert_eq!(report.synced, vec![first.id, second.id]);
    assert!(report.failed.is_empty());

    for id in [first.id, second.id] {
        let account = h.account(id);
        assert_eq!(account.sync_cursor.as_deref(), Some("delta-1"));
        assert!(h.store.get_thread(id, "a").unwrap().is_some());
    }
    assert!(h.account(never_backfilled.id).sync_cursor.is_none());
}

#[tokio::test]
async fn test_events_follow_ingestion() {
    let provider = ScriptedProvider::new(vec![thread("a", 1, 1), thread("b", 2, 1)]);
    let store: Arc<dyn SyncStore> = Arc::new(InMemorySyncStore::new());
    let h = Harness::new(store.clone(), provider);
    let (sink, mut rx) = ChannelEventSink::new();
    let orchestrator = Arc::try_unwrap(h.orchestrator)
        .ok()
        .unwrap()
        .with_events(Arc::new(sink));

    let account = orchestrator
        .connect_account(7, mail_sync::Provider::Gmail, "owner@example.com", &common::valid_tokens())
        .unwrap();
    orchestrator
        .perform_backfill(account.id, BackfillPhase::Priority)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.is_new && e.org_id == 7 && e.account_id == account.id));
}
