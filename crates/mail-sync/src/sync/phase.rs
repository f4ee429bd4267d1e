//! Phased backfill: fixed calendar windows imported newest-first
//!
//! Each phase is one bounded unit of work: enumerate ids in its window,
//! drop the ones already stored, then fetch and ingest the rest in batches.
//! Progress is persisted after every batch so a restarted phase picks up
//! close to where it stopped.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use super::context::SyncContext;
use super::dedup::deduplicate_threads;
use super::fetch::{FetchOptions, collect_thread_ids, fetch_threads_parallel};
use super::ingest::{ProcessOptions, process_batch};
use super::timing::estimate_time_remaining;
use crate::error::SyncError;
use crate::models::{Account, BackfillPhase};

/// Lower edge of the priority window
pub const PRIORITY_WINDOW_DAYS: i64 = 90;
/// Lower edge of the extended window
pub const EXTENDED_WINDOW_DAYS: i64 = 365;

/// Runs of one phase allowed to end with retryable failures; the run that
/// reaches this count closes the phase regardless
pub const MAX_INCOMPLETE_RUNS: u32 = 3;

/// Time window for a phase: `after <= t < before`, open where `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDateRange {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// Window covered by `phase`, relative to `now`.
///
/// Priority, extended and archive partition time with shared edges, so no
/// thread falls between two phases. `Complete` has no window.
pub fn get_phase_date_range(phase: BackfillPhase, now: DateTime<Utc>) -> Option<PhaseDateRange> {
    let priority_edge = now - chrono::Duration::days(PRIORITY_WINDOW_DAYS);
    let extended_edge = now - chrono::Duration::days(EXTENDED_WINDOW_DAYS);

    match phase {
        BackfillPhase::Priority => Some(PhaseDateRange {
            after: Some(priority_edge),
            before: None,
        }),
        BackfillPhase::Extended => Some(PhaseDateRange {
            after: Some(extended_edge),
            before: Some(priority_edge),
        }),
        BackfillPhase::Archive => Some(PhaseDateRange {
            after: None,
            before: Some(extended_edge),
        }),
        BackfillPhase::Complete => None,
    }
}

/// Concurrency and pacing for a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTuning {
    pub concurrency: usize,
    /// Threads fetched and ingested per progress checkpoint
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Wall-clock budget for one invocation of the phase
    pub max_duration: Duration,
}

impl PhaseTuning {
    pub fn for_phase(phase: BackfillPhase) -> Option<Self> {
        let tuning = match phase {
            BackfillPhase::Priority => Self {
                concurrency: 20,
                batch_size: 100,
                batch_delay: Duration::ZERO,
                max_duration: Duration::from_secs(10 * 60),
            },
            BackfillPhase::Extended => Self {
                concurrency: 10,
                batch_size: 100,
                batch_delay: Duration::from_millis(100),
                max_duration: Duration::from_secs(30 * 60),
            },
            BackfillPhase::Archive => Self {
                concurrency: 5,
                batch_size: 50,
                batch_delay: Duration::from_millis(250),
                max_duration: Duration::from_secs(60 * 60),
            },
            BackfillPhase::Complete => return None,
        };
        Some(tuning)
    }

    pub fn with_batch_delay(mut self, delay: Option<Duration>) -> Self {
        if let Some(delay) = delay {
            self.batch_delay = delay;
        }
        self
    }
}

/// Result of one phase invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: BackfillPhase,
    /// Ids enumerated in the window
    pub total_threads: usize,
    pub new_threads: usize,
    /// Ids skipped by dedup before any fetch
    pub existing_threads: usize,
    pub failed_threads: usize,
    pub phase_complete: bool,
    /// Phase the account's progress now points at
    pub next_phase: BackfillPhase,
    /// Cursor saved for incremental sync, when this run established one
    pub new_cursor: Option<String>,
}

impl PhaseOutcome {
    fn skipped(phase: BackfillPhase, next_phase: BackfillPhase) -> Self {
        Self {
            phase,
            total_threads: 0,
            new_threads: 0,
            existing_threads: 0,
            failed_threads: 0,
            phase_complete: true,
            next_phase,
            new_cursor: None,
        }
    }
}

/// Fetch progress across every batch of one phase run
struct PhaseFetchProgress {
    started: Instant,
    to_fetch: usize,
    /// Ids handed to finished batches
    attempted: usize,
}

impl PhaseFetchProgress {
    fn new(to_fetch: usize) -> Self {
        Self {
            started: Instant::now(),
            to_fetch,
            attempted: 0,
        }
    }

    fn done(&self, in_batch: usize) -> usize {
        self.attempted + in_batch
    }

    fn eta(&self, in_batch: usize, elapsed: Duration) -> Option<Duration> {
        estimate_time_remaining(elapsed, self.done(in_batch), self.to_fetch)
    }
}

/// Run one backfill phase for `account`.
///
/// Per-thread failures are counted, not fatal. While retryable ones remain
/// the phase stays open (`phase_complete == false`) so the next run picks
/// up just those threads, up to [`MAX_INCOMPLETE_RUNS`]. A listing or
/// storage failure aborts the invocation with progress saved up to the
/// last finished batch. When the account has no change cursor yet, one is taken
/// before enumeration and stored once the phase completes, so changes
/// arriving during the backfill are picked up by the first incremental sync.
pub async fn run_phase(
    ctx: &SyncContext<'_>,
    account: &Account,
    phase: BackfillPhase,
    tuning: PhaseTuning,
) -> Result<PhaseOutcome, SyncError> {
    let mut progress = account.backfill_progress.clone();

    let Some(range) = get_phase_date_range(phase, ctx.now) else {
        return Ok(PhaseOutcome::skipped(phase, progress.phase));
    };
    if !progress.enter(phase, ctx.now) {
        info!(
            "[BACKFILL] Account {} already past {} (at {}), skipping",
            account.id, phase, progress.phase
        );
        return Ok(PhaseOutcome::skipped(phase, progress.phase));
    }
    ctx.store.save_backfill_progress(account.id, &progress)?;

    let pending_cursor = match &account.sync_cursor {
        Some(_) => None,
        None => Some(ctx.client.get_initial_cursor().await?),
    };

    info!(
        "[BACKFILL] Account {} phase {} starting (after {:?}, before {:?})",
        account.id, phase, range.after, range.before
    );

    let ids = collect_thread_ids(ctx.client, range.after, range.before).await?;
    progress.set_total(phase, ids.len());

    let dedup = deduplicate_threads(ctx.store, account.id, &ids)?;
    let mut outcome = PhaseOutcome {
        phase,
        total_threads: ids.len(),
        new_threads: 0,
        existing_threads: dedup.existing_ids.len(),
        failed_threads: 0,
        phase_complete: false,
        next_phase: phase,
        new_cursor: None,
    };

    let fetch_options = FetchOptions {
        concurrency: tuning.concurrency,
        batch_delay: tuning.batch_delay,
    };
    let batch_count = dedup.new_ids.len().div_ceil(tuning.batch_size.max(1));
    let mut fetch_progress = PhaseFetchProgress::new(dedup.new_ids.len());
    let mut retry_later = 0usize;

    for (index, batch) in dedup.new_ids.chunks(tuning.batch_size.max(1)).enumerate() {
        if index > 0 && !tuning.batch_delay.is_zero() {
            tokio::time::sleep(tuning.batch_delay).await;
        }

        let fetched = fetch_threads_parallel(ctx.client, batch, fetch_options, |p| {
            let elapsed = fetch_progress.started.elapsed();
            debug!(
                "[BACKFILL] Account {} {}: {}/{} fetched, eta {:?}",
                account.id,
                phase,
                fetch_progress.done(p.completed()),
                fetch_progress.to_fetch,
                fetch_progress.eta(p.completed(), elapsed)
            );
        })
        .await;
        fetch_progress.attempted += batch.len();

        let ingested = process_batch(
            ctx.store,
            account.id,
            &fetched.threads,
            ProcessOptions::backfill(),
            ctx.now,
        );
        ctx.emit_processed(account, &ingested.outcomes);

        let new = ingested.new_threads();
        let failed = fetched.hard_failures() + ingested.errors.len();
        outcome.new_threads += new;
        outcome.failed_threads += failed;
        retry_later += fetched.retryable_failures() + ingested.errors.len();

        progress.record_batch(phase, ingested.outcomes.len(), new, failed);
        ctx.store.save_backfill_progress(account.id, &progress)?;

        info!(
            "[BACKFILL] Account {} {} batch {}/{}: {} new, {} failed",
            account.id,
            phase,
            index + 1,
            batch_count,
            new,
            failed
        );
    }

    if retry_later > 0 {
        let runs = progress.record_incomplete(phase);
        if runs < MAX_INCOMPLETE_RUNS {
            ctx.store.save_backfill_progress(account.id, &progress)?;
            warn!(
                "[BACKFILL] Account {} phase {} left {} threads to retry (run {}/{})",
                account.id, phase, retry_later, runs, MAX_INCOMPLETE_RUNS
            );
            return Ok(outcome);
        }
        warn!(
            "[BACKFILL] Account {} phase {} closing with {} threads still failing after {} runs",
            account.id, phase, retry_later, runs
        );
    }

    progress.complete_phase(phase, ctx.now);
    ctx.store.save_backfill_progress(account.id, &progress)?;

    if let Some(cursor) = pending_cursor {
        ctx.store.save_sync_cursor(account.id, Some(&cursor))?;
        outcome.new_cursor = Some(cursor);
    }

    outcome.phase_complete = true;
    outcome.next_phase = progress.phase;

    info!(
        "[BACKFILL] Account {} phase {} complete: {} enumerated, {} existing, {} new, {} failed",
        account.id,
        phase,
        outcome.total_threads,
        outcome.existing_threads,
        outcome.new_threads,
        outcome.failed_threads
    );
    Ok(outcome)
}
