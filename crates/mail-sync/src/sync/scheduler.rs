//! Periodic sweeps and backfill chaining
//!
//! The daemon calls these on a timer. Accounts run independently and
//! concurrently; phases of one account run strictly one after another.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use super::orchestrator::SyncOrchestrator;
use super::phase::PhaseTuning;
use super::timing::cooldown_elapsed;
use crate::error::SyncError;
use crate::models::{Account, BackfillPhase};

/// Pause before retrying a failed phase
const PHASE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Active accounts with a cursor that have not synced within `min_interval`
pub fn due_accounts(
    accounts: &[Account],
    now: DateTime<Utc>,
    min_interval: chrono::Duration,
) -> Vec<i64> {
    accounts
        .iter()
        .filter(|a| a.is_active() && a.sync_cursor.is_some())
        .filter(|a| cooldown_elapsed(a.last_sync_at, now, min_interval))
        .map(|a| a.id)
        .collect()
}

/// Active accounts whose backfill has not finished: newly connected ones
/// (no cursor yet) and ones whose last chain stopped early
pub fn pending_backfills(accounts: &[Account]) -> Vec<i64> {
    accounts
        .iter()
        .filter(|a| a.is_active() && !a.backfill_progress.is_complete())
        .map(|a| a.id)
        .collect()
}

/// What one sync sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub synced: Vec<i64>,
    pub failed: Vec<i64>,
    /// Accounts whose cursor expired; a backfill must be started
    pub needs_backfill: Vec<i64>,
    /// Accounts skipped because another run held them
    pub busy: Vec<i64>,
}

/// Run an incremental sync for every due account, concurrently
pub async fn run_sync_sweep(orchestrator: Arc<SyncOrchestrator>) -> anyhow::Result<SweepReport> {
    let accounts = orchestrator.store().list_accounts()?;
    let now = orchestrator.clock().now();
    let due = due_accounts(&accounts, now, orchestrator.config().min_sync_interval());

    let mut report = SweepReport::default();
    if due.is_empty() {
        return Ok(report);
    }
    info!("[SCHED] Sync sweep: {} of {} accounts due", due.len(), accounts.len());

    let mut tasks = JoinSet::new();
    for account_id in due {
        let orchestrator = orchestrator.clone();
        tasks.spawn(async move {
            let result = orchestrator.perform_incremental_sync(account_id).await;
            (account_id, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(result))) if result.needs_backfill() => report.needs_backfill.push(id),
            Ok((id, Ok(_))) => report.synced.push(id),
            Ok((id, Err(SyncError::AlreadySyncing))) => report.busy.push(id),
            Ok((id, Err(e))) => {
                warn!("[SCHED] Sync failed for account {}: {}", id, e);
                report.failed.push(id);
            }
            Err(e) => error!("[SCHED] Sync task panicked: {}", e),
        }
    }

    report.synced.sort_unstable();
    report.failed.sort_unstable();
    report.needs_backfill.sort_unstable();
    report.busy.sort_unstable();
    Ok(report)
}

/// Refresh tokens expiring within the configured horizon. Returns
/// (refreshed, failed) counts.
pub async fn run_token_refresh_sweep(orchestrator: Arc<SyncOrchestrator>) -> anyhow::Result<(usize, usize)> {
    let now = orchestrator.clock().now();
    let horizon = orchestrator.config().token_refresh_horizon();
    let expiring: Vec<i64> = orchestrator
        .store()
        .list_accounts()?
        .into_iter()
        .filter(|a| a.is_active() && a.token_expires_within(now, horizon))
        .map(|a| a.id)
        .collect();

    let mut tasks = JoinSet::new();
    for account_id in expiring {
        let orchestrator = orchestrator.clone();
        tasks.spawn(async move { orchestrator.refresh_account_token(account_id).await });
    }

    let (mut refreshed, mut failed) = (0, 0);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => refreshed += 1,
            Ok(Err(_)) => failed += 1,
            Err(e) => {
                error!("[SCHED] Token refresh task panicked: {}", e);
                failed += 1;
            }
        }
    }

    if refreshed + failed > 0 {
        info!("[SCHED] Token refresh: {} refreshed, {} failed", refreshed, failed);
    }
    Ok((refreshed, failed))
}

/// Run the account's remaining backfill phases in order.
///
/// Each phase gets its own time budget. A phase that errors, times out or
/// ends with threads left to retry is run again up to `max_attempts` times;
/// dedup makes a retry resume close to where the last attempt stopped. Returns the phase the account ended on.
pub async fn run_backfill_chain(
    orchestrator: Arc<SyncOrchestrator>,
    account_id: i64,
    max_attempts: u32,
) -> Result<BackfillPhase, SyncError> {
    loop {
        let account = orchestrator
            .store()
            .get_account(account_id)?
            .ok_or(SyncError::AccountNotFound(account_id))?;
        let phase = account.backfill_progress.phase;
        let Some(tuning) = PhaseTuning::for_phase(phase) else {
            info!("[BACKFILL] Account {} backfill complete", account_id);
            return Ok(phase);
        };

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let run = tokio::time::timeout(
                tuning.max_duration,
                orchestrator.perform_backfill(account_id, phase),
            )
            .await;

            let err = match run {
                Ok(Ok(outcome)) if outcome.phase_complete => break outcome,
                Ok(Ok(outcome)) => SyncError::PhaseIncomplete {
                    phase,
                    failed: outcome.failed_threads,
                },
                Ok(Err(e)) => e,
                Err(_) => {
                    warn!(
                        "[BACKFILL] Account {} phase {} exceeded {:?}",
                        account_id, phase, tuning.max_duration
                    );
                    SyncError::PhaseTimeout(phase)
                }
            };

            let retryable = err.code().is_retryable() && !matches!(err, SyncError::NotEligible { .. });
            if !retryable || attempt >= max_attempts {
                error!(
                    "[BACKFILL] Account {} phase {} giving up after {} attempts: {}",
                    account_id, phase, attempt, err
                );
                return Err(err);
            }
            warn!(
                "[BACKFILL] Account {} phase {} attempt {} failed, retrying: {}",
                account_id, phase, attempt, err
            );
            tokio::time::sleep(PHASE_RETRY_DELAY).await;
        };

        if !outcome.phase_complete || outcome.next_phase == phase {
            // Nothing advanced; stop rather than spin
            return Ok(outcome.next_phase);
        }
    }
}
