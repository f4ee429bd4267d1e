//! Sync timing utilities for throttling and progress estimates
//!
//! Pure functions; callers pass the current time in.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Check if enough time has elapsed since the last sync to allow a new one.
///
/// This is a best-effort throttle: clock skew or two concurrent triggers can
/// both pass it. Correctness rests on the status compare-and-swap and on
/// idempotent ingestion, not on this check.
///
/// # Arguments
/// * `last_sync_at` - When the last sync finished (None if never synced)
/// * `now` - Current time
/// * `cooldown` - Minimum time that must elapse between syncs
pub fn cooldown_elapsed(
    last_sync_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: chrono::Duration,
) -> bool {
    match last_sync_at {
        Some(last) => now - last >= cooldown,
        None => true, // Never synced, so cooldown has "elapsed"
    }
}

/// Linear extrapolation of the time left from the rate observed so far.
///
/// Returns `None` until at least one item has completed.
pub fn estimate_time_remaining(elapsed: Duration, done: usize, total: usize) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let remaining = total.saturating_sub(done) as f64;
    Some(elapsed.mul_f64(remaining / done as f64))
}
