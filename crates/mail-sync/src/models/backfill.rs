//! Backfill progress tracking
//!
//! Replaces the single `initial_sync_complete` flag of a one-shot import with
//! a phase cursor that only moves forward through
//! priority → extended → archive → complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A time-window slice of a backfill
///
/// Variants are declared in execution order; the derived `Ord` is relied on
/// for the forward-only check.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackfillPhase {
    #[default]
    Priority,
    Extended,
    Archive,
    Complete,
}

impl BackfillPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillPhase::Priority => "priority",
            BackfillPhase::Extended => "extended",
            BackfillPhase::Archive => "archive",
            BackfillPhase::Complete => "complete",
        }
    }

    /// The phase that follows this one (`Complete` is terminal)
    pub fn next(&self) -> BackfillPhase {
        match self {
            BackfillPhase::Priority => BackfillPhase::Extended,
            BackfillPhase::Extended => BackfillPhase::Archive,
            BackfillPhase::Archive | BackfillPhase::Complete => BackfillPhase::Complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        *self == BackfillPhase::Complete
    }
}

impl fmt::Display for BackfillPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(BackfillPhase::Priority),
            "extended" => Ok(BackfillPhase::Extended),
            "archive" => Ok(BackfillPhase::Archive),
            "complete" => Ok(BackfillPhase::Complete),
            other => anyhow::bail!("Unknown backfill phase: {}", other),
        }
    }
}

/// Counters for a single phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCounters {
    /// Thread ids enumerated in the phase window
    pub total_threads: usize,
    /// Threads fetched and ingested
    pub processed_threads: usize,
    /// Threads created by this phase
    pub new_threads: usize,
    /// Threads that failed to fetch or ingest
    pub failed_threads: usize,
    /// Runs that ended with failures worth retrying
    #[serde(default)]
    pub incomplete_runs: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted backfill state for an account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillProgress {
    /// Phase currently being (or next to be) executed
    pub phase: BackfillPhase,
    pub phases: BTreeMap<BackfillPhase, PhaseCounters>,
    /// Per-thread errors accumulated across all phases
    pub error_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackfillProgress {
    /// Fresh progress for a newly connected (or reconnected) account
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Self::default()
        }
    }

    /// Whether `phase` may run: the current phase may be re-entered on retry,
    /// later phases may be entered, earlier ones may not.
    pub fn can_enter(&self, phase: BackfillPhase) -> bool {
        phase >= self.phase && !phase.is_complete()
    }

    /// Enter `phase`, returning false (and leaving state untouched) if that
    /// would move the cursor backward.
    pub fn enter(&mut self, phase: BackfillPhase, now: DateTime<Utc>) -> bool {
        if !self.can_enter(phase) {
            return false;
        }
        self.phase = phase;
        self.started_at.get_or_insert(now);
        let counters = self.phases.entry(phase).or_default();
        counters.started_at.get_or_insert(now);
        true
    }

    /// Counters for `phase`, if it has been entered
    pub fn counters(&self, phase: BackfillPhase) -> Option<&PhaseCounters> {
        self.phases.get(&phase)
    }

    /// Record the enumeration size of a phase
    pub fn set_total(&mut self, phase: BackfillPhase, total_threads: usize) {
        self.phases.entry(phase).or_default().total_threads = total_threads;
    }

    /// Record the outcome of one fetch+ingest batch
    pub fn record_batch(&mut self, phase: BackfillPhase, processed: usize, new: usize, failed: usize) {
        let counters = self.phases.entry(phase).or_default();
        counters.processed_threads += processed;
        counters.new_threads += new;
        counters.failed_threads += failed;
        self.error_count = self.error_count.saturating_add(failed as u32);
    }

    /// Note a run of `phase` that left threads to retry; returns how many
    /// such runs the phase has had
    pub fn record_incomplete(&mut self, phase: BackfillPhase) -> u32 {
        let counters = self.phases.entry(phase).or_default();
        counters.incomplete_runs += 1;
        counters.incomplete_runs
    }

    /// Mark `phase` finished and advance the cursor to the following phase
    pub fn complete_phase(&mut self, phase: BackfillPhase, now: DateTime<Utc>) {
        self.phases.entry(phase).or_default().completed_at = Some(now);
        if phase >= self.phase {
            self.phase = phase.next();
        }
        if self.phase.is_complete() {
            self.completed_at.get_or_insert(now);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_complete()
    }
}
