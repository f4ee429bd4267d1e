//! Collaborators shared by one phase or incremental run

use chrono::{DateTime, Utc};

use super::ingest::ProcessOutcome;
use crate::events::{EventSink, ThreadProcessed};
use crate::models::Account;
use crate::provider::ProviderClient;
use crate::storage::SyncStore;

/// Borrowed handles for a single run, with the run's reference time pinned
pub struct SyncContext<'a> {
    pub store: &'a dyn SyncStore,
    pub client: &'a dyn ProviderClient,
    pub events: &'a dyn EventSink,
    pub now: DateTime<Utc>,
}

impl SyncContext<'_> {
    /// Emit a signal for every thread that was created or changed
    pub fn emit_processed(&self, account: &Account, outcomes: &[ProcessOutcome]) -> usize {
        let mut emitted = 0;
        for outcome in outcomes.iter().filter(|o| o.changed()) {
            self.events.thread_processed(ThreadProcessed {
                thread_id: outcome.thread_id,
                account_id: account.id,
                org_id: account.org_id,
                is_new: outcome.is_new,
            });
            emitted += 1;
        }
        emitted
    }
}
