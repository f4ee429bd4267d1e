//! Deduplication of provider thread ids against persisted threads

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::storage::{SyncStore, Upserted};

/// Ids per lookup query, bounding query size on very large backfills
pub const DEDUP_CHUNK_SIZE: usize = 100;

/// Partition of a batch of provider thread ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupResult {
    /// Ids with no thread row yet, in input order
    pub new_ids: Vec<String>,
    /// Ids that already have a thread row, in input order
    pub existing_ids: Vec<String>,
    /// Provider id to local thread id, covering exactly `existing_ids`
    pub existing_map: HashMap<String, i64>,
}

/// Split `provider_thread_ids` into new and already-persisted ids.
///
/// Read-only. Repeated ids in the input are reported once.
pub fn deduplicate_threads(
    store: &dyn SyncStore,
    account_id: i64,
    provider_thread_ids: &[String],
) -> Result<DedupResult> {
    let mut seen = HashSet::new();
    let unique: Vec<String> = provider_thread_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    let mut existing_map = HashMap::new();
    for chunk in unique.chunks(DEDUP_CHUNK_SIZE) {
        existing_map.extend(store.find_thread_ids(account_id, chunk)?);
    }

    let (existing_ids, new_ids): (Vec<String>, Vec<String>) = unique
        .into_iter()
        .partition(|id| existing_map.contains_key(id));

    debug!(
        "[SYNC] Dedup for account {}: {} new, {} existing",
        account_id,
        new_ids.len(),
        existing_ids.len()
    );

    Ok(DedupResult {
        new_ids,
        existing_ids,
        existing_map,
    })
}

/// Make sure a thread row exists before its full data is available,
/// returning its id and whether this call created it
pub fn get_or_create_thread_id(
    store: &dyn SyncStore,
    account_id: i64,
    provider_thread_id: &str,
    now: DateTime<Utc>,
) -> Result<Upserted> {
    store.ensure_thread(account_id, provider_thread_id, now)
}
