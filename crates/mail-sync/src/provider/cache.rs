//! Caller-owned cache of provider clients keyed by account

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::ProviderClient;
use crate::clock::Clock;

struct CacheEntry {
    client: Arc<dyn ProviderClient>,
    inserted_at: DateTime<Utc>,
}

/// Reuses clients (and their in-memory token state) across syncs of one account.
///
/// Entries expire `ttl` after insertion. Nothing runs in the background; the
/// owner calls [`ClientCache::evict_expired`] periodically.
pub struct ClientCache {
    entries: Mutex<HashMap<i64, CacheEntry>>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl ClientCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: chrono::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    /// Cached client for an account, if present and not expired
    pub fn get(&self, account_id: i64) -> Option<Arc<dyn ProviderClient>> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&account_id)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.client.clone())
    }

    /// Return the cached client or build and cache a new one
    pub fn get_or_try_insert<E>(
        &self,
        account_id: i64,
        create: impl FnOnce() -> Result<Arc<dyn ProviderClient>, E>,
    ) -> Result<Arc<dyn ProviderClient>, E> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get(&account_id)
            && !self.is_expired(entry, now)
        {
            return Ok(entry.client.clone());
        }

        let client = create()?;
        entries.insert(
            account_id,
            CacheEntry {
                client: client.clone(),
                inserted_at: now,
            },
        );
        Ok(client)
    }

    /// Drop the client for an account (e.g. after reconnect or auth failure)
    pub fn invalidate(&self, account_id: i64) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&account_id)
            .is_some()
    }

    /// Remove expired entries, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("[CACHE] Evicted {} expired provider clients", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now >= entry.inserted_at + self.ttl
    }
}
