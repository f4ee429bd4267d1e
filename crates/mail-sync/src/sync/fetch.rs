//! Cheap id enumeration and bounded-concurrency thread fetching

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::timing::estimate_time_remaining;
use crate::models::ProviderThread;
use crate::provider::{ListThreadsOptions, ProviderClient, ProviderError};

/// Tuning for [`fetch_threads_parallel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// `get_thread` calls in flight at once
    pub concurrency: usize,
    /// Pause between windows
    pub batch_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_delay: Duration::ZERO,
        }
    }
}

/// Cumulative progress reported after every window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub fetched: usize,
    pub failed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl FetchProgress {
    pub fn completed(&self) -> usize {
        self.fetched + self.failed
    }

    pub fn estimated_remaining(&self) -> Option<Duration> {
        estimate_time_remaining(self.elapsed, self.completed(), self.total)
    }
}

/// A thread that could not be fetched
#[derive(Debug, Clone)]
pub struct FetchError {
    pub provider_thread_id: String,
    pub error: ProviderError,
}

/// Everything a fetch run managed to retrieve, plus what failed
#[derive(Debug, Default)]
pub struct FetchResult {
    pub threads: Vec<ProviderThread>,
    pub errors: Vec<FetchError>,
}

impl FetchResult {
    /// Ids the provider reports as gone
    pub fn not_found_ids(&self) -> impl Iterator<Item = &str> {
        self.errors
            .iter()
            .filter(|e| e.error.is_not_found())
            .map(|e| e.provider_thread_id.as_str())
    }

    /// Failures other than "gone"
    pub fn hard_failures(&self) -> usize {
        self.errors.iter().filter(|e| !e.error.is_not_found()).count()
    }

    /// Failures a later attempt may get past
    pub fn retryable_failures(&self) -> usize {
        self.errors.iter().filter(|e| e.error.is_retryable()).count()
    }
}

/// Fetch full threads in windows of `options.concurrency` concurrent calls.
///
/// A failed id is recorded in `errors` and never aborts its window; the
/// result always carries every thread that could be fetched.
pub async fn fetch_threads_parallel(
    client: &dyn ProviderClient,
    provider_thread_ids: &[String],
    options: FetchOptions,
    mut on_progress: impl FnMut(&FetchProgress),
) -> FetchResult {
    let start = Instant::now();
    let mut result = FetchResult::default();
    let total = provider_thread_ids.len();

    for (i, window) in provider_thread_ids
        .chunks(options.concurrency.max(1))
        .enumerate()
    {
        if i > 0 && !options.batch_delay.is_zero() {
            tokio::time::sleep(options.batch_delay).await;
        }

        let fetched = join_all(window.iter().map(|id| client.get_thread(id))).await;

        for (id, outcome) in window.iter().zip(fetched) {
            match outcome {
                Ok(thread) => result.threads.push(thread),
                Err(error) => {
                    if error.is_not_found() {
                        debug!("[FETCH] Thread {} no longer exists", id);
                    } else {
                        warn!("[FETCH] Failed to fetch thread {}: {}", id, error);
                    }
                    result.errors.push(FetchError {
                        provider_thread_id: id.clone(),
                        error,
                    });
                }
            }
        }

        on_progress(&FetchProgress {
            fetched: result.threads.len(),
            failed: result.errors.len(),
            total,
            elapsed: start.elapsed(),
        });
    }

    result
}

/// Page through `list_threads` collecting ids in `[after, before)`.
///
/// Uses the provider's largest page size; ids repeated across pages are
/// kept once, in first-seen order.
pub async fn collect_thread_ids(
    client: &dyn ProviderClient,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<String>, ProviderError> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut page_token = None;
    let mut pages = 0usize;

    loop {
        let options = ListThreadsOptions {
            page_size: client.max_page_size(),
            page_token: page_token.take(),
            after,
            before,
        };
        let page = client.list_threads(&options).await?;
        pages += 1;

        for thread in page.threads {
            if seen.insert(thread.provider_thread_id.clone()) {
                ids.push(thread.provider_thread_id);
            }
        }

        match page.next_page_token {
            Some(token) if !token.is_empty() => page_token = Some(token),
            _ => break,
        }
    }

    info!(
        "[FETCH] Enumerated {} thread ids over {} pages",
        ids.len(),
        pages
    );
    Ok(ids)
}
